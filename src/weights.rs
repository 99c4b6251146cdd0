use crate::math::Matrix;
use crate::models::StyleTransferModel;
use serde::{Deserialize, Serialize};
use std::{fs, io};

#[derive(Serialize, Deserialize)]
pub struct LayerJson {
    pub w: Vec<Vec<f32>>,
    pub b: Vec<f32>,
}

/// All affine parameters of the model, in the stable order
/// [`StyleTransferModel::all_parameters`] yields them.
#[derive(Serialize, Deserialize)]
pub struct CheckpointJson {
    pub layers: Vec<LayerJson>,
}

/// Convert a [`Matrix`] into a 2-D `Vec` for serialisation.
pub fn matrix_to_vec2(m: &Matrix) -> Vec<Vec<f32>> {
    (0..m.rows)
        .map(|r| (0..m.cols).map(|c| m.get(r, c)).collect())
        .collect()
}

/// Convert a 2-D `Vec` into a [`Matrix`].
pub fn vec2_to_matrix(rows: &[Vec<f32>]) -> Matrix {
    if rows.is_empty() || rows[0].is_empty() {
        return Matrix::zeros(0, 0);
    }
    let r = rows.len();
    let c = rows[0].len();
    let mut mat = Matrix::zeros(r, c);
    for (i, row) in rows.iter().enumerate() {
        for (j, &val) in row.iter().enumerate() {
            mat.set(i, j, val);
        }
    }
    mat
}

pub fn save_model(path: &str, model: &mut StyleTransferModel) -> Result<(), io::Error> {
    let layers: Vec<LayerJson> = model
        .all_parameters()
        .iter()
        .map(|p| LayerJson {
            w: matrix_to_vec2(&p.w),
            b: p.b.clone(),
        })
        .collect();
    let txt = serde_json::to_string(&CheckpointJson { layers })
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    if let Some(parent) = std::path::Path::new(path).parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, txt)?;
    crate::info!("saved weights to {path}");
    Ok(())
}

pub fn load_model(path: &str, model: &mut StyleTransferModel) -> Result<(), io::Error> {
    let txt = fs::read_to_string(path)?;
    let ckpt: CheckpointJson =
        serde_json::from_str(&txt).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let mut params = model.all_parameters();
    if ckpt.layers.len() != params.len() {
        crate::warn!(
            "checkpoint has {} layers, model has {}; loading the overlap",
            ckpt.layers.len(),
            params.len()
        );
    }
    for (p, layer) in params.iter_mut().zip(ckpt.layers.iter()) {
        let w = vec2_to_matrix(&layer.w);
        if w.rows == p.w.rows && w.cols == p.w.cols {
            p.w = w;
        } else {
            crate::warn!(
                "skipping layer with shape {}x{}, expected {}x{}",
                w.rows,
                w.cols,
                p.w.rows,
                p.w.cols
            );
        }
        if layer.b.len() == p.b.len() {
            p.b = layer.b.clone();
        }
    }
    crate::info!("loaded weights from {path}");
    Ok(())
}
