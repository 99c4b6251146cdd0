use criterion::{criterion_group, criterion_main, Criterion};

use styleflip::math::Matrix;
use styleflip::models::Encoder;

fn bench_encoder_forward(c: &mut Criterion) {
    let encoder = Encoder::new(100, 700);
    let batch = 16;
    let time = 20;
    let inputs: Vec<Matrix> = (0..time)
        .map(|t| {
            Matrix::from_vec(
                batch,
                100,
                (0..batch * 100)
                    .map(|i| ((i + t) % 17) as f32 * 0.01 - 0.08)
                    .collect(),
            )
        })
        .collect();
    let lengths = vec![time; batch];
    c.bench_function("encoder_forward_16x20", |b| {
        b.iter(|| encoder.forward(&inputs, &lengths))
    });
}

criterion_group!(benches, bench_encoder_forward);
criterion_main!(benches);
