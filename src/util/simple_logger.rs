use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity levels, most severe first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
}

impl LogLevel {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            _ => None,
        }
    }
}

static LOG_LEVEL: AtomicUsize = AtomicUsize::new(LogLevel::Info as usize);

/// Set the global log level.
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as usize, Ordering::Relaxed);
}

/// Pick up the level from the `LOG_LEVEL` environment variable, if set.
pub fn init_from_env() {
    if let Some(level) = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|s| LogLevel::parse(&s))
    {
        set_log_level(level);
    }
}

/// Check if a message at `level` should be logged.
pub fn enabled(level: LogLevel) -> bool {
    level as usize <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Seconds-and-millis since the epoch, for line prefixes.
pub fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        if $crate::util::simple_logger::enabled($crate::util::simple_logger::LogLevel::Info) {
            let ts = $crate::util::simple_logger::timestamp();
            println!("[INFO {ts}] {}", format!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        if $crate::util::simple_logger::enabled($crate::util::simple_logger::LogLevel::Warn) {
            let ts = $crate::util::simple_logger::timestamp();
            eprintln!("[WARN {ts}] {}", format!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        if $crate::util::simple_logger::enabled($crate::util::simple_logger::LogLevel::Error) {
            let ts = $crate::util::simple_logger::timestamp();
            eprintln!("[ERROR {ts}] {}", format!($($arg)*));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_gates_less_severe_messages() {
        set_log_level(LogLevel::Warn);
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Warn));
        assert!(!enabled(LogLevel::Info));
        set_log_level(LogLevel::Info);
    }
}
