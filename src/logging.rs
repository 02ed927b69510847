//! Logging for toolbridge.
//!
//! Timestamped, level-filtered lines on stderr. The threshold comes from the
//! `TOOLBRIDGE_LOG` environment variable (`debug`, `info`, `warn`, `error`,
//! `off`); default is `info`. Tests can capture emitted lines instead.

use chrono::Local;
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }
}

fn threshold() -> Level {
    static THRESHOLD: OnceLock<Level> = OnceLock::new();
    *THRESHOLD.get_or_init(|| {
        match std::env::var("TOOLBRIDGE_LOG")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "debug" => Level::Debug,
            "warn" => Level::Warn,
            "error" => Level::Error,
            "off" => Level::Off,
            _ => Level::Info,
        }
    })
}

static CAPTURE: Mutex<Option<Vec<String>>> = Mutex::new(None);

/// Start capturing log lines instead of writing them to stderr.
/// Intended for tests that assert on emitted warnings.
pub fn capture_begin() {
    if let Ok(mut capture) = CAPTURE.lock() {
        *capture = Some(Vec::new());
    }
}

/// Stop capturing and return everything captured since `capture_begin`.
pub fn capture_take() -> Vec<String> {
    CAPTURE
        .lock()
        .ok()
        .and_then(|mut capture| capture.take())
        .unwrap_or_default()
}

fn log(level: Level, msg: &str) {
    let line = format!(
        "[{}] {:5} {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level.label(),
        msg
    );
    if let Ok(mut capture) = CAPTURE.lock() {
        if let Some(lines) = capture.as_mut() {
            lines.push(line);
            return;
        }
    }
    if level >= threshold() {
        eprintln!("{}", line);
    }
}

pub fn debug(msg: &str) {
    log(Level::Debug, msg);
}

pub fn info(msg: &str) {
    log(Level::Info, msg);
}

pub fn warn(msg: &str) {
    log(Level::Warn, msg);
}

pub fn error(msg: &str) {
    log(Level::Error, msg);
}
