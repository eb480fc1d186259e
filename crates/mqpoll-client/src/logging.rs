//! Logging setup.
//!
//! The library itself only uses the `log` facade. [`init`] installs an
//! `env_logger` backend for programs that want one, configured from
//! [`LogConfig`] and the classic trace variables:
//!
//! - `MQTT_C_CLIENT_TRACE`: `ON`, `stdout`, `stderr` or a file path
//! - `MQTT_C_CLIENT_TRACE_LEVEL`: `ERROR`, `PROTOCOL`, `MINIMUM`, `MEDIUM`
//!   or `MAXIMUM`
//! - `MQTT_C_CLIENT_TRACE_MAX_LINES`: lines per file before it is rotated
//!   to `<path>.0`

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use env_logger::{Env, Target};
use serde::Deserialize;

use crate::settings::SettingsError;

pub const TRACE_VAR: &str = "MQTT_C_CLIENT_TRACE";
pub const TRACE_LEVEL_VAR: &str = "MQTT_C_CLIENT_TRACE_LEVEL";
pub const TRACE_MAX_LINES_VAR: &str = "MQTT_C_CLIENT_TRACE_MAX_LINES";

pub const DEFAULT_MAX_LINES: usize = 1000;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive: error, warn, info, debug, trace.
    pub level: String,
    /// `stdout`, `stderr` or a file path. Unset means stderr.
    pub target: Option<String>,
    /// Lines written to a log file before it is rotated.
    pub max_lines: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            target: None,
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

impl LogConfig {
    /// Apply the `MQTT_C_CLIENT_TRACE*` variables on top of `self`.
    pub fn with_trace_env(mut self) -> Self {
        if let Ok(target) = std::env::var(TRACE_VAR) {
            self.target = Some(match target.as_str() {
                "ON" | "on" => "stdout".to_string(),
                _ => target,
            });
            // Tracing switched on without a level means "everything".
            if std::env::var(TRACE_LEVEL_VAR).is_err() {
                self.level = "trace".to_string();
            }
        }
        if let Some(level) = std::env::var(TRACE_LEVEL_VAR)
            .ok()
            .and_then(|v| trace_level(&v))
        {
            self.level = level.to_string();
        }
        if let Some(lines) = std::env::var(TRACE_MAX_LINES_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.max_lines = lines;
        }
        self
    }
}

/// Map a trace level name onto a `log` level.
pub fn trace_level(name: &str) -> Option<&'static str> {
    match name.to_ascii_uppercase().as_str() {
        "ERROR" | "SEVERE" | "FATAL" => Some("error"),
        "PROTOCOL" => Some("info"),
        "MINIMUM" | "MEDIUM" => Some("debug"),
        "MAXIMUM" => Some("trace"),
        _ => None,
    }
}

/// Install the global logger. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<(), SettingsError> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(&config.level));
    match config.target.as_deref() {
        None | Some("stderr") => {
            builder.target(Target::Stderr);
        }
        Some("stdout") => {
            builder.target(Target::Stdout);
        }
        Some(path) => {
            let file = RotatingFile::open(path, config.max_lines)?;
            builder.target(Target::Pipe(Box::new(file)));
        }
    }
    builder.try_init()?;
    Ok(())
}

/// Log file that moves itself to `<path>.0` after `max_lines` lines.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    lines: usize,
    max_lines: usize,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, max_lines: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            lines: 0,
            max_lines: max_lines.max(1),
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let mut backup = self.path.clone().into_os_string();
        backup.push(".0");
        fs::rename(&self.path, backup)?;
        self.file = File::create(&self.path)?;
        self.lines = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.lines >= self.max_lines {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.lines += buf[..written].iter().filter(|&&b| b == b'\n').count();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_levels() {
        assert_eq!(trace_level("ERROR"), Some("error"));
        assert_eq!(trace_level("protocol"), Some("info"));
        assert_eq!(trace_level("MEDIUM"), Some("debug"));
        assert_eq!(trace_level("MAXIMUM"), Some("trace"));
        assert_eq!(trace_level("LOUD"), None);
    }

    #[test]
    fn test_trace_env() {
        std::env::set_var(TRACE_VAR, "ON");
        std::env::set_var(TRACE_LEVEL_VAR, "PROTOCOL");
        std::env::set_var(TRACE_MAX_LINES_VAR, "50");
        let config = LogConfig::default().with_trace_env();
        std::env::remove_var(TRACE_VAR);
        std::env::remove_var(TRACE_LEVEL_VAR);
        std::env::remove_var(TRACE_MAX_LINES_VAR);

        assert_eq!(config.target.as_deref(), Some("stdout"));
        assert_eq!(config.level, "info");
        assert_eq!(config.max_lines, 50);
    }

    #[test]
    fn test_file_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let mut file = RotatingFile::open(&path, 2).unwrap();
        file.write_all(b"one\n").unwrap();
        file.write_all(b"two\n").unwrap();
        file.write_all(b"three\n").unwrap();
        file.flush().unwrap();

        let backup = dir.path().join("trace.log.0");
        assert_eq!(fs::read_to_string(backup).unwrap(), "one\ntwo\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "three\n");
    }
}
