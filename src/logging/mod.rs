//! Logging and output control
//!
//! This module provides the [`Logger`] used by every component to report
//! progress. Verbosity follows a [`LogLevel`], normally taken from
//! `PLUGIN_LOG_LEVEL`. Errors always go to stderr.

use crate::error::RegistryError;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "" | "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(RegistryError::Configuration(format!(
                "Unknown log level '{}': expected trace, debug, info, warn or error",
                other
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub level: LogLevel,
    pub start_time: Instant,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            start_time: Instant::now(),
        }
    }

    /// Logger that only reports errors, used by tests
    pub fn new_quiet() -> Self {
        Self::new(LogLevel::Error)
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if self.enabled(LogLevel::Info) {
            println!("\n=== {} ===", title);
        }
    }

    /// Sub-section heading
    pub fn subsection(&self, title: &str) {
        if self.enabled(LogLevel::Info) {
            println!("\n--- {} ---", title);
        }
    }

    pub fn trace(&self, message: &str) {
        if self.enabled(LogLevel::Trace) {
            println!("🔍 TRACE: {}", message);
        }
    }

    pub fn debug(&self, message: &str) {
        if self.enabled(LogLevel::Debug) {
            println!("🐛 DEBUG: {}", message);
        }
    }

    /// Detailed information (debug level, indented)
    pub fn detail(&self, message: &str) {
        if self.enabled(LogLevel::Debug) {
            println!("   {}", message);
        }
    }

    /// Information message
    pub fn info(&self, message: &str) {
        if self.enabled(LogLevel::Info) {
            println!("ℹ️  {}", message);
        }
    }

    /// Step information
    pub fn step(&self, message: &str) {
        if self.enabled(LogLevel::Info) {
            println!("▶️  {}", message);
        }
    }

    /// Success message
    pub fn success(&self, message: &str) {
        if self.enabled(LogLevel::Info) {
            println!("✅ {}", message);
        }
    }

    /// Warning message
    pub fn warning(&self, message: &str) {
        if self.enabled(LogLevel::Warn) {
            eprintln!("⚠️  WARNING: {}", message);
        }
    }

    /// Error message
    pub fn error(&self, message: &str) {
        eprintln!("❌ ERROR: {}", message);
    }

    /// Key-value pair summary display
    pub fn summary_kv(&self, title: &str, items: &[(&str, String)]) {
        if self.enabled(LogLevel::Info) {
            self.subsection(title);
            for (key, value) in items {
                println!("  {}: {}", key, value);
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Format byte counts in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs == 0 {
            format!("{}ms", duration.as_millis())
        } else if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!(matches!(
            "loud".parse::<LogLevel>(),
            Err(RegistryError::Configuration(_))
        ));
    }

    #[test]
    fn test_level_gating() {
        let logger = Logger::new(LogLevel::Warn);
        assert!(logger.enabled(LogLevel::Error));
        assert!(logger.enabled(LogLevel::Warn));
        assert!(!logger.enabled(LogLevel::Info));
    }

    #[test]
    fn test_format_helpers() {
        let logger = Logger::new_quiet();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(1536), "1.5 KB");
        assert_eq!(logger.format_size(3 * 1024 * 1024), "3.0 MB");
        assert_eq!(logger.format_duration(Duration::from_secs(75)), "1m15s");
        assert_eq!(logger.format_duration(Duration::from_millis(250)), "250ms");
    }
}
