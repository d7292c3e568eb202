use std::sync::Arc;

use crate::utils::format::bytes_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for frame display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw frame bytes only
    Raw,
    /// Show a readable summary of the frame
    Interpreted,
    /// Show both summary and raw bytes
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger sink injected into connectors and machines
///
/// The default logger is disabled and costs one branch per call, so the
/// library never requires a logging backend.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error => eprintln!("[{}] ERROR: {}", timestamp, message),
                LogLevel::Warn => eprintln!("[{}] WARN: {}", timestamp, message),
                LogLevel::Info => println!("[{}] INFO: {}", timestamp, message),
                LogLevel::Debug => println!("[{}] DEBUG: {}", timestamp, message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that forwards to `tracing`
    pub fn tracing() -> Self {
        let callback: LogCallback = Box::new(|level, message| match level {
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Debug => tracing::debug!("{}", message),
        });
        Self::new(Some(callback), LogLevel::Debug)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log packet data with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }

        let message = format!("{} packet ({} bytes): {}", direction, data.len(), bytes_to_hex(data));
        self.log(level, &message);
    }

    /// Log a wire frame according to the logging mode
    pub fn log_frame(&self, channel: &str, direction: &str, data: &[u8]) {
        match self.mode {
            LoggingMode::Raw => {
                if self.should_log(LogLevel::Info) {
                    self.info(&format!("[{}] {} raw: {}", channel, direction, bytes_to_hex(data)));
                }
            }
            LoggingMode::Interpreted => {
                if self.should_log(LogLevel::Info) {
                    self.info(&format!("[{}] {} {}", channel, direction, describe_frame(data)));
                }
            }
            LoggingMode::Both => {
                if self.should_log(LogLevel::Info) {
                    self.info(&format!("[{}] {} {}", channel, direction, describe_frame(data)));
                }
                if self.should_log(LogLevel::Debug) {
                    self.debug(&format!("[{}] {} raw: {}", channel, direction, bytes_to_hex(data)));
                }
            }
        }
    }
}

/// Short readable summary of a frame
///
/// Text protocols (Modbus ASCII, HJ212) are shown as text, binary frames
/// by length and leading bytes.
fn describe_frame(data: &[u8]) -> String {
    if data.is_empty() {
        return "empty frame".to_string();
    }

    let printable = data
        .iter()
        .all(|b| b.is_ascii_graphic() || matches!(b, b' ' | b'\r' | b'\n'));
    if printable {
        let text = String::from_utf8_lossy(data);
        return format!("{} chars: {}", data.len(), text.trim_end());
    }

    let head = &data[..data.len().min(8)];
    let ellipsis = if data.len() > head.len() { " .." } else { "" };
    format!("{} bytes: {}{}", data.len(), hex::encode_upper(head), ellipsis)
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}
