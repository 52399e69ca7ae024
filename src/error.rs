use thiserror::Error;

/// Result alias for control-path operations
pub type Result<T> = std::result::Result<T, OrchestraError>;

/// Fieldless taxonomy of control-path failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    InvalidState,
    DeviceUnavailable,
    DriverError,
    ResourceExhausted,
    Unsupported,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid-parameter",
            ErrorKind::InvalidState => "invalid-state",
            ErrorKind::DeviceUnavailable => "device-unavailable",
            ErrorKind::DriverError => "driver-error",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::Unsupported => "unsupported",
        }
    }
}

/// Control-path errors, returned synchronously. None of them leaves the
/// interface half-open: a failed `open_stream` always ends in `Closed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestraError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Driver error: {0}")]
    DriverError(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unsupported: {feature}")]
    Unsupported { feature: String },
}

impl OrchestraError {
    pub fn unsupported(feature: impl Into<String>) -> Self {
        OrchestraError::Unsupported {
            feature: feature.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestraError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            OrchestraError::InvalidState(_) => ErrorKind::InvalidState,
            OrchestraError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            OrchestraError::DriverError(_) => ErrorKind::DriverError,
            OrchestraError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            OrchestraError::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            OrchestraError::InvalidParameter(msg) => {
                format!("The requested stream configuration is not valid: {}", msg)
            }
            OrchestraError::InvalidState(msg) => {
                format!("The operation is not allowed right now: {}", msg)
            }
            OrchestraError::DeviceUnavailable(msg) => {
                format!("Audio device is not available or has been disconnected: {}", msg)
            }
            OrchestraError::DriverError(msg) => {
                format!("The audio driver reported a failure: {}", msg)
            }
            OrchestraError::ResourceExhausted(msg) => {
                format!("The system ran out of resources: {}", msg)
            }
            OrchestraError::Unsupported { feature } => {
                format!("'{}' is not supported by the selected backend", feature)
            }
        }
    }

    /// Get suggested recovery actions for the error
    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            OrchestraError::InvalidParameter(_) => vec![
                "Use 'orchestra-list' to see the channels and rates each device supports".to_string(),
                "Retry with --fallback to let the tool pick the nearest valid settings".to_string(),
            ],
            OrchestraError::InvalidState(_) => vec![
                "Close the current stream before opening another one".to_string(),
                "Open a stream before starting it".to_string(),
            ],
            OrchestraError::DeviceUnavailable(_) => vec![
                "Check that the audio device is connected and powered on".to_string(),
                "List devices again, indexes change when hardware changes".to_string(),
                "Try a different backend with --api".to_string(),
            ],
            OrchestraError::DriverError(_) => vec![
                "Check that no other application holds the device exclusively".to_string(),
                "Verify audio drivers are properly installed".to_string(),
            ],
            OrchestraError::ResourceExhausted(_) => vec![
                "Close other audio applications to free system resources".to_string(),
                "Reduce the buffer count or frame size".to_string(),
            ],
            OrchestraError::Unsupported { .. } => vec![
                "Drop the unsupported option or select another backend".to_string(),
            ],
        }
    }

    /// Every control-path error leaves the interface usable; only some can be
    /// fixed by retrying with adjusted parameters.
    pub fn is_recoverable(&self) -> bool {
        match self {
            OrchestraError::InvalidParameter(_) => true,
            OrchestraError::InvalidState(_) => true,
            OrchestraError::DeviceUnavailable(_) => true,
            OrchestraError::DriverError(_) => false,
            OrchestraError::ResourceExhausted(_) => true,
            OrchestraError::Unsupported { .. } => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            OrchestraError::InvalidParameter(_) => ErrorSeverity::Warning,
            OrchestraError::InvalidState(_) => ErrorSeverity::Warning,
            OrchestraError::Unsupported { .. } => ErrorSeverity::Warning,
            OrchestraError::DeviceUnavailable(_) => ErrorSeverity::Error,
            OrchestraError::ResourceExhausted(_) => ErrorSeverity::Error,
            OrchestraError::DriverError(_) => ErrorSeverity::Critical,
        }
    }
}

/// Error severity levels for logging and user feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }

    pub fn log_level(&self) -> log::Level {
        match self {
            ErrorSeverity::Info => log::Level::Info,
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Error => log::Level::Error,
            ErrorSeverity::Critical => log::Level::Error,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found")]
    ConfigDirNotFound,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            ConfigError::ConfigDirNotFound => {
                "Could not locate a home directory to store the configuration".to_string()
            }
            ConfigError::IoError(err) => format!("Could not read or write the configuration file: {}", err),
            ConfigError::SerializationError(err) => format!("Could not save the configuration: {}", err),
            ConfigError::DeserializationError(err) => {
                format!("The configuration file is not valid TOML: {}", err)
            }
            ConfigError::InvalidValue { field, value } => {
                format!("Configuration value '{}' is invalid for '{}'", value, field)
            }
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            ConfigError::ConfigDirNotFound => vec!["Set the HOME environment variable".to_string()],
            ConfigError::IoError(_) => vec!["Check permissions of ~/.config/orchestra".to_string()],
            ConfigError::SerializationError(_) => vec!["Try the operation again".to_string()],
            ConfigError::DeserializationError(_) | ConfigError::InvalidValue { .. } => vec![
                "Fix or delete ~/.config/orchestra/config.toml to restore defaults".to_string(),
            ],
        }
    }

    pub fn is_recoverable(&self) -> bool {
        // Defaults are always available
        true
    }
}

/// Top-level error of the command-line tools
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Audio error: {0}")]
    Audio(#[from] OrchestraError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Usage(String),
}

impl ToolError {
    pub fn user_message(&self) -> String {
        match self {
            ToolError::Audio(err) => err.user_message(),
            ToolError::Config(err) => err.user_message(),
            ToolError::Io(err) => match err.kind() {
                std::io::ErrorKind::BrokenPipe => "Output pipe closed".to_string(),
                std::io::ErrorKind::UnexpectedEof => "Input ended unexpectedly".to_string(),
                _ => format!("Standard I/O error: {}", err),
            },
            ToolError::Usage(msg) => msg.clone(),
        }
    }

    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            ToolError::Audio(err) => err.recovery_suggestions(),
            ToolError::Config(err) => err.recovery_suggestions(),
            ToolError::Io(_) => vec!["Check the pipe connected to standard input/output".to_string()],
            ToolError::Usage(_) => vec!["Run with --help to see the available options".to_string()],
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ToolError::Audio(err) => err.severity(),
            ToolError::Config(_) => ErrorSeverity::Warning,
            ToolError::Io(_) => ErrorSeverity::Error,
            ToolError::Usage(_) => ErrorSeverity::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            OrchestraError::InvalidParameter("x".into()).kind(),
            ErrorKind::InvalidParameter
        );
        assert_eq!(OrchestraError::InvalidState("x".into()).kind(), ErrorKind::InvalidState);
        assert_eq!(OrchestraError::unsupported("exclusive").kind(), ErrorKind::Unsupported);
        assert_eq!(ErrorKind::DriverError.as_str(), "driver-error");
    }

    #[test]
    fn test_error_messages() {
        let err = OrchestraError::unsupported("exclusive hardware access");
        assert_eq!(err.to_string(), "Unsupported: exclusive hardware access");
        assert!(err.user_message().contains("exclusive hardware access"));
        assert!(!err.recovery_suggestions().is_empty());
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            OrchestraError::DriverError("x".into()).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            OrchestraError::InvalidParameter("x".into()).severity().log_level(),
            log::Level::Warn
        );
        assert!(OrchestraError::InvalidParameter("x".into()).is_recoverable());
        assert!(!OrchestraError::DriverError("x".into()).is_recoverable());
    }

    #[test]
    fn test_tool_error_wrapping() {
        let err: ToolError = OrchestraError::DeviceUnavailable("hw:0".into()).into();
        assert!(err.user_message().contains("hw:0"));
        assert_eq!(err.severity(), ErrorSeverity::Error);

        let io: ToolError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(io.user_message(), "Output pipe closed");
    }
}
