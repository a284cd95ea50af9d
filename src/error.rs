use std::io;
use thiserror::Error;

pub const EXIT_RUNTIME: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Error)]
pub enum CosError {
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Runtime(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CosError {
    /// Invalid input is a usage failure (2); anything the environment refused is a runtime failure (1).
    pub fn exit_code(&self) -> i32 {
        match self {
            CosError::Config(_) | CosError::Usage(_) => EXIT_USAGE,
            CosError::Runtime(_) | CosError::Io(_) | CosError::Json(_) => EXIT_RUNTIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failures_exit_with_usage_code() {
        assert_eq!(CosError::Config("bad".to_string()).exit_code(), 2);
        assert_eq!(CosError::Usage("bad".to_string()).exit_code(), 2);
    }

    #[test]
    fn environment_failures_exit_with_runtime_code() {
        assert_eq!(CosError::Runtime("missing".to_string()).exit_code(), 1);
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(CosError::from(io_err).exit_code(), 1);
    }

    #[test]
    fn config_errors_are_prefixed() {
        let err = CosError::Config("/tmp/x.toml: key 'model' must be a string.".to_string());
        assert_eq!(
            err.to_string(),
            "config error: /tmp/x.toml: key 'model' must be a string."
        );
    }
}
