use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesselError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TesselError {
    /// Short, stable error code for logs and exit messages.
    pub fn code(&self) -> &'static str {
        match self {
            TesselError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TesselError>;
