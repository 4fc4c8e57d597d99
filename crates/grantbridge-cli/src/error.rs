use grantbridge_core::{ConfigError, CoreError, ManagerError, ValidationError};
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_)
            | Self::Config(_)
            | Self::Core(CoreError::Config(_))
            | Self::Manager(ManagerError::UnknownSource { .. } | ManagerError::Validation(_))
            | Self::Core(CoreError::Manager(
                ManagerError::UnknownSource { .. } | ManagerError::Validation(_),
            )) => 2,
            Self::Manager(_) | Self::Core(_) | Self::Serialization(_) | Self::Io(_) => 10,
        }
    }
}
