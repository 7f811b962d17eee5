use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

/// Core error taxonomy. The variant drives downstream policy: condition
/// errors skip one rule for one reading, action errors are handled per the
/// action's own policy, storage errors never stop non-persistent publishing.
#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    #[error("configuration error")]
    Config,
    #[error("plugin error")]
    Plugin,
    #[error("adapter error")]
    Adapter,
    #[error("sink error")]
    Sink,
    #[error("subscription queue full")]
    BusFull,
    #[error("condition evaluation error")]
    Condition,
    #[error("action execution error")]
    Action,
    #[error("stream storage error")]
    Storage,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Config => 1001,
            Self::Plugin => 1002,
            Self::Adapter => 1003,
            Self::Sink => 1004,
            Self::BusFull => 1005,
            Self::Condition => 1006,
            Self::Action => 1007,
            Self::Storage => 1008,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;
