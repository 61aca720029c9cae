use serde::Serialize;

/// Stable error taxonomy surfaced to clients as `kind` on `job:error` and
/// admin responses. Never add a variant without also updating [`CoreError::kind`].
#[derive(Debug, thiserror::Error, Clone)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("file ref not found or expired")]
    RefNotFound,
    #[error("queue is full")]
    QueueFull,
    #[error("a dream session is already active")]
    DreamBusy,
    #[error("mode not found: {0}")]
    ModeNotFound(String),
    #[error("failed to load model for mode {0}: {1}")]
    ModelLoadFailed(String, String),
    #[error("worker failure: {0}")]
    WorkerFailure(String),
    #[error("job canceled")]
    Canceled,
    #[error("server is shutting down")]
    Shutdown,
    #[error("job timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
}

/// Wire-level error kind tag. Keep in lockstep with [`CoreError`]'s variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    BadRequest,
    RefNotFound,
    QueueFull,
    DreamBusy,
    ModeNotFound,
    ModelLoadFailed,
    WorkerFailure,
    Canceled,
    Shutdown,
    Timeout,
    UnknownType,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::BadRequest(_) => ErrorKind::BadRequest,
            CoreError::RefNotFound => ErrorKind::RefNotFound,
            CoreError::QueueFull => ErrorKind::QueueFull,
            CoreError::DreamBusy => ErrorKind::DreamBusy,
            CoreError::ModeNotFound(_) => ErrorKind::ModeNotFound,
            CoreError::ModelLoadFailed(..) => ErrorKind::ModelLoadFailed,
            CoreError::WorkerFailure(_) => ErrorKind::WorkerFailure,
            CoreError::Canceled => ErrorKind::Canceled,
            CoreError::Shutdown => ErrorKind::Shutdown,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::UnknownType(_) => ErrorKind::UnknownType,
        }
    }

    /// Retriable per the taxonomy in the spec: clients may resubmit on these kinds.
    pub fn retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::QueueFull | ErrorKind::WorkerFailure | ErrorKind::RefNotFound
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
