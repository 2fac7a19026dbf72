use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid pattern `{pattern}`: {detail}")]
    Filter { pattern: String, detail: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found on server: {0}")]
    NotFound(String),

    #[error("manifest parse error at line {line}: {detail}")]
    ManifestParse { line: usize, detail: String },

    #[error("hook `{job}` failed: {detail}")]
    Hook { job: String, detail: String },

    #[error("another deployment is in progress (lock file present on server)")]
    ConcurrentDeployment,

    #[error("not supported by this server: {0}")]
    Unsupported(&'static str),

    #[error("rollback failed, server left in partial state: {0}")]
    FatalState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Process exit code for this error class.
    ///
    /// 0 is reserved for success (including test mode), 1 is the generic
    /// failure, 2 a configuration problem, 3 the concurrent-deployment lock.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Config(_) | DeployError::Filter { .. } => 2,
            DeployError::ConcurrentDeployment => 3,
            _ => 1,
        }
    }

    /// Whether a retry with the same inputs can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeployError::Connection(_) | DeployError::Transport(_)
        )
    }
}
