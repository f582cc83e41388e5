#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WardenResult<T> = Result<T, WardenError>;
