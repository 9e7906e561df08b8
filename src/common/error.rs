use thiserror::Error;

#[derive(Error, Debug)]
pub enum BkvError {
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid key: {0}")]
    InvalidKey(u64),

    #[error("Invalid value size: {0}")]
    InvalidSize(u64),

    #[error("Corrupt database: {0}")]
    Corrupt(String),
}
