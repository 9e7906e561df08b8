use super::error::BkvError;

pub type BkvResult<T> = std::result::Result<T, BkvError>;
