pub mod error;
pub use error::BkvError;

pub mod result;
pub use result::BkvResult;
