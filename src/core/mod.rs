//! 核心层：错误分类、关闭管理

pub mod error;
pub mod shutdown;

pub use error::{parse_retry_after, ConfigurationError, ErrorKind, GenerationError};
pub use shutdown::{ShutdownManager, ShutdownReason};
