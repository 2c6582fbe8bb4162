//! Shared prelude and small primitives reused across the meshgate crate.

pub mod prelude {
    pub use bytes::Bytes;
    pub use std::sync::Arc;
    pub use std::time::{Duration, Instant};
    pub use tracing::{debug, error, info, trace, warn};

    pub use crate::{Addr, AppName};
}

/// Address of a single node, `host:port`. A thin alias rather than a
/// newtype: every consumer treats it as an opaque, comparable string key.
pub type Addr = String;

/// Logical application/service name shared by all replicas of one service.
pub type AppName = String;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
