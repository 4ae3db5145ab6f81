//! Centralized error handling for shardset.
//!
//! All failure conditions are propagated through the [`Result`] type; the
//! library never panics (enforced by `#![deny(clippy::unwrap_used)]` and
//! `#![deny(clippy::panic)]` at the crate root).
//!
//! Errors are categorized by failure domain:
//!
//! - **I/O** ([`ShardsetError::Io`]): low-level file system operations
//! - **Format** ([`ShardsetError::Format`]): unparsable or missing footer,
//!   missing index, unresolvable extension chain, corrupt shard layout
//! - **Codec** ([`ShardsetError::Codec`]): unknown codec or encoding id,
//!   corrupt compressed or text-encoded payload
//! - **Bounds** ([`ShardsetError::Bounds`]): record index outside `[0, len)`
//! - **Policy** ([`ShardsetError::Policy`]): incompatible transcoding or
//!   reorder options (e.g. requesting both a shuffle and a sort)
//!
//! Every error is raised at the point of detection and carries the offending
//! key, index, or path in its message; none are downgraded to warnings.

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for shardset operations.
pub type Result<T> = std::result::Result<T, ShardsetError>;

/// The master error enum covering all failure domains in shardset.
///
/// The type is `Clone` so errors can be shared across threads or stored for
/// later analysis; I/O errors are wrapped in `Arc` to keep cloning cheap.
#[derive(Debug, Clone)]
pub enum ShardsetError {
    /// Low-level I/O failure (file not found, permissions, disk full).
    Io(Arc<io::Error>),

    /// The shard layout is invalid: missing or unparsable footer line,
    /// missing offset index, an unknown tag in an extension chain, or an
    /// offset pointing outside the file.
    Format(String),

    /// A codec or text-encoding failure: unknown codec/scheme id, or a
    /// payload that does not decompress/decode. The message names the codec
    /// or scheme and the key being processed.
    Codec(String),

    /// A record index outside the valid range.
    Bounds {
        /// The requested index.
        index: usize,
        /// The number of records available.
        len: usize,
    },

    /// Mutually exclusive or invalid options supplied by the caller.
    Policy(String),
}

impl fmt::Display for ShardsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Format(s) => write!(f, "format error: {s}"),
            Self::Codec(s) => write!(f, "codec error: {s}"),
            Self::Bounds { index, len } => {
                write!(f, "index {index} out of range for dataset of length {len}")
            }
            Self::Policy(s) => write!(f, "policy error: {s}"),
        }
    }
}

impl std::error::Error for ShardsetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ShardsetError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_message_names_index_and_len() {
        let err = ShardsetError::Bounds { index: 7, len: 3 };
        assert_eq!(
            err.to_string(),
            "index 7 out of range for dataset of length 3"
        );
    }

    #[test]
    fn io_errors_preserve_source() {
        use std::error::Error as _;
        let err: ShardsetError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.source().is_some());
        let cloned = err.clone();
        assert!(cloned.to_string().contains("gone"));
    }
}
