//! Crate-wide error type.
//!
//! Two classes of failure exist in this crate and they are deliberately not
//! conflated (see `spec.md` §7):
//!
//! - things a caller can be expected to handle (`Error`, returned here);
//! - runtime-invariant violations (releasing a lock you don't hold, waking
//!   one on an empty queue, a corrupt machine context) which are bugs, not
//!   errors, and abort the process via `panic!`/`unreachable!` at the call
//!   site instead of flowing through this type.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all reportable error cases produced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to allocate a {size}-byte fiber stack (with guard page)")]
    StackAlloc { size: usize },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("setuid({uid}) failed: {source}")]
    SetUid {
        uid: u32,
        #[source]
        source: io::Error,
    },

    #[error("chroot({dir:?}) failed: {source}")]
    Chroot {
        dir: String,
        #[source]
        source: io::Error,
    },

    #[error("daemonize() failed: {source}")]
    Daemonize {
        #[source]
        source: io::Error,
    },
}
