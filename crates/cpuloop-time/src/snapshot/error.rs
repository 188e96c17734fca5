use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid timers snapshot magic")]
    InvalidMagic,

    #[error("unsupported timers snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt timers snapshot: {0}")]
    Corrupt(&'static str),

    #[error("icount state mismatch (snapshot has icount: {snapshot}, clock uses icount: {clock})")]
    IcountMismatch { snapshot: bool, clock: bool },
}
