//! Errors from update operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("github api error: {0}")]
    Github(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid checksums: {0}")]
    Checksums(String),

    #[error("release {release} missing asset {asset:?}")]
    MissingAsset { release: String, asset: String },

    #[error("unsupported platform {0}")]
    UnsupportedPlatform(String),

    #[error("sha256 mismatch for {name}: got {got}, want {want}")]
    ChecksumMismatch {
        name: String,
        got: String,
        want: String,
    },

    #[error("current version {current} is newer than latest {latest} (use --force to downgrade)")]
    WouldDowngrade { current: String, latest: String },
}

pub type Result<T> = std::result::Result<T, Error>;
