use thiserror::Error;

use crate::store::error::StoreError;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("no remote endpoint reachable")]
    NoEndpoint,
    #[error("session io error `{0}`")]
    Io(std::io::Error),
    #[error("http error `{0}`")]
    Http(reqwest::Error),
    #[error("remote rejected write with status {0}")]
    Rejected(u16),
    #[error("store error `{0}`")]
    Store(StoreError),
    #[error("upload cursor `{0}` is not a timestamp")]
    BadCursor(String),
}

impl From<std::io::Error> for UploadError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl From<StoreError> for UploadError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}
