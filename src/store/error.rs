use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error `{0}`")]
    Sqlite(tokio_rusqlite::Error),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(value: tokio_rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
