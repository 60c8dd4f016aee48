use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("service data is empty")]
    EmptyServiceData,
    #[error("service data is truncated")]
    Truncated,
    #[error("advertisement is encrypted, decryption is not supported")]
    Encrypted,
    #[error("unsupported BTHome version `{0}`")]
    UnsupportedVersion(u8),
}
