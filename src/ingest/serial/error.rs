use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("serial io error `{0}`")]
    Io(std::io::Error),
    #[error("no echo received")]
    NoEcho,
    #[error("echo does not match, sent `{sent}` but received `{received}`")]
    EchoMismatch { sent: String, received: String },
    #[error("no response received")]
    NoResponse,
    #[error("malformed response `{0}`")]
    MalformedResponse(String),
    #[error("command in request `{sent}` and response `{received}` do not match")]
    CommandMismatch { sent: String, received: String },
}

impl From<std::io::Error> for SerialError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
