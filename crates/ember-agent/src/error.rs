use ember_link::LinkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("mqtt link: {0}")]
    Link(#[from] LinkError),

    #[error("identity store: {0}")]
    Identity(String),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("firmware image: {0}")]
    Image(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
