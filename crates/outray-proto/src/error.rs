use thiserror::Error;

/// Errors produced while encoding or decoding frames
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no type discriminator")]
    MissingType,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
