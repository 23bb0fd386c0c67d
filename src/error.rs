use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The input could not be parsed as an image reference.
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Cluster-scoped credentials could not be enumerated.
    #[error("failed to build credential chain: {0}")]
    CredentialChain(String),

    /// The registry could not answer the digest query.
    #[error("failed to query digest for {image}: {message}")]
    DigestQuery { image: String, message: String },

    #[error("digest resolution was cancelled")]
    Cancelled,
}

impl Error {
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn credential_chain(message: impl Into<String>) -> Self {
        Error::CredentialChain(message.into())
    }

    pub fn digest_query(image: impl Into<String>, message: impl Into<String>) -> Self {
        Error::DigestQuery {
            image: image.into(),
            message: message.into(),
        }
    }
}
