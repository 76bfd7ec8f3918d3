use crate::label::CodecError;
use crate::store::StoreError;
use crate::validation::ValidationError;
use std::sync::Arc;
use thiserror::Error;

/// Why a server's signer or store never came up.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to initialize labeler: invalid service DID: {0}")]
    Did(#[source] ValidationError),

    #[error("failed to initialize signer: {0:#}")]
    Signer(#[source] anyhow::Error),

    #[error("failed to initialize label store: {0}")]
    Store(#[source] StoreError),
}

/// Errors surfaced by [`crate::LabelerServer`] operations.
///
/// A label that does not exist is not an error: point lookups return
/// `Ok(None)`.
#[derive(Debug, Error)]
pub enum LabelerError {
    #[error("label validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The signer or store never came up. Cached, so every later call on the
    /// same server fails with the same shared cause.
    #[error("{0}")]
    Initialization(#[source] Arc<InitError>),

    #[error("{context}: {source}")]
    Signing {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{context}: {source}")]
    Persistence {
        context: &'static str,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl LabelerError {
    pub(crate) fn signing(context: &'static str, source: anyhow::Error) -> Self {
        Self::Signing { context, source }
    }

    pub(crate) fn persistence(context: &'static str, source: StoreError) -> Self {
        Self::Persistence { context, source }
    }

    /// The operation-level context of a signing or persistence failure.
    pub fn context(&self) -> Option<&'static str> {
        match self {
            Self::Signing { context, .. } | Self::Persistence { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn init_cause(&self) -> Option<&InitError> {
        match self {
            Self::Initialization(cause) => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_messages() {
        let err = LabelerError::from(ValidationError::new("CID cannot be provided for DID URIs"));
        assert_eq!(
            err.to_string(),
            "label validation failed: CID cannot be provided for DID URIs"
        );
        assert!(err.is_validation());

        let err = LabelerError::persistence(
            "failed to save negated label to database",
            StoreError::InvalidState("store is not connected".into()),
        );
        assert_eq!(err.context(), Some("failed to save negated label to database"));
        assert!(err
            .to_string()
            .starts_with("failed to save negated label to database: "));
        assert!(err.source().is_some());

        let err = LabelerError::signing("failed to sign negated label", anyhow::anyhow!("hsm offline"));
        assert_eq!(err.to_string(), "failed to sign negated label: hsm offline");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_initialization_keeps_store_cause() {
        let err = LabelerError::Initialization(Arc::new(InitError::Store(StoreError::Connect(
            "connection refused".to_string(),
        ))));
        assert_eq!(
            err.to_string(),
            "failed to initialize label store: failed to connect: connection refused"
        );
        let cause = err
            .source()
            .and_then(|e| e.source())
            .and_then(|e| e.downcast_ref::<StoreError>());
        assert!(matches!(cause, Some(StoreError::Connect(_))));
        assert!(matches!(err.init_cause(), Some(InitError::Store(_))));

        let err = LabelerError::Initialization(Arc::new(InitError::Signer(anyhow::anyhow!(
            "invalid hex"
        ))));
        assert_eq!(err.to_string(), "failed to initialize signer: invalid hex");
    }
}
