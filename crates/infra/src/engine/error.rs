use thiserror::Error;

use depotledger_core::{DomainError, ErrorKind};
use depotledger_events::StreamId;

use crate::event_store::EventStoreError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure of an engine operation.
///
/// On any error nothing was committed: no ledger entry, no aggregate
/// change, no publication.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A stored payload no longer decodes into its domain event.
    #[error("failed to decode event {sequence} of {stream}: {source}")]
    Decode {
        stream: StreamId,
        sequence: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("engine lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Domain(e) => e.kind(),
            EngineError::Store(EventStoreError::Concurrency(_)) => ErrorKind::Conflict,
            EngineError::Store(_) | EngineError::Decode { .. } | EngineError::Poisoned(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            EngineError::Domain(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.domain().is_some_and(DomainError::is_retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotledger_core::{ArticleId, WarehouseId};

    #[test]
    fn store_conflicts_surface_as_conflicts() {
        let err = EngineError::from(EventStoreError::Concurrency("stale".into()));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn domain_errors_keep_their_kind() {
        let err = EngineError::from(DomainError::InsufficientStock {
            article: ArticleId::new(),
            warehouse: WarehouseId::new(),
            requested: 3,
            available: 1,
        });
        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        assert!(err.is_retryable());
    }
}
