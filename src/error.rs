use alloy_primitives::B256;
use thiserror::Error;

/// Validation failures raised while turning a raw log into a purchase.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log data must start with 0x")]
    MissingPrefix,

    #[error("log data must be 130 characters, got {0}")]
    InvalidLength(usize),

    #[error("log data contains a non-hex character at offset {0}")]
    InvalidHex(usize),

    #[error("expected at least 2 topics, got {0}")]
    MissingTopics(usize),

    #[error("topic {index} is not a 32-byte hex value: {value}")]
    InvalidTopic { index: usize, value: String },

    #[error("topic 0 {found} does not match the purchase signature {expected}")]
    SignatureMismatch { expected: B256, found: B256 },

    #[error("log is missing {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("checkpoint conflict: expected {expected}, store holds {found}")]
    CheckpointConflict { expected: u64, found: u64 },

    #[error("checkpoint may not move backwards from {current} to {requested}")]
    CheckpointRegression { current: u64, requested: u64 },

    #[error("corrupt value in store: {0}")]
    Corrupt(String),

    #[error("{0} no longer fits in 256 bits")]
    Overflow(&'static str),
}

/// Failure taxonomy of the ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed log: {0}")]
    MalformedLog(#[from] DecodeError),

    #[error("log fetch failed: {0}")]
    FetchFailed(String),

    #[error("live subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("node invalidated the live filter")]
    FilterExpired,

    #[error("chain reorganization at block {block}: recorded {recorded}, chain now has {observed}")]
    ReorgDetected {
        block: u64,
        recorded: B256,
        observed: B256,
    },

    #[error("checkpoint store unavailable: {0}")]
    CheckpointStoreUnavailable(#[from] StoreError),

    #[error("gave up after {0} consecutive reconnect attempts")]
    ReconnectsExhausted(u32),
}

impl IngestError {
    /// Fatal errors halt ingestion; everything else is retried through a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::ReorgDetected { .. }
                | IngestError::CheckpointStoreUnavailable(_)
                | IngestError::ReconnectsExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(!IngestError::FetchFailed("timeout".into()).is_fatal());
        assert!(!IngestError::SubscribeFailed("closed".into()).is_fatal());
        assert!(!IngestError::FilterExpired.is_fatal());
        assert!(!IngestError::MalformedLog(DecodeError::MissingPrefix).is_fatal());
    }

    #[test]
    fn reorg_and_store_errors_are_fatal() {
        let reorg = IngestError::ReorgDetected {
            block: 10,
            recorded: B256::ZERO,
            observed: B256::repeat_byte(1),
        };
        assert!(reorg.is_fatal());

        let store = IngestError::from(StoreError::CheckpointConflict {
            expected: 1,
            found: 2,
        });
        assert!(store.is_fatal());
        assert!(IngestError::ReconnectsExhausted(3).is_fatal());
    }
}
