//! Contract for the collaborator that fetches the managed program's source.

/// Failure reported by a source sync. Opaque beyond its message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SyncError {
    pub message: String,
}

impl SyncError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What a sync call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The checkout already existed; nothing was fetched.
    AlreadyPresent,
    Cloned,
}

pub trait SourceSync: Send + Sync {
    /// Clone the source if it is not checked out yet.
    fn ensure_present(&self) -> Result<SyncOutcome, SyncError>;

    /// Discard the local checkout and clone it again.
    fn resync(&self) -> Result<SyncOutcome, SyncError>;

    /// Human-readable revision of the current checkout, if known.
    fn describe(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysPresent;

    impl SourceSync for AlwaysPresent {
        fn ensure_present(&self) -> Result<SyncOutcome, SyncError> {
            Ok(SyncOutcome::AlreadyPresent)
        }

        fn resync(&self) -> Result<SyncOutcome, SyncError> {
            Err(SyncError::new("remote unreachable"))
        }
    }

    #[test]
    fn describe_defaults_to_unknown() {
        let sync = AlwaysPresent;
        assert_eq!(sync.describe(), None);
        assert_eq!(
            sync.ensure_present().expect("present"),
            SyncOutcome::AlreadyPresent
        );
        let err = sync.resync().expect_err("resync fails");
        assert_eq!(err.to_string(), "remote unreachable");
    }
}
