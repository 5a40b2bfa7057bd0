//! Stage-level error type and its retry classification

use thiserror::Error;

use crate::manifest::ManifestError;
use crate::runner::transform::TransformError;
use crate::staging::StagingError;
use crate::storage::StorageError;

/// Anything that can go wrong while a runner drives one key
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Claim lost before the key was finished")]
    ClaimLost,
}

/// What the runner does with a claimed key after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Someone else owns the key, or it needs no work. Touch nothing.
    Skip,
    /// Back to Pending with the attempt refunded
    Requeue,
    /// Back to Pending, attempt spent
    RetryImmediately,
    /// Failed with a backoff window, attempt spent
    RetryWithBackoff,
    /// Dead, for operator review
    Park,
}

fn classify_storage(e: &StorageError) -> Disposition {
    match e {
        StorageError::TransientIo { .. } => Disposition::RetryWithBackoff,
        StorageError::NotFound(_)
        | StorageError::PermissionDenied { .. }
        | StorageError::InvalidUri(_) => Disposition::Park,
    }
}

fn classify_manifest(e: &ManifestError) -> Disposition {
    match e {
        ManifestError::AlreadyClaimed { .. }
        | ManifestError::NotClaimable { .. }
        | ManifestError::BackingOff { .. }
        | ManifestError::ClaimLost(_) => Disposition::Skip,
        ManifestError::Database(_) => Disposition::RetryWithBackoff,
        // The previous stage has not finished this key yet
        ManifestError::NotPublished { .. } => Disposition::Requeue,
        ManifestError::Conflict { .. }
        | ManifestError::HashMismatch { .. }
        | ManifestError::DatasetNotFound(_)
        | ManifestError::RecordNotFound { .. }
        | ManifestError::InvalidInput(_)
        | ManifestError::Migration(_)
        | ManifestError::Serialization(_)
        | ManifestError::Common(_) => Disposition::Park,
    }
}

impl StageError {
    pub fn classify(&self) -> Disposition {
        match self {
            StageError::Storage(e) => classify_storage(e),
            StageError::Staging(e) => match e {
                StagingError::CapacityExceeded { .. } => Disposition::Requeue,
                StagingError::IntegrityError { .. } => Disposition::RetryImmediately,
                StagingError::Storage(e) => classify_storage(e),
                StagingError::Manifest(e) => classify_manifest(e),
                StagingError::Io(_) | StagingError::Sidecar(_) => Disposition::RetryWithBackoff,
                StagingError::OutsideLease(_) => Disposition::Park,
            },
            StageError::Manifest(e) => classify_manifest(e),
            StageError::Transform(e) if e.is_retryable() => Disposition::RetryWithBackoff,
            StageError::Transform(_) => Disposition::Park,
            StageError::ClaimLost => Disposition::Skip,
        }
    }

    /// The store reported that another worker owns or finished the key
    pub fn is_claim_lost(&self) -> bool {
        matches!(
            self,
            StageError::ClaimLost | StageError::Manifest(ManifestError::ClaimLost(_))
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StageError::Manifest(ManifestError::Conflict { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_classification() {
        let capacity: StageError = StagingError::CapacityExceeded {
            requested: 10,
            available: 1,
        }
        .into();
        assert_eq!(capacity.classify(), Disposition::Requeue);

        let integrity: StageError = StagingError::IntegrityError {
            uri: "s3://raw/a.jpg".into(),
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(integrity.classify(), Disposition::RetryImmediately);

        let transient: StageError = StorageError::transient("s3://raw/a.jpg", "timeout").into();
        assert_eq!(transient.classify(), Disposition::RetryWithBackoff);

        let denied: StageError = StagingError::Storage(StorageError::PermissionDenied {
            uri: "s3://raw/a.jpg".into(),
            message: "AccessDenied".into(),
        })
        .into();
        assert_eq!(denied.classify(), Disposition::Park);

        let claimed: StageError = ManifestError::AlreadyClaimed {
            key: "a.jpg".into(),
            holder: None,
            expires_at: None,
        }
        .into();
        assert_eq!(claimed.classify(), Disposition::Skip);

        let upstream: StageError = ManifestError::NotPublished {
            key: "a.jpg".into(),
            stage: 1,
        }
        .into();
        assert_eq!(upstream.classify(), Disposition::Requeue);

        let lost: StageError = ManifestError::ClaimLost(Uuid::new_v4()).into();
        assert!(lost.is_claim_lost());

        assert_eq!(
            StageError::from(TransformError::Retryable("busy".into())).classify(),
            Disposition::RetryWithBackoff
        );
        assert_eq!(
            StageError::from(TransformError::Fatal("bad input".into())).classify(),
            Disposition::Park
        );
    }
}
