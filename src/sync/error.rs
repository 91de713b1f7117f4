//! Sync error types.

use crate::db::StoreError;

/// Errors that terminate a whole sync call.
///
/// Conflicts are not errors: they are reported structurally in the
/// `ConflictResolution` list. Per-change apply failures are reported in the
/// `ApplyFailure` list. What remains here is the fatal category, for which
/// no retry is built into this layer; the caller owns retry policy, and a
/// failed call leaves the device's watermark unadvanced so a retry resumes
/// from the same point.
#[derive(Debug)]
pub enum SyncError {
    /// Canonical store unavailable or a query failed at the call boundary.
    Store(StoreError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Store(e) => Some(e),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}
