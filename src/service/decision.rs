//! Lifecycle Decision Engine
//!
//! Pure functions over a file snapshot. The snapshot must come from a
//! transaction that also read the ledger, so `reference_count` is current.

use chrono::{DateTime, Duration, Utc};

use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::{FileState, StoredFile};
use crate::service::response::FileOperation;

/// State transition chosen for a deletion request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    HardDelete,
    Detach,
    Protected,
    AlreadyProcessed,
}

impl Decision {
    pub fn operation(&self) -> FileOperation {
        match self {
            Decision::HardDelete => FileOperation::HardDeleted,
            Decision::Detach => FileOperation::SoftDetached,
            Decision::Protected => FileOperation::Protected,
            Decision::AlreadyProcessed => FileOperation::AlreadyProcessed,
        }
    }

    /// Whether carrying out the decision writes to the store
    pub fn mutates(&self) -> bool {
        matches!(self, Decision::HardDelete | Decision::Detach)
    }
}

/// Decide what a deletion request by `caller_id` does to `file`.
///
/// Protection is checked first and wins over everything else, for every
/// caller. Former owners repeating a request get `AlreadyProcessed`; anyone
/// else touching a file they do not own gets `Unauthorized`.
pub fn decide(file: &StoredFile, caller_id: &str) -> LifecycleResult<Decision> {
    if file.is_protected() {
        return Ok(Decision::Protected);
    }

    let unauthorized = || LifecycleError::Unauthorized {
        file_id: file.id,
        caller_id: caller_id.to_string(),
    };

    match file.state {
        // already covered by is_protected
        FileState::Protected => Ok(Decision::Protected),
        FileState::Deleted => {
            // a file detached before it was swept has no owner left
            let former_owner = file.owner_id.as_deref().or(file.detached_by.as_deref());
            if former_owner == Some(caller_id) {
                Ok(Decision::AlreadyProcessed)
            } else {
                Err(unauthorized())
            }
        }
        FileState::Detached => {
            if file.detached_by.as_deref() == Some(caller_id) {
                Ok(Decision::AlreadyProcessed)
            } else {
                Err(unauthorized())
            }
        }
        FileState::Active => {
            if file.owner_id.as_deref() != Some(caller_id) {
                return Err(unauthorized());
            }
            if file.reference_count == 0 {
                Ok(Decision::HardDelete)
            } else {
                Ok(Decision::Detach)
            }
        }
    }
}

/// Whether the sweeper may finalize `file` at `now`
pub fn is_orphan_eligible(file: &StoredFile, now: DateTime<Utc>, grace_period: Duration) -> bool {
    if file.is_protected() || file.state != FileState::Detached || file.reference_count > 0 {
        return false;
    }
    match file.detached_at {
        Some(detached_at) => now - detached_at >= grace_period,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(owner: Option<&str>, state: FileState, refs: u64) -> StoredFile {
        let mut file = StoredFile::new(owner.map(String::from), "key", 64, "image/png", false);
        file.state = state;
        file.reference_count = refs;
        file
    }

    #[test]
    fn test_active_unreferenced_is_hard_deleted() {
        let f = file(Some("u1"), FileState::Active, 0);
        assert_eq!(decide(&f, "u1").unwrap(), Decision::HardDelete);
    }

    #[test]
    fn test_active_referenced_is_detached() {
        let f = file(Some("u1"), FileState::Active, 2);
        assert_eq!(decide(&f, "u1").unwrap(), Decision::Detach);
    }

    #[test]
    fn test_non_owner_is_rejected() {
        let f = file(Some("u1"), FileState::Active, 0);
        assert!(matches!(decide(&f, "u2"), Err(LifecycleError::Unauthorized { .. })));
    }

    #[test]
    fn test_protection_wins_over_zero_references() {
        let mut f = file(Some("u1"), FileState::Active, 0);
        f.is_system_protected = true;
        assert_eq!(decide(&f, "u1").unwrap(), Decision::Protected);
        // protection is checked before ownership
        assert_eq!(decide(&f, "someone-else").unwrap(), Decision::Protected);

        let g = file(None, FileState::Protected, 0);
        assert_eq!(decide(&g, "anyone").unwrap(), Decision::Protected);
    }

    #[test]
    fn test_repeat_requests_by_former_owner() {
        let deleted = file(Some("u1"), FileState::Deleted, 0);
        assert_eq!(decide(&deleted, "u1").unwrap(), Decision::AlreadyProcessed);
        assert!(decide(&deleted, "u2").is_err());

        let mut swept = file(None, FileState::Deleted, 0);
        swept.detached_by = Some("u1".into());
        assert_eq!(decide(&swept, "u1").unwrap(), Decision::AlreadyProcessed);
        assert!(decide(&swept, "u2").is_err());

        let mut detached = file(None, FileState::Detached, 1);
        detached.detached_by = Some("u1".into());
        assert_eq!(decide(&detached, "u1").unwrap(), Decision::AlreadyProcessed);
        assert!(matches!(
            decide(&detached, "u2"),
            Err(LifecycleError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_referenced_file_never_hard_deleted() {
        for refs in 1..5 {
            let f = file(Some("u1"), FileState::Active, refs);
            assert_ne!(decide(&f, "u1").unwrap(), Decision::HardDelete);
        }
    }

    #[test]
    fn test_orphan_eligibility() {
        let now = Utc::now();
        let grace = Duration::hours(24);

        let mut f = file(None, FileState::Detached, 0);
        f.detached_at = Some(now - Duration::hours(25));
        assert!(is_orphan_eligible(&f, now, grace));

        f.detached_at = Some(now - Duration::hours(1));
        assert!(!is_orphan_eligible(&f, now, grace));

        f.detached_at = Some(now - Duration::hours(25));
        f.reference_count = 1;
        assert!(!is_orphan_eligible(&f, now, grace));

        let active = file(Some("u1"), FileState::Active, 0);
        assert!(!is_orphan_eligible(&active, now, grace));
    }

    #[test]
    fn test_decision_operations() {
        assert_eq!(Decision::HardDelete.operation(), FileOperation::HardDeleted);
        assert_eq!(Decision::Detach.operation(), FileOperation::SoftDetached);
        assert!(Decision::Detach.mutates());
        assert!(!Decision::Protected.mutates());
    }
}
