//! Last-write-wins conflict resolution.
//!
//! `updated_at` comparison, not arrival order, decides which side wins.
//! Live-row resolution runs inside the atomic batch upsert; this module
//! is the same policy for paths that need an explicit decision, such as
//! tombstone application.

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Accept the remote row (strictly newer).
    AcceptRemote,
    /// Keep the local row (newer or equal; local tie-break).
    KeepLocal,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve between a local and a remote version of the same row.
    pub fn resolve(local_updated_at: i64, remote_updated_at: i64) -> Resolution {
        if remote_updated_at > local_updated_at {
            Resolution::AcceptRemote
        } else {
            Resolution::KeepLocal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_remote_wins() {
        assert_eq!(
            ConflictResolver::resolve(1000, 2000),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn older_remote_loses() {
        assert_eq!(
            ConflictResolver::resolve(2000, 1000),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn tie_keeps_local() {
        assert_eq!(
            ConflictResolver::resolve(1000, 1000),
            Resolution::KeepLocal
        );
    }
}
