//! Session configuration and orchestrator tunables.

use std::time::Duration;

/// Per-session state the orchestrator needs before it will run a cycle.
///
/// Constructed once per authenticated session and handed to the engine;
/// clearing it makes the next readiness check fail closed, which is how a
/// caller stops synchronizing (there is no in-flight cancellation).
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Pairing identifier shared by both members of the couple.
    pub couple_id: Option<String>,
    /// Identity of the local user, recorded as `created_by` on pushed rows.
    pub user_id: Option<String>,
    /// Whether the current entitlement allows sync at all.
    pub entitled: bool,
}

impl SessionConfig {
    pub fn new(couple_id: &str, user_id: &str) -> Self {
        Self {
            couple_id: Some(couple_id.to_string()),
            user_id: Some(user_id.to_string()),
            entitled: true,
        }
    }

    /// Check the readiness predicate. Returns the first unmet requirement.
    pub fn ready(&self) -> std::result::Result<(), String> {
        if self.couple_id.as_deref().map_or(true, str::is_empty) {
            return Err("no pairing configured".to_string());
        }
        if self.user_id.as_deref().map_or(true, str::is_empty) {
            return Err("no identity set".to_string());
        }
        if !self.entitled {
            return Err("entitlement not satisfied".to_string());
        }
        Ok(())
    }
}

/// Tunable constants for the sync orchestrator.
///
/// The defaults mirror observed production behavior but are deliberately
/// not a contract; callers may override any of them.
#[derive(Debug, Clone)]
pub struct SyncTunables {
    /// Rows fetched per pull page.
    pub pull_page_size: usize,
    /// Minimum interval between completed full cycles.
    pub min_sync_interval: Duration,
    /// Maximum upsert attempts per pushed row.
    pub max_push_attempts: u32,
    /// Delay before the first retry; doubled on each subsequent attempt.
    pub retry_base_delay: Duration,
}

impl Default for SyncTunables {
    fn default() -> Self {
        Self {
            pull_page_size: 500,
            min_sync_interval: Duration::from_secs(30),
            max_push_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}
