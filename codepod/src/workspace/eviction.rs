//! Victim selection for idle sweeps and capacity overflow.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What to do when an acquire finds the pool full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict least-recently-active instances, sessionless ones first, until
    /// a slot frees.
    #[default]
    Lru,
    /// Force-remove every instance.
    FullSweep,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lru => write!(f, "lru"),
            Self::FullSweep => write!(f, "full_sweep"),
        }
    }
}

/// A live instance as seen by the eviction pass.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub project_id: String,
    pub last_activity_at: DateTime<Utc>,
    pub sessions: usize,
}

/// Order in which instances should be evicted to make room.
///
/// `Lru` returns every candidate, best victim first; the caller stops as
/// soon as a slot frees. `FullSweep` returns every candidate in project
/// order and the caller removes all of them.
pub fn overflow_victims(policy: EvictionPolicy, mut candidates: Vec<Candidate>) -> Vec<String> {
    match policy {
        EvictionPolicy::Lru => {
            candidates.sort_by(|a, b| {
                (a.sessions > 0, a.last_activity_at).cmp(&(b.sessions > 0, b.last_activity_at))
            });
        }
        EvictionPolicy::FullSweep => {
            candidates.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        }
    }
    candidates.into_iter().map(|c| c.project_id).collect()
}

/// Idle rule: no sessions and no activity for at least `idle_timeout`.
pub fn is_idle(
    last_activity_at: DateTime<Utc>,
    sessions: usize,
    idle_timeout: Duration,
    now: DateTime<Utc>,
) -> bool {
    if sessions > 0 {
        return false;
    }
    let idle_for = (now - last_activity_at).to_std().unwrap_or(Duration::ZERO);
    idle_for >= idle_timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(project_id: &str, minutes_ago: i64, sessions: usize) -> Candidate {
        Candidate {
            project_id: project_id.into(),
            last_activity_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            sessions,
        }
    }

    #[test]
    fn test_lru_prefers_sessionless_then_oldest() {
        let victims = overflow_victims(
            EvictionPolicy::Lru,
            vec![
                candidate("busy-old", 90, 2),
                candidate("quiet-new", 1, 0),
                candidate("quiet-old", 60, 0),
                candidate("busy-new", 2, 1),
            ],
        );
        assert_eq!(victims, vec!["quiet-old", "quiet-new", "busy-old", "busy-new"]);
    }

    #[test]
    fn test_full_sweep_returns_everything() {
        let victims = overflow_victims(
            EvictionPolicy::FullSweep,
            vec![candidate("b", 1, 1), candidate("a", 5, 0)],
        );
        assert_eq!(victims, vec!["a", "b"]);
    }

    #[test]
    fn test_is_idle() {
        let now = Utc::now();
        let timeout = Duration::from_secs(30 * 60);
        let old = now - chrono::Duration::minutes(31);
        let recent = now - chrono::Duration::minutes(5);

        assert!(is_idle(old, 0, timeout, now));
        assert!(!is_idle(old, 1, timeout, now));
        assert!(!is_idle(recent, 0, timeout, now));
        // Clock skew never makes an instance idle.
        assert!(!is_idle(now + chrono::Duration::minutes(1), 0, timeout, now));
    }

    #[test]
    fn test_policy_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: EvictionPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"full_sweep\"").unwrap();
        assert_eq!(w.policy, EvictionPolicy::FullSweep);
        assert_eq!(EvictionPolicy::default().to_string(), "lru");
    }
}
