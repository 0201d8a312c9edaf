//! Host migration after an unexpected loss of the host.
//!
//! Every client holds the last roster its host broadcast. On host loss each
//! client sorts that roster the same way and walks it from the front:
//! 1. If the candidate is us, take over as host
//! 2. Otherwise wait a grace period, then try to join the candidate
//! 3. On join failure move to the next candidate
//!
//! Because the order is a pure function of the shared roster, all survivors
//! agree on the winner without talking to each other.

use crate::error::Result;
use crate::PeerId;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ordered candidate list for a migration.
///
/// Lexicographic `PeerId` order; duplicates removed. The roster already names
/// the local peer when the host had admitted us.
pub fn election_order(roster: &[PeerId]) -> Vec<PeerId> {
    let mut candidates = roster.to_vec();
    candidates.sort();
    candidates.dedup();
    candidates
}

/// How a migration run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// We are the first reachable candidate; become host.
    Promote,
    /// Joined this peer as the new host.
    Migrated(PeerId),
    /// Every candidate failed.
    Exhausted { tried: usize },
}

/// The join step of a migration, supplied by the room coordinator.
#[async_trait]
pub trait MigrationJoiner: Send + Sync {
    /// Attempt to join `host`, resolving once it has admitted us with its
    /// storage snapshot, or the attempt failed. An open channel alone is not
    /// enough: a candidate that is not hosting never admits anyone.
    async fn join(&self, host: &PeerId) -> Result<()>;
}

/// Walk `candidates` in order until one succeeds.
///
/// Runs as its own task; dropping or aborting it at any await point stops
/// the migration with no further side effects.
pub async fn run_migration(
    local: &PeerId,
    candidates: &[PeerId],
    grace: Duration,
    joiner: &dyn MigrationJoiner,
) -> MigrationOutcome {
    for (index, candidate) in candidates.iter().enumerate() {
        if candidate == local {
            info!("Migration: promoting self (candidate {})", index);
            return MigrationOutcome::Promote;
        }

        debug!(
            "Migration: waiting {:?} before trying candidate {} ({})",
            grace, index, candidate
        );
        tokio::time::sleep(grace).await;

        match joiner.join(candidate).await {
            Ok(()) => {
                info!("Migration: joined new host {}", candidate);
                return MigrationOutcome::Migrated(candidate.clone());
            }
            Err(e) => {
                warn!("Migration: candidate {} unreachable: {}", candidate, e);
            }
        }
    }

    warn!(
        "Migration: exhausted {} candidate(s) without a host",
        candidates.len()
    );
    MigrationOutcome::Exhausted {
        tried: candidates.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoomError;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn peer(id: &str) -> PeerId {
        id.parse().unwrap()
    }

    fn peers(ids: &[&str]) -> Vec<PeerId> {
        ids.iter().map(|id| peer(id)).collect()
    }

    /// Joiner that succeeds only for reachable peers and records attempts.
    struct FakeJoiner {
        reachable: HashSet<PeerId>,
        attempts: Mutex<Vec<PeerId>>,
    }

    impl FakeJoiner {
        fn new(reachable: &[&str]) -> Self {
            Self {
                reachable: reachable.iter().map(|id| peer(id)).collect(),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<PeerId> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MigrationJoiner for FakeJoiner {
        async fn join(&self, host: &PeerId) -> Result<()> {
            self.attempts.lock().unwrap().push(host.clone());
            if self.reachable.contains(host) {
                Ok(())
            } else {
                Err(RoomError::Connect {
                    peer: host.clone(),
                    reason: "unreachable".into(),
                })
            }
        }
    }

    #[test]
    fn test_election_order_sorts_and_dedups() {
        assert_eq!(
            election_order(&peers(&["b", "a", "c", "a"])),
            peers(&["a", "b", "c"])
        );
        assert!(election_order(&[]).is_empty());
    }

    #[test]
    fn test_election_order_is_byte_order() {
        assert_eq!(
            election_order(&peers(&["b", "B", "a10", "a2"])),
            peers(&["B", "a10", "a2", "b"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_smallest_candidate_promotes_itself() {
        let joiner = FakeJoiner::new(&[]);
        let candidates = election_order(&peers(&["b", "a", "c"]));

        let start = tokio::time::Instant::now();
        let outcome = run_migration(&peer("a"), &candidates, Duration::from_millis(1500), &joiner).await;

        assert_eq!(outcome, MigrationOutcome::Promote);
        assert!(joiner.attempts().is_empty());
        // No grace period before promoting ourselves
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_others_join_smallest_after_grace() {
        let joiner = FakeJoiner::new(&["a"]);
        let candidates = election_order(&peers(&["b", "a", "c"]));

        let start = tokio::time::Instant::now();
        let outcome = run_migration(&peer("c"), &candidates, Duration::from_millis(1500), &joiner).await;

        assert_eq!(outcome, MigrationOutcome::Migrated(peer("a")));
        assert_eq!(joiner.attempts(), peers(&["a"]));
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_candidate_falls_through_to_self() {
        let joiner = FakeJoiner::new(&[]);
        let candidates = election_order(&peers(&["b", "a", "c"]));

        let outcome = run_migration(&peer("b"), &candidates, Duration::from_millis(1000), &joiner).await;

        assert_eq!(outcome, MigrationOutcome::Promote);
        assert_eq!(joiner.attempts(), peers(&["a"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_when_local_not_listed() {
        let joiner = FakeJoiner::new(&[]);
        let candidates = peers(&["x", "y"]);

        let outcome = run_migration(&peer("z"), &candidates, Duration::from_millis(100), &joiner).await;

        assert_eq!(outcome, MigrationOutcome::Exhausted { tried: 2 });
        assert_eq!(joiner.attempts(), candidates);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_roster_exhausts_immediately() {
        let joiner = FakeJoiner::new(&[]);
        let outcome = run_migration(&peer("a"), &[], Duration::from_millis(100), &joiner).await;
        assert_eq!(outcome, MigrationOutcome::Exhausted { tried: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_grace_stops_migration() {
        let joiner = std::sync::Arc::new(FakeJoiner::new(&["a"]));
        let task_joiner = std::sync::Arc::clone(&joiner);
        let task = tokio::spawn(async move {
            run_migration(&peer("c"), &peers(&["a", "c"]), Duration::from_secs(5), &*task_joiner).await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(joiner.attempts().is_empty());
    }
}
