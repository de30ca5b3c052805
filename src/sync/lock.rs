//! Advisory distributed lock over the controller fleet.
//!
//! The lock is a `{id, ts}` marker inside each host's shared document:
//! cooperative, quorum-free, and overridable once stale. Writes are
//! never trusted without a read-back — the embedded targets are known
//! to silently drop or reorder them.

use std::time::Duration;

use tokio::time::sleep;

use crate::api::DocumentClient;
use crate::clock::SharedClock;
use crate::models::{Controller, Patch, SyncLock};

/// Tunables of the lock protocol.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Age after which a held lock counts as abandoned.
    pub stale_lock_ms: i64,
    /// Soft minimum of verified acquisitions, not a majority quorum.
    pub min_required_locks: usize,
    /// Read-back attempts per host.
    pub verify_retries: u32,
    /// Base wait between read-backs; attempt `n` waits `n` times this.
    pub verify_delay_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_lock_ms: 5 * 60 * 1000,
            min_required_locks: 1,
            verify_retries: 3,
            verify_delay_ms: 150,
        }
    }
}

/// Why an acquisition attempt failed as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another client holds a fresh lock; everything taken this
    /// attempt has been rolled back.
    Conflict { host: String, holder: String },
    /// Fewer hosts verified the lock than the configured minimum.
    BelowMinimum { acquired: usize, required: usize },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Conflict { host, holder } => {
                write!(f, "sync lock on {} is held by {}", host, holder)
            }
            LockError::BelowMinimum { acquired, required } => {
                write!(
                    f,
                    "only {} of the required {} lock(s) were verified",
                    acquired, required
                )
            }
        }
    }
}

impl std::error::Error for LockError {}

/// Coordinates the advisory lock across every syncable controller.
pub struct LockCoordinator {
    client: DocumentClient,
    clock: SharedClock,
    settings: LockSettings,
}

impl LockCoordinator {
    pub fn new(client: DocumentClient, clock: SharedClock, settings: LockSettings) -> Self {
        Self {
            client,
            clock,
            settings,
        }
    }

    /// Optimistic availability probe: the lock is available unless some
    /// reachable host reports a fresh lock held by someone else.
    /// Unreachable hosts never block.
    pub async fn check_available(&self, self_id: &str, controllers: &[Controller]) -> bool {
        let now = self.clock.now_ms();
        for host in dedupe_by_ip(controllers, self_id) {
            let doc = match self.client.get_document(&host.ip_address).await {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::debug!(host = %host.label(), error = %e, "lock check skipped unreachable host");
                    continue;
                }
            };
            if let Some(lock) = doc.sync_lock {
                if lock.blocks(self_id, now, self.settings.stale_lock_ms) {
                    tracing::info!(host = %host.label(), holder = %lock.id, "sync lock unavailable");
                    return false;
                }
            }
        }
        true
    }

    /// Acquires the lock on every reachable controller, own host first.
    ///
    /// A fresh foreign lock anywhere aborts the attempt and rolls back
    /// every lock already taken. Hosts that cannot be read, written, or
    /// verified are skipped — they count against the minimum but never
    /// abort the rest. Returns the ip addresses that verified the lock.
    pub async fn acquire(
        &self,
        self_id: &str,
        controllers: &[Controller],
    ) -> Result<Vec<String>, LockError> {
        let hosts = dedupe_by_ip(controllers, self_id);
        let mut acquired: Vec<String> = Vec::new();

        tracing::debug!(self_id, hosts = hosts.len(), "acquiring sync lock");
        for host in &hosts {
            let doc = match self.client.get_document(&host.ip_address).await {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(host = %host.label(), error = %e, "lock read failed, skipping host");
                    continue;
                }
            };

            let now = self.clock.now_ms();
            if let Some(lock) = &doc.sync_lock {
                if lock.blocks(self_id, now, self.settings.stale_lock_ms) {
                    tracing::info!(host = %host.label(), holder = %lock.id, "fresh foreign lock, rolling back");
                    self.release(&acquired).await;
                    return Err(LockError::Conflict {
                        host: host.label().to_string(),
                        holder: lock.id.clone(),
                    });
                }
                if !lock.is_unlocked() && lock.id != self_id {
                    tracing::info!(host = %host.label(), holder = %lock.id, "overriding stale lock");
                }
            }

            let patch = Patch::set_lock(&SyncLock::held_by(self_id, now));
            if let Err(e) = self.client.patch_document(&host.ip_address, &patch).await {
                tracing::warn!(host = %host.label(), error = %e, "lock write failed, skipping host");
                continue;
            }

            if self.verify(self_id, &host.ip_address).await {
                acquired.push(host.ip_address.clone());
            } else {
                tracing::warn!(host = %host.label(), "lock write did not verify");
            }
        }

        if acquired.len() < self.settings.min_required_locks {
            let got = acquired.len();
            self.release(&acquired).await;
            return Err(LockError::BelowMinimum {
                acquired: got,
                required: self.settings.min_required_locks,
            });
        }

        tracing::info!(self_id, count = acquired.len(), "sync lock held");
        Ok(acquired)
    }

    /// Read-back confirmation that the stored lock carries our id.
    async fn verify(&self, self_id: &str, ip: &str) -> bool {
        for attempt in 1..=self.settings.verify_retries {
            // give the target time to settle; slower each round
            sleep(Duration::from_millis(
                self.settings.verify_delay_ms * attempt as u64,
            ))
            .await;

            match self.client.get_document(ip).await {
                Ok(doc) => {
                    if doc.sync_lock.as_ref().is_some_and(|l| l.id == self_id) {
                        return true;
                    }
                    tracing::debug!(ip, attempt, "lock not visible yet");
                }
                Err(e) => {
                    tracing::debug!(ip, attempt, error = %e, "lock verify read failed");
                }
            }
        }
        false
    }

    /// Best-effort release: write the cleared lock to each host,
    /// deduplicated by ip. Failures are logged, never escalated.
    pub async fn release(&self, hosts: &[String]) {
        let mut seen: Vec<&str> = Vec::new();
        for ip in hosts {
            if seen.contains(&ip.as_str()) {
                continue;
            }
            seen.push(ip);

            let patch = Patch::set_lock(&SyncLock::released());
            match self.client.patch_document(ip, &patch).await {
                Ok(()) => tracing::debug!(ip = ip.as_str(), "sync lock released"),
                Err(e) => {
                    tracing::warn!(ip = ip.as_str(), error = %e, "sync lock release failed")
                }
            }
        }
    }
}

/// Unique-ip host list with `self_id`'s own controller first — taking
/// the local lock first shortens the contention window for the common
/// case.
fn dedupe_by_ip<'a>(controllers: &'a [Controller], self_id: &str) -> Vec<&'a Controller> {
    let mut out: Vec<&Controller> = Vec::new();
    let own = controllers.iter().filter(|c| c.id == self_id);
    let others = controllers.iter().filter(|c| c.id != self_id);
    for c in own.chain(others) {
        if c.ip_address.is_empty() {
            continue;
        }
        if !out.iter().any(|seen| seen.ip_address == c.ip_address) {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GatewayPolicy, HostGateway};
    use crate::clock::test_clock::ManualClock;
    use crate::testutil::MockController;
    use std::sync::Arc;

    const NOW: i64 = 1_000_000_000;

    fn coordinator(min_required: usize) -> LockCoordinator {
        let gateway = HostGateway::new(GatewayPolicy {
            request_timeout: Duration::from_secs(2),
            max_retries: 0,
            retry_base_delay: Duration::from_millis(10),
        });
        LockCoordinator::new(
            DocumentClient::new(Arc::new(gateway)),
            Arc::new(ManualClock::at(NOW)),
            LockSettings {
                stale_lock_ms: 300_000,
                min_required_locks: min_required,
                verify_retries: 2,
                verify_delay_ms: 10,
            },
        )
    }

    fn controller(id: &str, ip: String) -> Controller {
        Controller::new(id, format!("host-{}", id), ip)
    }

    #[tokio::test]
    async fn test_acquire_writes_and_verifies_on_every_host() {
        let a = MockController::spawn().await;
        let b = MockController::spawn().await;
        let hosts = [controller("me", a.host()), controller("c2", b.host())];

        let locked = coordinator(1).acquire("me", &hosts).await.unwrap();

        assert_eq!(locked, vec![a.host(), b.host()]);
        assert_eq!(a.document().sync_lock.unwrap().id, "me");
        assert_eq!(b.document().sync_lock.unwrap().id, "me");
    }

    #[tokio::test]
    async fn test_fresh_foreign_lock_aborts_and_rolls_back() {
        let ours = MockController::spawn().await;
        let held = MockController::spawn().await;
        held.update_document(|doc| {
            doc.sync_lock = Some(SyncLock::held_by("rival", NOW - 1_000));
        });

        // iteration order: ours first (acquired), then the held host
        let hosts = [controller("me", ours.host()), controller("c2", held.host())];
        let err = coordinator(1).acquire("me", &hosts).await.unwrap_err();

        assert_eq!(
            err,
            LockError::Conflict {
                host: "host-c2".into(),
                holder: "rival".into(),
            }
        );
        // the lock we had already taken must be cleared again
        assert!(ours.document().sync_lock.unwrap().is_unlocked());
        // the rival's lock is untouched
        assert_eq!(held.document().sync_lock.unwrap().id, "rival");
    }

    #[tokio::test]
    async fn test_stale_foreign_lock_is_overridden() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| {
            doc.sync_lock = Some(SyncLock::held_by("rival", NOW - 600_000));
        });

        let hosts = [controller("me", mock.host())];
        let locked = coordinator(1).acquire("me", &hosts).await.unwrap();

        assert_eq!(locked.len(), 1);
        assert_eq!(mock.document().sync_lock.unwrap().id, "me");
    }

    #[tokio::test]
    async fn test_dropped_writes_fail_verification_and_the_minimum() {
        let mock = MockController::spawn().await;
        mock.set_drop_lock_writes(true);

        let hosts = [controller("me", mock.host())];
        let err = coordinator(1).acquire("me", &hosts).await.unwrap_err();

        assert_eq!(
            err,
            LockError::BelowMinimum {
                acquired: 0,
                required: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_does_not_abort_others() {
        let reachable = MockController::spawn().await;
        let hosts = [
            controller("c9", "127.0.0.1:1".to_string()), // closed port
            controller("me", reachable.host()),
        ];

        let locked = coordinator(1).acquire("me", &hosts).await.unwrap();
        assert_eq!(locked, vec![reachable.host()]);
    }

    #[tokio::test]
    async fn test_check_available_cases() {
        let mock = MockController::spawn().await;
        let hosts = [controller("me", mock.host())];
        let coordinator = coordinator(1);

        // no lock at all
        assert!(coordinator.check_available("me", &hosts).await);

        // own lock
        mock.update_document(|doc| doc.sync_lock = Some(SyncLock::held_by("me", NOW)));
        assert!(coordinator.check_available("me", &hosts).await);

        // fresh foreign lock
        mock.update_document(|doc| doc.sync_lock = Some(SyncLock::held_by("rival", NOW)));
        assert!(!coordinator.check_available("me", &hosts).await);

        // stale foreign lock
        mock.update_document(|doc| {
            doc.sync_lock = Some(SyncLock::held_by("rival", NOW - 600_000))
        });
        assert!(coordinator.check_available("me", &hosts).await);

        // unreachable hosts are optimistic
        let gone = [controller("c9", "127.0.0.1:1".to_string())];
        assert!(coordinator.check_available("me", &gone).await);
    }

    #[tokio::test]
    async fn test_release_dedupes_by_ip() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| doc.sync_lock = Some(SyncLock::held_by("me", NOW)));

        let hosts = vec![mock.host(), mock.host()];
        coordinator(1).release(&hosts).await;

        assert_eq!(mock.posted_bodies().len(), 1);
        assert!(mock.document().sync_lock.unwrap().is_unlocked());
    }
}
