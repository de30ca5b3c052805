//! The synchronization cycle: collect, merge, clean up, fold in.
//!
//! Collection is deliberately sequential with a throttle delay between
//! hosts — the weakest embedded target sets the pace, and hammering it
//! concurrently is how documents get corrupted. One unreachable host
//! never aborts a cycle; it is recorded and the cycle moves on.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::sleep;

use crate::api::{DocumentClient, RequestOptions};
use crate::clock::SharedClock;
use crate::models::{Collection, Controller, Document, Patch, Syncable};
use crate::sync::directory::Directory;
use crate::sync::lock::LockCoordinator;
use crate::sync::store::MergedData;

/// Terminal and transient states of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::NotStarted
    }
}

/// Tunables of the collection cycle.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Deadline per host during collection.
    pub collect_timeout: Duration,
    /// Pause between hosts; protects the weakest radio in the fleet.
    pub host_throttle: Duration,
    /// Guard the cycle with the advisory lock. When the lock cannot be
    /// acquired the cycle fails instead of proceeding unguarded.
    pub use_sync_lock: bool,
    /// Our controller id for lock coordination. When unset, the first
    /// syncable controller in the directory stands in.
    pub self_id: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            collect_timeout: Duration::from_secs(8),
            host_throttle: Duration::from_millis(500),
            use_sync_lock: false,
            self_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct CycleState {
    status: SyncStatus,
    last_sync_ms: Option<i64>,
    last_failed_hosts: Vec<String>,
}

/// Drives full synchronization cycles across the fleet.
pub struct SyncOrchestrator {
    client: DocumentClient,
    directory: Directory,
    lock: LockCoordinator,
    clock: SharedClock,
    settings: SyncSettings,
    state: Mutex<CycleState>,
}

impl SyncOrchestrator {
    pub fn new(
        client: DocumentClient,
        directory: Directory,
        lock: LockCoordinator,
        clock: SharedClock,
        settings: SyncSettings,
    ) -> Self {
        Self {
            client,
            directory,
            lock,
            clock,
            settings,
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.lock_state().status
    }

    /// Wall-clock ms of the last completed cycle.
    pub fn last_sync_ms(&self) -> Option<i64> {
        self.lock_state().last_sync_ms
    }

    /// Labels of the hosts that failed during the last cycle.
    pub fn last_failed_hosts(&self) -> Vec<String> {
        self.lock_state().last_failed_hosts.clone()
    }

    /// Rearms a finished orchestrator so the next `synchronize` starts
    /// from scratch. No effect while a cycle is running.
    pub fn force_resync(&self) {
        let mut state = self.lock_state();
        if state.status != SyncStatus::Running {
            state.status = SyncStatus::NotStarted;
        }
    }

    /// Runs one cycle and returns the merged result on completion.
    ///
    /// Calling this while a cycle is already running is a no-op that
    /// returns `None` immediately — rejected, not queued. The merged
    /// maps are handed to the caller for the consuming store to fold
    /// in; nothing is written back to hosts during collection.
    pub async fn synchronize<F>(&self, mut progress: F) -> Option<MergedData>
    where
        F: FnMut(usize, usize),
    {
        {
            let mut state = self.lock_state();
            if state.status == SyncStatus::Running {
                tracing::info!("sync already in progress, skipping");
                return None;
            }
            state.status = SyncStatus::Running;
        }

        let result = self.run_cycle(&mut progress).await;

        let mut state = self.lock_state();
        match result {
            Some((merged, failed)) => {
                state.status = SyncStatus::Completed;
                state.last_sync_ms = Some(self.clock.now_ms());
                state.last_failed_hosts = failed;
                Some(merged)
            }
            None => {
                state.status = SyncStatus::Failed;
                None
            }
        }
    }

    async fn run_cycle<F>(&self, progress: &mut F) -> Option<(MergedData, Vec<String>)>
    where
        F: FnMut(usize, usize),
    {
        let controllers = self.directory.syncable().await;
        if controllers.is_empty() {
            tracing::error!("no syncable controllers in the directory");
            return None;
        }
        tracing::info!(hosts = controllers.len(), "starting sync cycle");

        let mut locked: Vec<String> = Vec::new();
        if self.settings.use_sync_lock {
            let self_id = match self.resolve_self_id(&controllers) {
                Some(id) => id,
                None => {
                    tracing::error!("cannot determine own controller id for locking");
                    return None;
                }
            };
            match self.lock.acquire(&self_id, &controllers).await {
                Ok(hosts) => locked = hosts,
                Err(e) => {
                    tracing::warn!(error = %e, "sync lock not acquired, aborting cycle");
                    return None;
                }
            }
        }

        let (mut merged, rejects, failed) = self.collect(&controllers, progress).await;
        self.cleanup(&mut merged, rejects, &controllers).await;

        if !locked.is_empty() {
            self.lock.release(&locked).await;
        }

        tracing::info!(
            presets = merged.presets.len(),
            scenes = merged.scenes.len(),
            groups = merged.groups.len(),
            failed = failed.len(),
            "sync cycle completed"
        );
        Some((merged, failed))
    }

    /// Sequential collection with throttle and per-host deadline.
    async fn collect<F>(
        &self,
        controllers: &[Controller],
        progress: &mut F,
    ) -> (MergedData, Vec<(Collection, String)>, Vec<String>)
    where
        F: FnMut(usize, usize),
    {
        let total = controllers.len();
        let opts = RequestOptions::with_timeout(self.settings.collect_timeout);
        let mut acc = MergeAccumulator::default();
        let mut failed = Vec::new();

        for (index, controller) in controllers.iter().enumerate() {
            match self.client.get_document_with(&controller.ip_address, &opts).await {
                Ok(doc) => {
                    tracing::debug!(host = %controller.label(), "collected document");
                    acc.add(&controller.id, doc);
                }
                Err(e) => {
                    tracing::warn!(host = %controller.label(), error = %e, "collection failed for host");
                    failed.push(controller.label().to_string());
                }
            }

            progress(index + 1, total);
            if index + 1 < total {
                sleep(self.settings.host_throttle).await;
            }
        }

        let (merged, rejects) = acc.finish();
        (merged, rejects, failed)
    }

    /// Post-merge hygiene: scenes left without any usable controller
    /// reference and entries rejected during validation are deleted
    /// from the fleet and dropped from the merge, so they cannot be
    /// folded back in.
    async fn cleanup(
        &self,
        merged: &mut MergedData,
        rejects: Vec<(Collection, String)>,
        controllers: &[Controller],
    ) {
        let mut doomed = rejects;

        let empty_scenes: Vec<String> = merged
            .scenes
            .values()
            .filter(|s| s.usable_settings().next().is_none())
            .map(|s| s.id.clone())
            .collect();
        for id in empty_scenes {
            tracing::info!(id = id.as_str(), "pruning scene without usable settings");
            merged.scenes.remove(&id);
            doomed.push((Collection::Scenes, id));
        }

        doomed.sort();
        doomed.dedup();
        for (collection, id) in doomed {
            self.delete_everywhere(collection, &id, controllers).await;
        }
    }

    async fn delete_everywhere(
        &self,
        collection: Collection,
        id: &str,
        controllers: &[Controller],
    ) {
        let patch = Patch::remove(collection, id);
        for controller in controllers {
            match self.client.patch_document(&controller.ip_address, &patch).await {
                Ok(()) => {
                    tracing::debug!(%collection, id, host = %controller.label(), "pruned entry")
                }
                Err(e) if e.is_bad_selector() => {}
                Err(e) => {
                    tracing::warn!(%collection, id, host = %controller.label(), error = %e, "prune failed")
                }
            }
        }
    }

    fn resolve_self_id(&self, controllers: &[Controller]) -> Option<String> {
        if let Some(id) = &self.settings.self_id {
            return Some(id.clone());
        }
        controllers.first().map(|c| c.id.clone())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Accumulates validated entities across host documents, keeping the
/// max-`ts` winner per id. Equal timestamps go to the entity reported
/// by the lexicographically smallest controller id, so the outcome is
/// independent of host iteration order.
#[derive(Default)]
struct MergeAccumulator {
    presets: HashMap<String, (crate::models::Preset, String)>,
    scenes: HashMap<String, (crate::models::Scene, String)>,
    groups: HashMap<String, (crate::models::Group, String)>,
    controllers: HashMap<String, (crate::models::ControllerMeta, String)>,
    rejects: Vec<(Collection, String)>,
}

impl MergeAccumulator {
    fn add(&mut self, source_id: &str, doc: Document) {
        let Document {
            presets,
            scenes,
            groups,
            controllers,
            ..
        } = doc;
        merge_entities(&mut self.presets, &mut self.rejects, presets, source_id);
        merge_entities(&mut self.scenes, &mut self.rejects, scenes, source_id);
        merge_entities(&mut self.groups, &mut self.rejects, groups, source_id);
        merge_entities(&mut self.controllers, &mut self.rejects, controllers, source_id);
    }

    fn finish(self) -> (MergedData, Vec<(Collection, String)>) {
        (
            MergedData {
                presets: strip_sources(self.presets),
                scenes: strip_sources(self.scenes),
                groups: strip_sources(self.groups),
                controllers: strip_sources(self.controllers),
            },
            self.rejects,
        )
    }
}

fn merge_entities<T: Syncable>(
    winners: &mut HashMap<String, (T, String)>,
    rejects: &mut Vec<(Collection, String)>,
    items: Vec<T>,
    source_id: &str,
) {
    for item in items {
        if !item.is_valid() {
            tracing::warn!(
                collection = %T::collection(),
                id = item.id(),
                source = source_id,
                "dropping malformed entry"
            );
            // junk with a usable id can still be scrubbed off the fleet
            if !item.id().is_empty() && item.id() != "0" {
                rejects.push((T::collection(), item.id().to_string()));
            }
            continue;
        }

        let wins = match winners.get(item.id()) {
            None => true,
            Some((existing, existing_source)) => {
                item.ts() > existing.ts()
                    || (item.ts() == existing.ts() && source_id < existing_source.as_str())
            }
        };
        if wins {
            winners.insert(item.id().to_string(), (item, source_id.to_string()));
        }
    }
}

fn strip_sources<T>(map: HashMap<String, (T, String)>) -> HashMap<String, T> {
    map.into_iter().map(|(k, (v, _))| (k, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GatewayPolicy, HostGateway};
    use crate::clock::test_clock::ManualClock;
    use crate::models::{Preset, Scene, SceneSetting, SyncLock};
    use crate::sync::lock::LockSettings;
    use crate::testutil::MockController;
    use serde_json::json;
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000_000;

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            collect_timeout: Duration::from_secs(2),
            host_throttle: Duration::from_millis(10),
            use_sync_lock: false,
            self_id: None,
        }
    }

    async fn orchestrator_with(
        controllers: Vec<Controller>,
        settings: SyncSettings,
    ) -> SyncOrchestrator {
        let gateway = HostGateway::new(GatewayPolicy {
            request_timeout: Duration::from_secs(2),
            max_retries: 0,
            retry_base_delay: Duration::from_millis(10),
        });
        let client = DocumentClient::new(Arc::new(gateway));
        let directory = Directory::spawn();
        directory.replace_all(controllers).await;
        let clock: SharedClock = Arc::new(ManualClock::at(NOW));
        let lock = LockCoordinator::new(
            client.clone(),
            clock.clone(),
            LockSettings {
                verify_retries: 1,
                verify_delay_ms: 10,
                ..LockSettings::default()
            },
        );
        SyncOrchestrator::new(client, directory, lock, clock, settings)
    }

    fn controller(id: &str, ip: String) -> Controller {
        Controller::new(id, format!("host-{}", id), ip)
    }

    fn preset(id: &str, name: &str, ts: i64) -> Preset {
        Preset {
            id: id.into(),
            name: name.into(),
            ts,
            color: json!({"r": 0, "g": 0, "b": 0}),
            ..Preset::default()
        }
    }

    #[tokio::test]
    async fn test_merge_keeps_newest_and_tolerates_unreachable_host() {
        let a = MockController::spawn().await;
        a.update_document(|doc| doc.presets.push(preset("p1", "from-a", 100)));
        let b = MockController::spawn().await;
        b.update_document(|doc| doc.presets.push(preset("p1", "from-b", 200)));

        let orchestrator = orchestrator_with(
            vec![
                controller("c1", a.host()),
                controller("c2", b.host()),
                controller("c3", "127.0.0.1:1".to_string()), // unreachable
            ],
            fast_settings(),
        )
        .await;

        let mut seen = Vec::new();
        let merged = orchestrator
            .synchronize(|done, total| seen.push((done, total)))
            .await
            .expect("cycle completes despite the dead host");

        assert_eq!(merged.presets.len(), 1);
        assert_eq!(merged.presets["p1"].name, "from-b");
        assert_eq!(merged.presets["p1"].ts, 200);

        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(orchestrator.status(), SyncStatus::Completed);
        assert_eq!(orchestrator.last_sync_ms(), Some(NOW));
        assert_eq!(orchestrator.last_failed_hosts(), vec!["host-c3".to_string()]);
    }

    #[tokio::test]
    async fn test_equal_ts_tie_breaks_by_smallest_source_id() {
        // the host with the larger controller id is listed (and read)
        // first; the smaller id must still win the tie
        let first = MockController::spawn().await;
        first.update_document(|doc| doc.presets.push(preset("p1", "from-c9", 500)));
        let second = MockController::spawn().await;
        second.update_document(|doc| doc.presets.push(preset("p1", "from-c1", 500)));

        let orchestrator = orchestrator_with(
            vec![controller("c9", first.host()), controller("c1", second.host())],
            fast_settings(),
        )
        .await;

        let merged = orchestrator.synchronize(|_, _| {}).await.unwrap();
        assert_eq!(merged.presets["p1"].name, "from-c1");
    }

    #[tokio::test]
    async fn test_malformed_entries_are_dropped() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| {
            doc.presets.push(preset("good", "kept", 10));
            doc.presets.push(preset("no-ts", "dropped", 0));
            doc.presets.push(preset("", "no-id", 10));
        });

        let orchestrator =
            orchestrator_with(vec![controller("c1", mock.host())], fast_settings()).await;

        let merged = orchestrator.synchronize(|_, _| {}).await.unwrap();
        assert_eq!(merged.presets.len(), 1);
        assert!(merged.presets.contains_key("good"));
    }

    #[tokio::test]
    async fn test_rejected_entries_are_scrubbed_from_hosts() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| {
            doc.presets.push(preset("junk", "", 10)); // empty name: invalid
        });

        let orchestrator =
            orchestrator_with(vec![controller("c1", mock.host())], fast_settings()).await;
        let merged = orchestrator.synchronize(|_, _| {}).await.unwrap();

        assert!(merged.presets.is_empty());
        assert!(mock.document().presets.is_empty());
    }

    #[tokio::test]
    async fn test_scene_without_usable_settings_is_pruned() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| {
            let mut orphan = Scene::new(
                "orphan",
                vec![SceneSetting {
                    controller_id: None,
                    settings: Default::default(),
                }],
            );
            orphan.id = "s1".into();
            orphan.ts = 10;
            doc.scenes.push(orphan);
        });

        let orchestrator =
            orchestrator_with(vec![controller("c1", mock.host())], fast_settings()).await;
        let merged = orchestrator.synchronize(|_, _| {}).await.unwrap();

        assert!(merged.scenes.is_empty());
        assert!(mock.document().scenes.is_empty());
    }

    #[tokio::test]
    async fn test_second_synchronize_while_running_returns_immediately() {
        let slow = MockController::spawn().await;
        slow.set_handling_delay(Duration::from_millis(300));

        let orchestrator = Arc::new(
            orchestrator_with(vec![controller("c1", slow.host())], fast_settings()).await,
        );

        let background = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.synchronize(|_, _| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(orchestrator.status(), SyncStatus::Running);
        let second = orchestrator.synchronize(|_, _| {}).await;
        assert!(second.is_none());

        let first = background.await.unwrap();
        assert!(first.is_some());
        assert_eq!(orchestrator.status(), SyncStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_directory_fails_the_cycle() {
        let orchestrator = orchestrator_with(Vec::new(), fast_settings()).await;
        assert!(orchestrator.synchronize(|_, _| {}).await.is_none());
        assert_eq!(orchestrator.status(), SyncStatus::Failed);

        orchestrator.force_resync();
        assert_eq!(orchestrator.status(), SyncStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_locked_cycle_aborts_on_fresh_foreign_lock() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| {
            doc.sync_lock = Some(SyncLock::held_by("rival", NOW - 1_000));
        });

        let settings = SyncSettings {
            use_sync_lock: true,
            self_id: Some("me".to_string()),
            ..fast_settings()
        };
        let orchestrator =
            orchestrator_with(vec![controller("c1", mock.host())], settings).await;

        assert!(orchestrator.synchronize(|_, _| {}).await.is_none());
        assert_eq!(orchestrator.status(), SyncStatus::Failed);
        // the rival's lock is untouched
        assert_eq!(mock.document().sync_lock.unwrap().id, "rival");
    }

    #[tokio::test]
    async fn test_locked_cycle_acquires_and_releases() {
        let mock = MockController::spawn().await;
        mock.update_document(|doc| doc.presets.push(preset("p1", "kept", 10)));

        let settings = SyncSettings {
            use_sync_lock: true,
            self_id: Some("c1".to_string()),
            ..fast_settings()
        };
        let orchestrator =
            orchestrator_with(vec![controller("c1", mock.host())], settings).await;

        let merged = orchestrator.synchronize(|_, _| {}).await.unwrap();
        assert_eq!(merged.presets.len(), 1);
        // lock released after the cycle
        assert!(mock.document().sync_lock.unwrap().is_unlocked());
    }
}
