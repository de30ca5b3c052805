//! Local synced state and the mutation path that fans writes out to
//! the fleet.
//!
//! Every save reads the target host's document first and only pushes
//! when the local copy is newer — last-write-wins by `ts`, no field
//! merging. Per-host failures are collected, never fatal: callers get
//! a partial-success report and the local state is updated regardless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::api::DocumentClient;
use crate::clock::SharedClock;
use crate::ident::IdGenerator;
use crate::models::{ControllerMeta, Group, Patch, Preset, Scene, Syncable};
use crate::sync::directory::Directory;

/// One host's failure during a fan-out loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub host: String,
    pub error: String,
}

/// Result of a save or delete fan-out.
#[derive(Debug, Clone, Default)]
pub struct MutationOutcome {
    /// Overall success; per-host failures do not clear this.
    pub ok: bool,
    /// The loop was abandoned via the cooperative abort flag.
    pub aborted: bool,
    /// Hosts the loop iterated over.
    pub attempted: usize,
    pub errors: Vec<HostError>,
}

/// Local validation failure; nothing was sent anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Validation(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Validation(msg) => write!(f, "validation failed: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Per-collection winners of a merge, keyed by entity id.
#[derive(Debug, Clone, Default)]
pub struct MergedData {
    pub presets: HashMap<String, Preset>,
    pub scenes: HashMap<String, Scene>,
    pub groups: HashMap<String, Group>,
    pub controllers: HashMap<String, ControllerMeta>,
}

/// Snapshot of the locally held synced state.
#[derive(Debug, Clone, Default)]
pub struct StoreData {
    pub presets: Vec<Preset>,
    pub scenes: Vec<Scene>,
    pub groups: Vec<Group>,
    pub controller_meta: Vec<ControllerMeta>,
    /// Opaque passthrough; never interpreted here.
    pub last_color: Value,
}

/// The externally consumed store: merged state plus mutations that
/// propagate to every controller in the directory.
pub struct SyncableStore {
    client: DocumentClient,
    directory: Directory,
    clock: SharedClock,
    ids: IdGenerator,
    data: Mutex<StoreData>,
    abort_flag: AtomicBool,
}

impl SyncableStore {
    pub fn new(
        client: DocumentClient,
        directory: Directory,
        clock: SharedClock,
        ids: IdGenerator,
    ) -> Self {
        Self {
            client,
            directory,
            clock,
            ids,
            data: Mutex::new(StoreData::default()),
            abort_flag: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> StoreData {
        self.lock_data().clone()
    }

    /// Requests abandonment of the save loop currently in flight. The
    /// flag is checked between host iterations, so the in-flight
    /// request still settles first.
    pub fn abort_save(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    /// Records the most recent color state. Opaque to the sync core;
    /// merges never touch it.
    pub fn set_last_color(&self, color: Value) {
        self.lock_data().last_color = color;
    }

    /// Folds a completed merge into local state, replacing the synced
    /// collections. Preset favorites are local-only and survive by id.
    pub fn apply_merged(&self, merged: MergedData) {
        let mut data = self.lock_data();

        let favorites: Vec<String> = data
            .presets
            .iter()
            .filter(|p| p.favorite)
            .map(|p| p.id.clone())
            .collect();

        data.presets = sorted_by_id(merged.presets);
        for preset in &mut data.presets {
            preset.favorite = favorites.contains(&preset.id);
        }
        data.scenes = sorted_by_id(merged.scenes);
        data.groups = sorted_by_id(merged.groups);
        data.controller_meta = sorted_by_id(merged.controllers);
    }

    pub async fn save_preset<F: FnMut(usize, usize)>(
        &self,
        mut preset: Preset,
        progress: F,
    ) -> Result<MutationOutcome, StoreError> {
        self.prepare(&mut preset)?;
        let outcome = self.push_entity(&preset, progress).await;
        upsert_by_id(&mut self.lock_data().presets, preset, |p| p.id.clone());
        Ok(outcome)
    }

    pub async fn save_scene<F: FnMut(usize, usize)>(
        &self,
        mut scene: Scene,
        progress: F,
    ) -> Result<MutationOutcome, StoreError> {
        self.prepare(&mut scene)?;
        let outcome = self.push_entity(&scene, progress).await;
        upsert_by_id(&mut self.lock_data().scenes, scene, |s| s.id.clone());
        Ok(outcome)
    }

    pub async fn save_group<F: FnMut(usize, usize)>(
        &self,
        mut group: Group,
        progress: F,
    ) -> Result<MutationOutcome, StoreError> {
        self.prepare(&mut group)?;
        let outcome = self.push_entity(&group, progress).await;
        upsert_by_id(&mut self.lock_data().groups, group, |g| g.id.clone());
        Ok(outcome)
    }

    pub async fn save_controller_meta<F: FnMut(usize, usize)>(
        &self,
        mut meta: ControllerMeta,
        progress: F,
    ) -> Result<MutationOutcome, StoreError> {
        self.prepare(&mut meta)?;
        let outcome = self.push_entity(&meta, progress).await;
        upsert_by_id(&mut self.lock_data().controller_meta, meta, |m| m.id.clone());
        Ok(outcome)
    }

    pub async fn delete_preset<F: FnMut(usize, usize)>(
        &self,
        id: &str,
        progress: F,
    ) -> MutationOutcome {
        let outcome = self.remove_entity::<Preset, _>(id, progress).await;
        self.lock_data().presets.retain(|p| p.id != id);
        outcome
    }

    pub async fn delete_scene<F: FnMut(usize, usize)>(
        &self,
        id: &str,
        progress: F,
    ) -> MutationOutcome {
        let outcome = self.remove_entity::<Scene, _>(id, progress).await;
        self.lock_data().scenes.retain(|s| s.id != id);
        outcome
    }

    pub async fn delete_group<F: FnMut(usize, usize)>(
        &self,
        id: &str,
        progress: F,
    ) -> MutationOutcome {
        let outcome = self.remove_entity::<Group, _>(id, progress).await;
        self.lock_data().groups.retain(|g| g.id != id);
        outcome
    }

    pub async fn delete_controller_meta<F: FnMut(usize, usize)>(
        &self,
        id: &str,
        progress: F,
    ) -> MutationOutcome {
        let outcome = self.remove_entity::<ControllerMeta, _>(id, progress).await;
        self.lock_data().controller_meta.retain(|m| m.id != id);
        outcome
    }

    /// Local validation plus id/ts stamping, before any network call.
    fn prepare<T: Syncable>(&self, item: &mut T) -> Result<(), StoreError> {
        if item.name().trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "{} name is required",
                T::collection()
            )));
        }
        if item.id().is_empty() {
            item.set_id(self.ids.next_id());
        }
        item.set_ts(self.clock.now_ms());
        Ok(())
    }

    /// Read-before-write fan-out over every controller in the
    /// directory. Unreachable hosts are skipped per-iteration, not
    /// excluded up front — the directory may be stale in either
    /// direction.
    async fn push_entity<T: Syncable, F: FnMut(usize, usize)>(
        &self,
        item: &T,
        mut progress: F,
    ) -> MutationOutcome {
        self.abort_flag.store(false, Ordering::SeqCst);
        let controllers = self.directory.snapshot().await;
        let total = controllers.len();
        let mut outcome = MutationOutcome {
            ok: true,
            attempted: total,
            ..MutationOutcome::default()
        };

        for (index, controller) in controllers.iter().enumerate() {
            if self.abort_flag.load(Ordering::SeqCst) {
                tracing::warn!(collection = %T::collection(), id = item.id(), "save aborted");
                outcome.aborted = true;
                outcome.ok = false;
                break;
            }
            if controller.ip_address.is_empty() {
                progress(index + 1, total);
                continue;
            }

            if let Err(error) = self.push_to_host(item, controller).await {
                outcome.errors.push(HostError {
                    host: controller.label().to_string(),
                    error,
                });
            }
            progress(index + 1, total);
        }

        outcome
    }

    async fn push_to_host<T: Syncable>(
        &self,
        item: &T,
        controller: &crate::models::Controller,
    ) -> Result<(), String> {
        let ip = &controller.ip_address;
        let doc = self
            .client
            .get_document(ip)
            .await
            .map_err(|e| e.to_string())?;

        let existing_ts = T::find_ts(&doc, item.id());
        if existing_ts.is_some_and(|ts| ts >= item.ts()) {
            tracing::debug!(
                collection = %T::collection(),
                id = item.id(),
                host = %controller.label(),
                "remote copy is newer, skipping"
            );
            return Ok(());
        }

        let patch = match existing_ts {
            Some(_) => Patch::replace(T::collection(), item.id(), item),
            None => Patch::append(T::collection(), item),
        }
        .map_err(|e| e.to_string())?;

        self.client
            .patch_document(ip, &patch)
            .await
            .map_err(|e| e.to_string())
    }

    /// Remove-by-id fan-out. A host rejecting the selector has nothing
    /// to delete and counts as success.
    async fn remove_entity<T: Syncable, F: FnMut(usize, usize)>(
        &self,
        id: &str,
        mut progress: F,
    ) -> MutationOutcome {
        self.abort_flag.store(false, Ordering::SeqCst);
        let controllers = self.directory.snapshot().await;
        let total = controllers.len();
        let mut outcome = MutationOutcome {
            ok: true,
            attempted: total,
            ..MutationOutcome::default()
        };

        for (index, controller) in controllers.iter().enumerate() {
            if self.abort_flag.load(Ordering::SeqCst) {
                tracing::warn!(collection = %T::collection(), id, "delete aborted");
                outcome.aborted = true;
                outcome.ok = false;
                break;
            }
            if controller.ip_address.is_empty() {
                progress(index + 1, total);
                continue;
            }

            let patch = Patch::remove(T::collection(), id);
            match self.client.patch_document(&controller.ip_address, &patch).await {
                Ok(()) => {}
                Err(e) if e.is_bad_selector() => {
                    tracing::debug!(
                        collection = %T::collection(),
                        id,
                        host = %controller.label(),
                        "not present, already deleted"
                    );
                }
                Err(e) => {
                    outcome.errors.push(HostError {
                        host: controller.label().to_string(),
                        error: e.to_string(),
                    });
                }
            }
            progress(index + 1, total);
        }

        outcome
    }

    fn lock_data(&self) -> std::sync::MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sorted_by_id<T>(map: HashMap<String, T>) -> Vec<T> {
    let mut entries: Vec<(String, T)> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().map(|(_, v)| v).collect()
}

fn upsert_by_id<T>(list: &mut Vec<T>, item: T, id_of: impl Fn(&T) -> String) {
    let id = id_of(&item);
    match list.iter_mut().find(|existing| id_of(existing) == id) {
        Some(existing) => *existing = item,
        None => list.push(item),
    }
}
