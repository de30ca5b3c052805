//! Distributed synchronization across the controller fleet.
//!
//! ## Protocol
//!
//! Every controller serves the full shared document at `/data`. A sync
//! cycle reads it from each reachable host in turn, resolves conflicts
//! per entity id by logical timestamp, prunes junk, and exposes the
//! winners for the local store. Mutations fan out host by host with a
//! read-before-write check. An advisory lock stored in the same
//! document can guard a cycle against other coordinating clients; it
//! is cooperative, quorum-free, and overridable once stale.

mod directory;
mod lock;
mod orchestrator;
mod store;

pub use directory::{run_push_listener, Directory, DirectoryStatus};
pub use lock::{LockCoordinator, LockError, LockSettings};
pub use orchestrator::{SyncOrchestrator, SyncSettings, SyncStatus};
pub use store::{HostError, MergedData, MutationOutcome, StoreData, StoreError, SyncableStore};
