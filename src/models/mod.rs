//! Data model shared by the sync core.

mod controller;
mod document;
mod entity;

pub use controller::Controller;
pub use document::{Collection, Document, Patch, SyncLock};
pub use entity::{ControllerMeta, Group, Preset, Scene, SceneSetting, Syncable};
