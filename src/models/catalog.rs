//! In-memory catalog: model id -> descriptor + acquisition state.
//!
//! Every write happens under one lock, so readers never observe a partly
//! applied patch. Applied changes are published on a broadcast channel for
//! whoever renders the model list.

use super::registry::ModelDescriptor;
use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotDownloaded,
    Downloading,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    pub status: ModelStatus,
    /// Fraction in [0, 1]. Only meaningful while downloading.
    pub progress: f64,
    pub is_active: bool,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            status: ModelStatus::NotDownloaded,
            progress: 0.0,
            is_active: false,
        }
    }
}

/// Partial state update; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStatePatch {
    pub status: Option<ModelStatus>,
    pub progress: Option<f64>,
    pub is_active: Option<bool>,
}

impl ModelStatePatch {
    pub fn status(status: ModelStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }

    /// Merge into `state`. Leaving `Downloaded` always clears the active flag.
    fn apply(&self, state: &mut ModelState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(progress) = self.progress {
            state.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(active) = self.is_active {
            state.is_active = active;
        }
        if state.status != ModelStatus::Downloaded {
            state.is_active = false;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEvent {
    pub model_id: String,
    pub state: ModelState,
}

#[derive(Debug)]
struct Entry {
    descriptor: ModelDescriptor,
    state: ModelState,
}

pub struct ModelCatalog {
    entries: RwLock<Vec<Entry>>,
    events: broadcast::Sender<CatalogEvent>,
}

impl ModelCatalog {
    /// Build a catalog with every model `NotDownloaded`. Duplicate ids keep
    /// the first descriptor.
    pub fn new(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let mut entries: Vec<Entry> = Vec::new();
        for descriptor in descriptors {
            if entries.iter().any(|e| e.descriptor.id == descriptor.id) {
                log::warn!("[MODEL] Duplicate model id ignored: {}", descriptor.id);
                continue;
            }
            entries.push(Entry {
                descriptor,
                state: ModelState::default(),
            });
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(entries),
            events,
        }
    }

    pub fn list(&self) -> Vec<(ModelDescriptor, ModelState)> {
        self.read()
            .iter()
            .map(|e| (e.descriptor.clone(), e.state.clone()))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().iter().map(|e| e.descriptor.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Result<ModelState, CatalogError> {
        self.read()
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| e.state.clone())
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub fn descriptor(&self, id: &str) -> Result<ModelDescriptor, CatalogError> {
        self.read()
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// The model currently marked active, if any.
    pub fn active(&self) -> Option<ModelDescriptor> {
        self.read()
            .iter()
            .find(|e| e.state.is_active)
            .map(|e| e.descriptor.clone())
    }

    pub fn update(&self, id: &str, patch: ModelStatePatch) -> Result<ModelState, CatalogError> {
        self.transition(id, |_| Ok::<_, CatalogError>(patch))
    }

    /// Read-check-write under one lock. `decide` sees the current state and
    /// returns the patch to apply, or an error that leaves the state untouched.
    pub fn transition<E, F>(&self, id: &str, decide: F) -> Result<ModelState, E>
    where
        E: From<CatalogError>,
        F: FnOnce(&ModelState) -> Result<ModelStatePatch, E>,
    {
        let state = {
            let mut entries = self.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.descriptor.id == id)
                .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
            let patch = decide(&entry.state)?;
            patch.apply(&mut entry.state);
            entry.state.clone()
        };
        self.publish(id, &state);
        Ok(state)
    }

    /// Mark `id` active and every other model inactive in one step.
    pub fn set_exclusive_active(&self, id: &str) -> Result<ModelState, CatalogError> {
        let changed = {
            let mut entries = self.write();
            if !entries.iter().any(|e| e.descriptor.id == id) {
                return Err(CatalogError::NotFound(id.to_string()));
            }
            let mut changed = Vec::new();
            for entry in entries.iter_mut() {
                let want = entry.descriptor.id == id;
                let before = entry.state.clone();
                ModelStatePatch::default()
                    .with_active(want)
                    .apply(&mut entry.state);
                if entry.state != before || want {
                    changed.push((entry.descriptor.id.clone(), entry.state.clone()));
                }
            }
            changed
        };

        let mut target = None;
        for (model_id, state) in changed {
            self.publish(&model_id, &state);
            if model_id == id {
                target = Some(state);
            }
        }
        target.ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// Clear the active flag everywhere.
    pub fn clear_active(&self) {
        let changed: Vec<(String, ModelState)> = {
            let mut entries = self.write();
            entries
                .iter_mut()
                .filter(|e| e.state.is_active)
                .map(|e| {
                    e.state.is_active = false;
                    (e.descriptor.id.clone(), e.state.clone())
                })
                .collect()
        };
        for (id, state) in changed {
            self.publish(&id, &state);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    fn publish(&self, id: &str, state: &ModelState) {
        // No subscribers is fine.
        let _ = self.events.send(CatalogEvent {
            model_id: id.to_string(),
            state: state.clone(),
        });
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
