//! Document store contract and the in-memory implementation.
//!
//! The sync engine only talks to the document through [`DocumentStore`].
//! Every mutation carries an [`Origin`]; the change feed reports it back so
//! subscribers can tell user edits apart from changes that arrived over the
//! network and must not be broadcast again.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{Model, Props};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document lock poisoned")]
    Poisoned,
}

/// Who caused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One entry of the store's change feed.
///
/// `model` is the created model, the model after an update, or the model as
/// it was right before deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub model_id: Uuid,
    pub model: Option<Model>,
    pub updates: Option<Props>,
    pub previous_state: Option<Props>,
    pub origin: Origin,
}

impl ChangeEvent {
    pub fn created(model: Model, origin: Origin) -> Self {
        Self {
            kind: ChangeKind::Created,
            model_id: model.id,
            model: Some(model),
            updates: None,
            previous_state: None,
            origin,
        }
    }

    pub fn updated(model: Model, updates: Props, previous_state: Props, origin: Origin) -> Self {
        Self {
            kind: ChangeKind::Updated,
            model_id: model.id,
            model: Some(model),
            updates: Some(updates),
            previous_state: Some(previous_state),
            origin,
        }
    }

    pub fn deleted(model: Model, origin: Origin) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            model_id: model.id,
            model: Some(model),
            updates: None,
            previous_state: None,
            origin,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

/// Narrow document contract used by the sync engine.
pub trait DocumentStore: Send + Sync {
    /// Insert a model. Returns `false` (and changes nothing) if the id exists.
    fn create_model(&self, model: Model, origin: Origin) -> Result<bool, StoreError>;

    /// Apply field updates. Returns `false` if the id is unknown.
    fn update_model(&self, id: Uuid, updates: Props, origin: Origin) -> Result<bool, StoreError>;

    /// Remove a model, returning it if it existed.
    fn delete_model(&self, id: Uuid, origin: Origin) -> Result<Option<Model>, StoreError>;

    fn get_model_by_id(&self, id: Uuid) -> Option<Model>;

    /// All models in paint order.
    fn get_all_models(&self) -> Vec<Model>;

    /// Replace the whole document with a received snapshot.
    fn replace_all(&self, models: Vec<Model>, origin: Origin) -> Result<(), StoreError>;

    /// Subscribe to the change feed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent>;

    /// Delete everything, one change event per model.
    fn clear(&self, origin: Origin) -> Result<usize, StoreError> {
        let mut removed = 0;
        for model in self.get_all_models() {
            if self.delete_model(model.id, origin)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Default)]
struct Models {
    by_id: HashMap<Uuid, Model>,
    /// Paint order
    order: Vec<Uuid>,
}

impl Models {
    fn insert(&mut self, model: Model) {
        self.order.push(model.id);
        self.by_id.insert(model.id, model);
    }

    fn remove(&mut self, id: Uuid) -> Option<Model> {
        let model = self.by_id.remove(&id)?;
        self.order.retain(|other| *other != id);
        Some(model)
    }

    fn ordered(&self) -> Vec<Model> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }
}

/// In-memory document with a fan-out change feed.
#[derive(Default)]
pub struct MemoryStore {
    models: RwLock<Models>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|m| m.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, event: ChangeEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            // Receivers that went away are pruned on the next emit
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

impl DocumentStore for MemoryStore {
    fn create_model(&self, model: Model, origin: Origin) -> Result<bool, StoreError> {
        let mut models = self.models.write().map_err(|_| StoreError::Poisoned)?;
        if models.by_id.contains_key(&model.id) {
            log::debug!("Model {} already exists, create ignored", model.id);
            return Ok(false);
        }
        models.insert(model.clone());
        // Emitted under the write lock so the feed order is the apply order
        self.emit(ChangeEvent::created(model, origin));
        Ok(true)
    }

    fn update_model(&self, id: Uuid, updates: Props, origin: Origin) -> Result<bool, StoreError> {
        let mut models = self.models.write().map_err(|_| StoreError::Poisoned)?;
        let Some(model) = models.by_id.get_mut(&id) else {
            return Ok(false);
        };
        let previous = model.apply_updates(&updates);
        let model = model.clone();
        self.emit(ChangeEvent::updated(model, updates, previous, origin));
        Ok(true)
    }

    fn delete_model(&self, id: Uuid, origin: Origin) -> Result<Option<Model>, StoreError> {
        let mut models = self.models.write().map_err(|_| StoreError::Poisoned)?;
        let removed = models.remove(id);
        if let Some(ref model) = removed {
            self.emit(ChangeEvent::deleted(model.clone(), origin));
        }
        Ok(removed)
    }

    fn get_model_by_id(&self, id: Uuid) -> Option<Model> {
        self.models.read().ok()?.by_id.get(&id).cloned()
    }

    fn get_all_models(&self) -> Vec<Model> {
        self.models
            .read()
            .map(|m| m.ordered())
            .unwrap_or_default()
    }

    fn replace_all(&self, models: Vec<Model>, origin: Origin) -> Result<(), StoreError> {
        let mut current = self.models.write().map_err(|_| StoreError::Poisoned)?;
        let removed = current.ordered();
        *current = Models::default();
        for model in &models {
            if current.by_id.contains_key(&model.id) {
                log::warn!("Snapshot contains duplicate model {}, keeping first", model.id);
                continue;
            }
            current.insert(model.clone());
        }
        let created = current.ordered();
        log::info!(
            "Document replaced from snapshot: {} models out, {} models in",
            removed.len(),
            created.len()
        );
        for model in removed {
            self.emit(ChangeEvent::deleted(model, origin));
        }
        for model in created {
            self.emit(ChangeEvent::created(model, origin));
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn props(pairs: &[(&str, serde_json::Value)]) -> Props {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_create_and_get() {
        let store = MemoryStore::new();
        let rect = Model::rect(0.0, 0.0, 10.0, 10.0);
        assert!(store.create_model(rect.clone(), Origin::Local).unwrap());
        assert_eq!(store.get_model_by_id(rect.id), Some(rect));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_create_is_noop() {
        let store = MemoryStore::new();
        let rect = Model::rect(0.0, 0.0, 10.0, 10.0);
        let mut feed = store.subscribe();

        assert!(store.create_model(rect.clone(), Origin::Remote).unwrap());
        assert!(!store.create_model(rect, Origin::Remote).unwrap());

        assert!(feed.try_recv().is_ok());
        assert!(feed.try_recv().is_err(), "second create must not emit");
    }

    #[test]
    fn test_update_emits_previous_state() {
        let store = MemoryStore::new();
        let rect = Model::rect(0.0, 0.0, 10.0, 10.0);
        store.create_model(rect.clone(), Origin::Local).unwrap();
        let mut feed = store.subscribe();

        assert!(store
            .update_model(rect.id, props(&[("x", json!(42.0))]), Origin::Local)
            .unwrap());

        let event = feed.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.updates, Some(props(&[("x", json!(42.0))])));
        assert_eq!(event.previous_state, Some(props(&[("x", json!(0.0))])));
        assert_eq!(event.model.unwrap().prop("x"), Some(&json!(42.0)));
    }

    #[test]
    fn test_update_unknown_returns_false() {
        let store = MemoryStore::new();
        assert!(!store
            .update_model(Uuid::new_v4(), Props::new(), Origin::Remote)
            .unwrap());
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe();
        assert_eq!(store.delete_model(Uuid::new_v4(), Origin::Remote).unwrap(), None);
        assert!(feed.try_recv().is_err());
    }

    #[test]
    fn test_paint_order_preserved() {
        let store = MemoryStore::new();
        let a = Model::rect(0.0, 0.0, 1.0, 1.0);
        let b = Model::text(0.0, 0.0, "b");
        let c = Model::ellipse(0.0, 0.0, 1.0, 1.0);
        for m in [&a, &b, &c] {
            store.create_model(m.clone(), Origin::Local).unwrap();
        }
        store.delete_model(b.id, Origin::Local).unwrap();

        let ids: Vec<Uuid> = store.get_all_models().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn test_clear_emits_one_delete_per_model() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .create_model(Model::rect(i as f64, 0.0, 1.0, 1.0), Origin::Local)
                .unwrap();
        }
        let mut feed = store.subscribe();

        assert_eq!(store.clear(Origin::Local).unwrap(), 3);
        for _ in 0..3 {
            assert_eq!(feed.try_recv().unwrap().kind, ChangeKind::Deleted);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_all_tags_origin() {
        let store = MemoryStore::new();
        store
            .create_model(Model::rect(0.0, 0.0, 1.0, 1.0), Origin::Local)
            .unwrap();
        let mut feed = store.subscribe();

        let snapshot = vec![Model::text(0.0, 0.0, "a"), Model::text(1.0, 1.0, "b")];
        store.replace_all(snapshot.clone(), Origin::Remote).unwrap();

        assert_eq!(store.get_all_models(), snapshot);
        let mut kinds = Vec::new();
        while let Ok(event) = feed.try_recv() {
            assert_eq!(event.origin, Origin::Remote);
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![ChangeKind::Deleted, ChangeKind::Created, ChangeKind::Created]
        );
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let store = MemoryStore::new();
        let feed = store.subscribe();
        drop(feed);
        store
            .create_model(Model::rect(0.0, 0.0, 1.0, 1.0), Origin::Local)
            .unwrap();
        assert!(store.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_feed_order_matches_apply_order() {
        let store = Arc::new(MemoryStore::new());
        let model = Model::rect(0.0, 0.0, 1.0, 1.0);
        let id = model.id;
        store.create_model(model, Origin::Local).unwrap();
        let mut feed = store.subscribe();

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let updates = props(&[("x", json!(writer * 1000 + i))]);
                        store.update_model(id, updates, Origin::Local).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut last = None;
        let mut count = 0;
        while let Ok(event) = feed.try_recv() {
            last = event.updates.and_then(|u| u.get("x").cloned());
            count += 1;
        }
        assert_eq!(count, 800);
        assert_eq!(last.as_ref(), store.get_model_by_id(id).unwrap().prop("x"));
    }

    #[test]
    fn test_change_event_json_shape() {
        let model = Model::rect(0.0, 0.0, 1.0, 1.0);
        let event = ChangeEvent::deleted(model.clone(), Origin::Local);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("deleted"));
        assert_eq!(value["modelId"], json!(model.id.to_string()));
        assert_eq!(value["origin"], json!("local"));
    }
}
