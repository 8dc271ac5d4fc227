//! Operation codecs: local change events ⇄ wire payloads.
//!
//! One codec per mutation kind. `to_wire` runs on the emitting replica,
//! `apply_remote` on every receiving replica. Remote application always
//! tags the mutation [`Origin::Remote`] so the store's change feed does not
//! hand it back to the orchestrator for re-broadcast.
//!
//! Payloads are validated in full before the store is touched.

use logos_core::{
    ChangeEvent, ChangeKind, DocumentStore, Model, ModelProvider, ModelRegistry, Origin, Props,
    ProviderError, StoreError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::OperationKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Unregistered model type: {0}")]
    UnregisteredType(String),
    #[error("Malformed {kind:?} payload: {reason}")]
    MalformedPayload { kind: OperationKind, reason: String },
    #[error("Change event for model {0} carries no model")]
    MissingModel(Uuid),
    #[error("No codec registered for {0:?} operations")]
    NoCodec(OperationKind),
    #[error("Codec for {expected:?} cannot encode a {found:?} event")]
    KindMismatch {
        expected: OperationKind,
        found: OperationKind,
    },
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What remote application did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    /// Already in the target state (duplicate create/delete) or the target
    /// model is unknown locally (update)
    Skipped,
}

impl From<ChangeKind> for OperationKind {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => OperationKind::Create,
            ChangeKind::Updated => OperationKind::Update,
            ChangeKind::Deleted => OperationKind::Delete,
        }
    }
}

pub trait OperationCodec: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Encode a local change event.
    fn to_wire(&self, event: &ChangeEvent, registry: &ModelRegistry) -> Result<Value, CodecError>;

    /// Apply a received payload to the document, tagged remote.
    fn apply_remote(
        &self,
        payload: &Value,
        store: &dyn DocumentStore,
        registry: &ModelRegistry,
    ) -> Result<Applied, CodecError>;
}

fn provider<'a>(
    registry: &'a ModelRegistry,
    model_type: &str,
) -> Result<&'a dyn ModelProvider, CodecError> {
    registry
        .get(model_type)
        .ok_or_else(|| CodecError::UnregisteredType(model_type.to_string()))
}

fn event_model(event: &ChangeEvent) -> Result<&Model, CodecError> {
    event
        .model
        .as_ref()
        .ok_or(CodecError::MissingModel(event.model_id))
}

fn check_kind(expected: OperationKind, event: &ChangeEvent) -> Result<(), CodecError> {
    let found = OperationKind::from(event.kind);
    if found != expected {
        return Err(CodecError::KindMismatch { expected, found });
    }
    Ok(())
}

fn encode<T: Serialize>(kind: OperationKind, payload: &T) -> Result<Value, CodecError> {
    serde_json::to_value(payload).map_err(|e| CodecError::MalformedPayload {
        kind,
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(kind: OperationKind, payload: &Value) -> Result<T, CodecError> {
    serde_json::from_value(payload.clone()).map_err(|e| CodecError::MalformedPayload {
        kind,
        reason: e.to_string(),
    })
}

/// A model in its provider's wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedModel {
    model_type: String,
    data: Value,
}

impl SavedModel {
    fn save(model: &Model, registry: &ModelRegistry) -> Result<Self, CodecError> {
        let data = provider(registry, &model.model_type)?.save(model)?;
        Ok(Self {
            model_type: model.model_type.clone(),
            data,
        })
    }

    fn restore(&self, registry: &ModelRegistry) -> Result<Model, CodecError> {
        Ok(provider(registry, &self.model_type)?.restore(&self.data)?)
    }
}

// ─── Create ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateCodec;

impl OperationCodec for CreateCodec {
    fn kind(&self) -> OperationKind {
        OperationKind::Create
    }

    fn to_wire(&self, event: &ChangeEvent, registry: &ModelRegistry) -> Result<Value, CodecError> {
        check_kind(self.kind(), event)?;
        let saved = SavedModel::save(event_model(event)?, registry)?;
        encode(self.kind(), &saved)
    }

    fn apply_remote(
        &self,
        payload: &Value,
        store: &dyn DocumentStore,
        registry: &ModelRegistry,
    ) -> Result<Applied, CodecError> {
        let saved: SavedModel = decode(self.kind(), payload)?;
        let model = saved.restore(registry)?;
        let id = model.id;
        if store.create_model(model, Origin::Remote)? {
            Ok(Applied::Applied)
        } else {
            log::debug!("Remote create for existing model {id} skipped");
            Ok(Applied::Skipped)
        }
    }
}

// ─── Update ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload {
    model_id: Uuid,
    model_type: String,
    updates: Props,
    /// Same keys as `updates`, values before the change
    previous: Props,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateCodec;

impl OperationCodec for UpdateCodec {
    fn kind(&self) -> OperationKind {
        OperationKind::Update
    }

    fn to_wire(&self, event: &ChangeEvent, registry: &ModelRegistry) -> Result<Value, CodecError> {
        check_kind(self.kind(), event)?;
        let model = event_model(event)?;
        provider(registry, &model.model_type)?;

        let updates = event.updates.clone().unwrap_or_default();
        let previous: Props = event
            .previous_state
            .iter()
            .flatten()
            .filter(|(key, _)| updates.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        encode(
            self.kind(),
            &UpdatePayload {
                model_id: model.id,
                model_type: model.model_type.clone(),
                updates,
                previous,
            },
        )
    }

    fn apply_remote(
        &self,
        payload: &Value,
        store: &dyn DocumentStore,
        registry: &ModelRegistry,
    ) -> Result<Applied, CodecError> {
        let update: UpdatePayload = decode(self.kind(), payload)?;
        provider(registry, &update.model_type)?;

        if store.update_model(update.model_id, update.updates, Origin::Remote)? {
            Ok(Applied::Applied)
        } else {
            log::debug!("Remote update for unknown model {} skipped", update.model_id);
            Ok(Applied::Skipped)
        }
    }
}

// ─── Delete ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletePayload {
    models: Vec<SavedModel>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteCodec;

impl OperationCodec for DeleteCodec {
    fn kind(&self) -> OperationKind {
        OperationKind::Delete
    }

    fn to_wire(&self, event: &ChangeEvent, registry: &ModelRegistry) -> Result<Value, CodecError> {
        check_kind(self.kind(), event)?;
        let saved = SavedModel::save(event_model(event)?, registry)?;
        encode(self.kind(), &DeletePayload { models: vec![saved] })
    }

    fn apply_remote(
        &self,
        payload: &Value,
        store: &dyn DocumentStore,
        registry: &ModelRegistry,
    ) -> Result<Applied, CodecError> {
        let delete: DeletePayload = decode(self.kind(), payload)?;
        let ids = delete
            .models
            .iter()
            .map(|saved| saved.restore(registry).map(|model| model.id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut applied = Applied::Skipped;
        for id in ids {
            if store.delete_model(id, Origin::Remote)?.is_some() {
                applied = Applied::Applied;
            } else {
                log::debug!("Remote delete for absent model {id} skipped");
            }
        }
        Ok(applied)
    }
}

/// The codec for each operation kind.
pub struct CodecSet {
    codecs: Vec<Box<dyn OperationCodec>>,
}

impl CodecSet {
    /// Create, update and delete codecs.
    pub fn standard() -> Self {
        Self {
            codecs: vec![
                Box::new(CreateCodec),
                Box::new(UpdateCodec),
                Box::new(DeleteCodec),
            ],
        }
    }

    /// Replace the codec for `codec.kind()`.
    pub fn register(&mut self, codec: impl OperationCodec + 'static) {
        self.codecs.retain(|c| c.kind() != codec.kind());
        self.codecs.push(Box::new(codec));
    }

    pub fn get(&self, kind: OperationKind) -> Option<&dyn OperationCodec> {
        self.codecs
            .iter()
            .find(|c| c.kind() == kind)
            .map(|c| c.as_ref())
    }

    /// Like [`CodecSet::get`], failing with [`CodecError::NoCodec`].
    pub fn require(&self, kind: OperationKind) -> Result<&dyn OperationCodec, CodecError> {
        self.get(kind).ok_or(CodecError::NoCodec(kind))
    }
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::standard()
    }
}
