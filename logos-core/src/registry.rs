//! Save/restore providers keyed by model type.
//!
//! Every model type that participates in sync must have a provider. The
//! provider decides the wire shape of its models and validates what comes
//! back from the network before it reaches the document.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::model::Model;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Model type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },
    #[error("Model of type '{model_type}' is missing required property '{property}'")]
    MissingProperty {
        model_type: String,
        property: String,
    },
}

/// Converts a model of one type to and from its transport form.
pub trait ModelProvider: Send + Sync {
    /// The type tag this provider handles.
    fn model_type(&self) -> &str;

    /// Serialize a model for the wire.
    fn save(&self, model: &Model) -> Result<Value, ProviderError>;

    /// Rebuild a model from its wire form.
    fn restore(&self, data: &Value) -> Result<Model, ProviderError>;
}

/// Provider for flat shapes: the whole model is its JSON form, and a fixed
/// set of properties must be present on both save and restore.
#[derive(Debug, Clone)]
pub struct ShapeProvider {
    model_type: String,
    required: Vec<String>,
}

impl ShapeProvider {
    pub fn new(model_type: impl Into<String>, required: &[&str]) -> Self {
        Self {
            model_type: model_type.into(),
            required: required.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn validate(&self, model: &Model) -> Result<(), ProviderError> {
        if model.model_type != self.model_type {
            return Err(ProviderError::TypeMismatch {
                expected: self.model_type.clone(),
                found: model.model_type.clone(),
            });
        }
        if let Some(missing) = self.required.iter().find(|p| !model.props.contains_key(*p)) {
            return Err(ProviderError::MissingProperty {
                model_type: self.model_type.clone(),
                property: missing.clone(),
            });
        }
        Ok(())
    }
}

impl ModelProvider for ShapeProvider {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn save(&self, model: &Model) -> Result<Value, ProviderError> {
        self.validate(model)?;
        serde_json::to_value(model).map_err(|e| ProviderError::Serialization(e.to_string()))
    }

    fn restore(&self, data: &Value) -> Result<Model, ProviderError> {
        let model: Model = serde_json::from_value(data.clone())
            .map_err(|e| ProviderError::Serialization(e.to_string()))?;
        self.validate(&model)?;
        Ok(model)
    }
}

/// Registry of providers, injected wherever models cross the wire.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ModelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in drawable types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ShapeProvider::new("rect", &["x", "y", "width", "height"]));
        registry.register(ShapeProvider::new("ellipse", &["x", "y", "width", "height"]));
        registry.register(ShapeProvider::new("frame", &["x", "y", "width", "height"]));
        registry.register(ShapeProvider::new("text", &["x", "y", "content"]));
        registry.register(ShapeProvider::new("path", &["points"]));
        registry
    }

    /// Register a provider, replacing any previous one for the same type.
    pub fn register(&mut self, provider: impl ModelProvider + 'static) {
        let key = provider.model_type().to_string();
        if self.providers.insert(key.clone(), Arc::new(provider)).is_some() {
            log::debug!("Replaced provider for model type '{key}'");
        }
    }

    pub fn get(&self, model_type: &str) -> Option<&dyn ModelProvider> {
        self.providers.get(model_type).map(|p| p.as_ref())
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.providers.contains_key(model_type)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("types", &self.types())
            .finish()
    }
}
