//! Drawable model entities.
//!
//! A [`Model`] is the unit the sync engine replicates: an id, a type tag
//! that selects its [`ModelProvider`](crate::registry::ModelProvider), and a
//! flat JSON property bag (geometry, style, text content, stroke points…).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Property bag carried by every model.
pub type Props = Map<String, Value>;

/// A drawable object in the shared document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: Uuid,
    pub model_type: String,
    #[serde(default)]
    pub props: Props,
}

impl Model {
    pub fn new(model_type: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), model_type)
    }

    /// Create with explicit id (for testing and remote restore)
    pub fn with_id(id: Uuid, model_type: impl Into<String>) -> Self {
        Self {
            id,
            model_type: model_type.into(),
            props: Props::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Axis-aligned rectangle.
    pub fn rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new("rect")
            .with_prop("x", x)
            .with_prop("y", y)
            .with_prop("width", width)
            .with_prop("height", height)
    }

    /// Ellipse inscribed in the given bounds.
    pub fn ellipse(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new("ellipse")
            .with_prop("x", x)
            .with_prop("y", y)
            .with_prop("width", width)
            .with_prop("height", height)
    }

    /// Text label anchored at (x, y).
    pub fn text(x: f64, y: f64, content: impl Into<String>) -> Self {
        Self::new("text")
            .with_prop("x", x)
            .with_prop("y", y)
            .with_prop("content", content.into())
    }

    /// Freehand stroke through a list of points.
    pub fn path(points: &[(f64, f64)]) -> Self {
        let points: Vec<Value> = points
            .iter()
            .map(|(x, y)| Value::Array(vec![(*x).into(), (*y).into()]))
            .collect();
        Self::new("path").with_prop("points", Value::Array(points))
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Apply field updates in place.
    ///
    /// Returns the previous value of every updated field; fields that did
    /// not exist before are reported as `null`.
    pub fn apply_updates(&mut self, updates: &Props) -> Props {
        let mut previous = Props::new();
        for (key, value) in updates {
            let old = self.props.insert(key.clone(), value.clone());
            previous.insert(key.clone(), old.unwrap_or(Value::Null));
        }
        previous
    }
}
