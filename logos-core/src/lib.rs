//! # logos-core: Document model for Logos
//!
//! The shared document is a flat, ordered set of drawable [`Model`]s.
//! This crate owns the model type, the per-type save/restore providers
//! used to move models across the network, and the [`DocumentStore`]
//! contract the sync engine (`logos-collab`) reads and writes through.
//!
//! ```text
//! UI edit ──► DocumentStore ──► change feed (origin = local) ──► sync engine
//!                  ▲                                                │
//!                  └──────────── create/update/delete ◄─────────────┘
//!                                (origin = remote, not re-broadcast)
//! ```

pub mod model;
pub mod registry;
pub mod store;

pub use model::{Model, Props};
pub use registry::{ModelProvider, ModelRegistry, ProviderError, ShapeProvider};
pub use store::{ChangeEvent, ChangeKind, DocumentStore, MemoryStore, Origin, StoreError};
