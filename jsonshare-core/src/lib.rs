//! jsonshare core library: document types, paths, persistence, mirror.
//!
//! Public API surface:
//! - [`types`]: [`DocumentId`] and the [`Document`] alias
//! - [`paths`]: deterministic `<dir>/<id>.json` layout and defaults
//! - [`document`]: tolerant load / strict read / atomic save
//! - [`mirror`]: the observable in-memory [`Mirror`]
//! - [`error`]: [`CoreError`]

pub mod document;
pub mod error;
pub mod mirror;
pub mod paths;
pub mod types;

pub use error::CoreError;
pub use mirror::{Mirror, MirrorChange};
pub use types::{Document, DocumentId};
