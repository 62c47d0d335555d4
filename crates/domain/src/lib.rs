//! `mcporter-domain` — shared model for the mcporter workspace.
//!
//! This crate holds everything the other crates agree on:
//! - The shared [`Error`](error::Error) type and `Result` alias.
//! - The normalized [`ServerDefinition`](definition::ServerDefinition) model
//!   produced by configuration loading.
//! - The [`RawEntry`](raw::RawEntry) union of editor config shapes and the
//!   normalization rules that turn a raw entry into a definition.
//! - The [`expand`] placeholder resolver for `${VAR}`-style templates in
//!   headers and environment maps.

pub mod definition;
pub mod error;
pub mod expand;
pub mod raw;

// Re-exports for convenience.
pub use definition::{AuthScheme, CommandSpec, DefinitionSource, ServerDefinition, ADHOC_PATH};
pub use error::{Error, Result};
pub use raw::{normalize, RawEntry};
