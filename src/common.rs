//! Common definitions that are shared between different parts of the toolchain.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers: link names and external symbols.
pub type Id = internment::Intern<String>;
