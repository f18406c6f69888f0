//! Storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where the service's
//! documents physically live.  Implementations are an in-memory store for
//! local use and tests, and Azure Blob Storage.  [`select`] chooses one at
//! startup.

pub mod azure;
pub mod backend;
pub mod memory;
pub mod select;

pub use backend::{StorageBackend, StorageHandle};
pub use select::{select_storage, SelectedStorage, StorageSelection, VaultBinding};
