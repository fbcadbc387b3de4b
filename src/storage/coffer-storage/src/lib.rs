//! # Coffer Storage
//!
//! Storage abstraction shared by the Coffer engines.
//!
//! Engines persist their records as JSON documents through [`Collection`],
//! which sits on top of any [`StorageBackend`]. [`MemoryBackend`] is used by
//! unit tests; the SQLite backend lives in `coffer-storage-sqlite`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod document;
pub mod error;
pub mod memory;

pub use backend::StorageBackend;
pub use document::Collection;
pub use error::StorageError;
pub use memory::MemoryBackend;
