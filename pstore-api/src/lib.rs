//! PolyStore repositories
//!
//! One [`Repository`] contract over three backends: SQLite through
//! [`RelationalRepository`], any [`DocumentStore`] through
//! [`DocumentRepository`], and any [`KvStore`] through [`KvRepository`].
//! Queries are built once with [`pstore_core::Query`] and compiled per
//! backend.

mod entity;

pub mod document;
pub mod kv;
pub mod relational;
pub mod repository;

pub use document::{DocumentRepository, DocumentStore, MemoryDocumentStore, SessionId};
pub use kv::{KeyTtl, KvRepository, KvStore, MemoryKvStore};
pub use relational::{share_connection, RelationalRepository, SharedConnection};
pub use repository::{
    BatchOutcome, DocumentCapable, KeyValueCapable, RelationalCapable, Repository, TxFn,
};

pub use pstore_core::{Context, Error, ErrorKind, Item, Query, RepositoryConfig, Result, Value};
