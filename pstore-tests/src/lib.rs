/// Test utilities and helpers for PolyStore testing
///
/// Fixtures build the same `Person` repository on every backend so one test
/// body can run against all three.

use anyhow::Context as _;
use pstore_api::{
    share_connection, DocumentRepository, KvRepository, MemoryDocumentStore, MemoryKvStore,
    RelationalRepository, Repository,
};
use pstore_core::{Context, EntitySchema, FieldDef, FieldKind, IdStrategy, Query, RepositoryConfig};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per process. `RUST_LOG` selects
/// the level; the default is `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub age: i64,
    pub status: String,
}

impl Person {
    pub fn new(id: impl Into<String>, name: impl Into<String>, age: i64, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            age,
            status: status.into(),
        }
    }
}

/// `people`, keyed by a caller-provided text id
pub fn person_schema() -> EntitySchema {
    EntitySchema::new("people", "id")
        .id_strategy(IdStrategy::Provided)
        .field(FieldDef::new("id", FieldKind::Text))
        .field(FieldDef::new("name", FieldKind::Text).required())
        .field(FieldDef::new("age", FieldKind::Int).required())
        .field(FieldDef::new("status", FieldKind::Text).column("person_status").required())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Relational,
    Document,
    KeyValue,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Relational, Backend::Document, Backend::KeyValue];
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Relational => "relational",
            Backend::Document => "document",
            Backend::KeyValue => "key-value",
        })
    }
}

pub type PersonRepository = Box<dyn Repository<Person>>;

/// An empty `people` repository on `backend`
pub fn person_repository(backend: Backend) -> anyhow::Result<PersonRepository> {
    person_repository_with(backend, RepositoryConfig::default())
}

pub fn person_repository_with(backend: Backend, config: RepositoryConfig) -> anyhow::Result<PersonRepository> {
    let repo: PersonRepository = match backend {
        Backend::Relational => Box::new(RelationalRepository::open_in_memory(person_schema(), config)?),
        Backend::Document => Box::new(DocumentRepository::new(
            Arc::new(MemoryDocumentStore::new()),
            person_schema(),
            config,
        )?),
        Backend::KeyValue => Box::new(KvRepository::new(
            Arc::new(MemoryKvStore::new()),
            person_schema(),
            config.with_key_prefix("test:"),
        )?),
    };
    Ok(repo)
}

/// A `people` repository on `backend` holding `people`
pub fn seeded(backend: Backend, people: &[Person]) -> anyhow::Result<PersonRepository> {
    let repo = person_repository(backend)?;
    let ctx = Context::background();
    for person in people {
        let mut person = person.clone();
        repo.create(&ctx, &mut person)
            .with_context(|| format!("seeding {} on {}", person.id, backend))?;
    }
    Ok(repo)
}

/// Ids returned by `find_all`, sorted
pub fn matching_ids(repo: &dyn Repository<Person>, query: &Query) -> anyhow::Result<Vec<String>> {
    let mut ids: Vec<String> = repo
        .find_all(&Context::background(), query)?
        .into_iter()
        .map(|p| p.id)
        .collect();
    ids.sort();
    Ok(ids)
}

/// Ten people `p01..p10` with ages 21..30 and rotating statuses
pub fn ten_people() -> Vec<Person> {
    const STATUSES: [&str; 3] = ["active", "pending", "closed"];
    (1..=10)
        .map(|i| {
            Person::new(
                format!("p{:02}", i),
                format!("person{}", i),
                20 + i as i64,
                STATUSES[(i - 1) % STATUSES.len()],
            )
        })
        .collect()
}

/// SQLite database file in a temporary directory
pub struct TestSqliteFile {
    pub path: PathBuf,
    _temp_dir: TempDir,
}

impl TestSqliteFile {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("pstore.db");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Open a `people` repository over the file, creating the table if needed
    pub fn open(&self) -> anyhow::Result<RelationalRepository<Person>> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(&person_schema().create_table_sql())?;
        Ok(RelationalRepository::new(
            share_connection(conn),
            person_schema(),
            RepositoryConfig::default(),
        )?)
    }
}

impl Default for TestSqliteFile {
    fn default() -> Self {
        Self::new()
    }
}
