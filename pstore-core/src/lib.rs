pub mod error;
pub mod types;
pub mod schema;
pub mod condition;
pub mod query;
pub mod compile;
pub mod normalize;
pub mod transaction;
pub mod context;
pub mod config;
pub mod retry;

pub use error::{Error, ErrorKind, Result};
pub use types::*;
pub use schema::{EntitySchema, FieldDef, FieldKind, IdStrategy};
pub use condition::{BasicCondition, CompositeCondition, Condition, Logic, Operator, SubQuery, SubQueryKind};
pub use query::{Direction, Join, JoinKind, LockMode, Query, QueryOption, SortKey};
pub use compile::sql::{CompiledStatement, Dialect, SqlCompiler};
pub use compile::document::{CompiledDocumentQuery, CompiledFilter, Degradation, DocumentCommand, DocumentCompiler, FindOptions};
pub use compile::kv::{KvMatcher, KvPlan, Truth};
pub use normalize::{DocumentFailure, KvFailure};
pub use transaction::{TxScope, TxState, TxStateMachine};
pub use context::{CancelToken, Context};
pub use config::{RecordCodec, RepositoryConfig, SubqueryPolicy};
