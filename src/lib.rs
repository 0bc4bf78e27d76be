pub mod client;
pub mod error;
pub mod merge;
pub mod model;
pub mod query;
pub mod repository;
pub mod schema;
pub mod server;
pub mod store;
pub mod sync;

pub use client::Client;
pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use model::{ConfigValue, Event, Operation, QueryRow, SyncStatus};
pub use query::{Filter, FilterOp, FilterValue, Query, SortKey};
pub use repository::Repository;
pub use schema::{FieldType, Schema, SchemaField};
pub use store::LocalStore;
pub use sync::{ConnectionState, PushOutcome, SyncStrategy};
