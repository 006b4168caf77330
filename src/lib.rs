pub mod engine;
pub mod error;
pub mod mutation;
pub mod schema;
pub mod store;
pub mod types;
pub mod value;

pub use engine::{CollectionSpec, MemoryEngine, SqliteEngine, StorageEngine, Transaction, TxMode};
pub use error::{LatticeError, Result};
pub use mutation::{RelationOp, Write, WriteMap};
pub use schema::{
    Arity, Attr, Edge, EdgeEnd, Field, KeyGen, KeyKind, Model, OnDelete, PrimaryKey, Relation,
    Schema, Validate,
};
pub use store::{Client, Filter, Query, Store};
pub use types::{is_subtype, Predicate, Type};
pub use value::{Key, Record, Value};
