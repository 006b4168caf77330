pub mod compile;
pub mod field;
pub mod model;
pub mod relation;

pub use compile::{Edge, EdgeEnd, Schema};
pub use field::{Field, KeyGen, KeyKind, PrimaryKey, Validate};
pub use model::{Attr, Model};
pub use relation::{Arity, OnDelete, Relation};
