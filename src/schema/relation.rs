use serde::{Deserialize, Serialize};

/// How many target records one side of an edge points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arity {
    One,
    Many,
}

/// Action taken on a relation's targets when the owning record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDelete {
    /// Delete the targets too, recursively.
    Cascade,
    /// Refuse the delete while targets are linked.
    Restrict,
    /// Clear the reciprocal reference on the targets.
    SetNull,
    /// Leave the targets' references dangling.
    None,
}

/// One side of a logical edge between two models.
///
/// Two declarations sharing an edge name (across two models, or twice on the
/// same model for self-relations) pair into one edge at compile time.
#[derive(Debug, Clone)]
pub struct Relation {
    pub(crate) target: String,
    pub(crate) edge: String,
    pub(crate) arity: Arity,
    pub(crate) optional: bool,
    pub(crate) on_delete: OnDelete,
}

impl Relation {
    /// A single-key side: the record stores one target key or null.
    pub fn one(target: &str, edge: &str) -> Relation {
        Relation {
            target: target.to_string(),
            edge: edge.to_string(),
            arity: Arity::One,
            optional: false,
            on_delete: OnDelete::None,
        }
    }

    /// A key-list side: the record stores a list of target keys.
    pub fn many(target: &str, edge: &str) -> Relation {
        Relation {
            target: target.to_string(),
            edge: edge.to_string(),
            arity: Arity::Many,
            optional: false,
            on_delete: OnDelete::None,
        }
    }

    pub fn optional(mut self) -> Relation {
        self.optional = true;
        self
    }

    pub fn on_delete(mut self, policy: OnDelete) -> Relation {
        self.on_delete = policy;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn edge(&self) -> &str {
        &self.edge
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn delete_policy(&self) -> OnDelete {
        self.on_delete
    }
}
