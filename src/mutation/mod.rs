//! The relation mutation engine: the write path that keeps denormalized
//! relation pointers consistent on both ends of every edge.
//!
//! The substrate has no foreign keys, so every operator here is responsible
//! for two-sided referential integrity by hand: linking writes the key into
//! both member records, unlinking clears both, and deletes walk cascade
//! policies, all inside the one transaction the caller opened.

use crate::engine::Transaction;
use crate::error::{LatticeError, Result};
use crate::schema::{Arity, EdgeEnd, Model, OnDelete, Schema};
use crate::value::{Key, Record, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One relation operator. A relation field's write is an ordered list of
/// these; later operators observe the key set as mutated by earlier ones,
/// so conflicting operators on one key are last-write-wins.
#[derive(Clone)]
pub enum RelationOp {
    /// Insert a new target record and link it.
    Create(Vec<(String, Write)>),
    CreateMany(Vec<Vec<(String, Write)>>),
    /// Link an existing target; `NotFound` if absent.
    Connect(Key),
    ConnectMany(Vec<Key>),
    /// Unlink a target without deleting it; `NotFound` if absent.
    Disconnect(Key),
    DisconnectMany(Vec<Key>),
    /// Unlink, then delete the target, firing its cascade policies.
    Delete(Key),
}

/// One field's worth of a write: a plain value, an updater closure applied
/// to the current value, or relation operators.
#[derive(Clone)]
pub enum Write {
    Value(Value),
    Apply(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
    Relation(Vec<RelationOp>),
}

impl Write {
    pub fn value(v: impl Into<Value>) -> Write {
        Write::Value(v.into())
    }

    pub fn apply(f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Write {
        Write::Apply(Arc::new(f))
    }

    pub fn relation(ops: impl IntoIterator<Item = RelationOp>) -> Write {
        Write::Relation(ops.into_iter().collect())
    }
}

/// Ordered field writes; order matters because relation operators are
/// applied in the order their fields appear.
pub type WriteMap = Vec<(String, Write)>;

/// Validate `data` against `model`, assign the primary key, initialize
/// relation fields, insert, then apply relation operators in input order.
/// Returns the new record's key.
pub fn insert_record<T: Transaction>(
    schema: &Schema,
    tx: &mut T,
    model: &Model,
    data: WriteMap,
) -> Result<Key> {
    let mut record = Record::new();
    let mut relation_ops: Vec<(String, Vec<RelationOp>)> = Vec::new();
    let mut supplied_key: Option<Key> = None;
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for (name, write) in data {
        if !seen.insert(name.clone()) {
            return Err(LatticeError::Validation(format!(
                "Field '{name}' written twice"
            )));
        }
        if name == model.key_field() {
            let value = match write {
                Write::Value(v) => v,
                _ => {
                    return Err(LatticeError::Validation(format!(
                        "Primary key '{name}' must be a plain value"
                    )))
                }
            };
            let key = Key::from_value(&value).ok_or_else(|| {
                LatticeError::Validation(format!(
                    "Primary key '{name}' has unkeyable kind {}",
                    value.kind_name()
                ))
            })?;
            if !model.primary_key().kind().matches(&key) {
                return Err(LatticeError::Validation(format!(
                    "Primary key '{name}' expected {:?} key, got {}",
                    model.primary_key().kind(),
                    key.kind_name()
                )));
            }
            supplied_key = Some(key);
        } else if model.field(name.as_str()).is_some() {
            let value = match write {
                Write::Value(v) => v,
                Write::Apply(_) => {
                    return Err(LatticeError::Validation(format!(
                        "Field '{name}': updater closures are only valid on updates"
                    )))
                }
                Write::Relation(_) => {
                    return Err(LatticeError::Validation(format!(
                        "Field '{name}' is not a relation"
                    )))
                }
            };
            record.insert(name, value);
        } else if model.relation(name.as_str()).is_some() {
            match write {
                Write::Relation(ops) => relation_ops.push((name, ops)),
                _ => {
                    return Err(LatticeError::Validation(format!(
                        "Relation '{name}' takes relation operators"
                    )))
                }
            }
        } else {
            return Err(LatticeError::Validation(format!(
                "Unknown field '{name}' on model '{}'",
                model.name()
            )));
        }
    }

    // Validate every declared field, applying defaults.
    for (name, field) in model.fields() {
        let parsed = field.parse(name, record.get(name))?;
        record.insert(name.clone(), parsed);
    }

    // Relation fields start unlinked.
    for (name, relation) in model.relations() {
        let initial = match relation.arity() {
            Arity::One => Value::Null,
            Arity::Many => Value::Array(Vec::new()),
        };
        record.insert(name.clone(), initial);
    }

    let key = match supplied_key {
        Some(key) => key,
        None => match model.primary_key().generate() {
            Some(key) => key,
            None if model.primary_key().is_auto_increment() => {
                tx.allocate_key(model.name())?
            }
            None => {
                return Err(LatticeError::Validation(format!(
                    "Primary key '{}' is required",
                    model.key_field()
                )))
            }
        },
    };
    record.insert(model.key_field().to_string(), key.clone().into());

    tx.insert(model.name(), &key, record)?;

    for (field, ops) in relation_ops {
        apply_relation_ops(schema, tx, model, &key, &field, ops)?;
    }

    Ok(key)
}

/// Apply an ordered operator list to one relation field of one record.
pub fn apply_relation_ops<T: Transaction>(
    schema: &Schema,
    tx: &mut T,
    model: &Model,
    owner: &Key,
    field: &str,
    ops: Vec<RelationOp>,
) -> Result<()> {
    let (edge, end) = schema.edge_for(model.name(), field).ok_or_else(|| {
        LatticeError::Validation(format!(
            "'{}' is not a relation field on model '{}'",
            field,
            model.name()
        ))
    })?;
    let this = &edge.ends[end];
    let other = &edge.ends[1 - end];

    for op in ops {
        match op {
            RelationOp::Connect(key) => connect(tx, this, other, owner, &key)?,
            RelationOp::ConnectMany(keys) => {
                for key in keys {
                    connect(tx, this, other, owner, &key)?;
                }
            }
            RelationOp::Disconnect(key) => disconnect(tx, this, other, owner, &key)?,
            RelationOp::DisconnectMany(keys) => {
                for key in keys {
                    disconnect(tx, this, other, owner, &key)?;
                }
            }
            RelationOp::Create(data) => {
                let target = target_model(schema, other)?;
                let key = insert_record(schema, tx, target, data)?;
                connect(tx, this, other, owner, &key)?;
            }
            RelationOp::CreateMany(many) => {
                let target = target_model(schema, other)?;
                for data in many {
                    let key = insert_record(schema, tx, target, data)?;
                    connect(tx, this, other, owner, &key)?;
                }
            }
            RelationOp::Delete(key) => {
                disconnect(tx, this, other, owner, &key)?;
                let target = target_model(schema, other)?;
                let mut visited = BTreeSet::new();
                delete_record(schema, tx, target, &key, &mut visited)?;
            }
        }
    }
    Ok(())
}

/// Delete a record, firing each relation's cascade policy first. `visited`
/// makes a revisit through a relation cycle a no-op instead of a loop.
pub fn delete_record<T: Transaction>(
    schema: &Schema,
    tx: &mut T,
    model: &Model,
    key: &Key,
    visited: &mut BTreeSet<(String, Key)>,
) -> Result<()> {
    if !visited.insert((model.name().to_string(), key.clone())) {
        return Ok(());
    }

    let record = fetch(tx, model.name(), key)?;

    for (field, relation) in model.relations() {
        let (edge, end) = schema.edge_for(model.name(), field).ok_or_else(|| {
            LatticeError::InvalidSchema(format!(
                "Relation '{}.{}' missing from edge registry",
                model.name(),
                field
            ))
        })?;
        let other = &edge.ends[1 - end];
        let linked = linked_keys(record.get(field).unwrap_or(&Value::Null));

        match relation.delete_policy() {
            OnDelete::None => {}
            OnDelete::Restrict => {
                // Targets already inside this delete closure don't block it.
                for target_key in &linked {
                    if visited.contains(&(other.model.clone(), target_key.clone())) {
                        continue;
                    }
                    if tx.get(&other.model, target_key)?.is_some() {
                        return Err(LatticeError::RestrictViolation(format!(
                            "{}/{} is referenced through '{}'",
                            model.name(),
                            key,
                            field
                        )));
                    }
                }
            }
            OnDelete::SetNull => {
                for target_key in &linked {
                    // The target may already be gone mid-cascade.
                    if tx.get(&other.model, target_key)?.is_some() {
                        unlink(tx, other, target_key, key)?;
                    }
                }
            }
            OnDelete::Cascade => {
                let target = target_model(schema, other)?;
                for target_key in &linked {
                    if tx.get(&other.model, target_key)?.is_some() {
                        delete_record(schema, tx, target, target_key, visited)?;
                    }
                }
            }
        }
    }

    tx.delete(model.name(), key)
}

fn target_model<'a>(schema: &'a Schema, end: &EdgeEnd) -> Result<&'a Model> {
    schema.model(&end.model).ok_or_else(|| {
        LatticeError::InvalidSchema(format!("Unknown model '{}' in edge registry", end.model))
    })
}

fn fetch<T: Transaction>(tx: &T, collection: &str, key: &Key) -> Result<Record> {
    tx.get(collection, key)?.ok_or_else(|| LatticeError::NotFound {
        collection: collection.to_string(),
        key: key.to_string(),
    })
}

/// Link `owner` and `target` on both ends of the edge. A displaced key on a
/// one-arity end gets its reciprocal reference cleared, so edges stay
/// two-sided.
fn connect<T: Transaction>(
    tx: &mut T,
    this: &EdgeEnd,
    other: &EdgeEnd,
    owner: &Key,
    target: &Key,
) -> Result<()> {
    // The target must exist before we point at it.
    fetch(tx, &other.model, target)?;

    if let Some(displaced) = link(tx, this, owner, target)? {
        unlink(tx, other, &displaced, owner)?;
    }
    if let Some(displaced) = link(tx, other, target, owner)? {
        unlink(tx, this, &displaced, target)?;
    }
    Ok(())
}

fn disconnect<T: Transaction>(
    tx: &mut T,
    this: &EdgeEnd,
    other: &EdgeEnd,
    owner: &Key,
    target: &Key,
) -> Result<()> {
    fetch(tx, &other.model, target)?;
    unlink(tx, this, owner, target)?;
    unlink(tx, other, target, owner)?;
    Ok(())
}

/// Write `target` into the relation field of `owner`'s record on end
/// `end`. Returns the key displaced from a one-arity slot, if any.
fn link<T: Transaction>(
    tx: &mut T,
    end: &EdgeEnd,
    owner: &Key,
    target: &Key,
) -> Result<Option<Key>> {
    let mut record = fetch(tx, &end.model, owner)?;
    let current = record.get(&end.field).cloned().unwrap_or(Value::Null);
    let mut displaced = None;

    let next = match end.arity {
        Arity::One => {
            if let Some(existing) = Key::from_value(&current) {
                if &existing != target {
                    displaced = Some(existing);
                }
            }
            Value::from(target.clone())
        }
        Arity::Many => {
            let mut keys = key_list(&current);
            if !keys.contains(target) {
                keys.push(target.clone());
            }
            Value::Array(keys.into_iter().map(Value::from).collect())
        }
    };

    record.insert(end.field.clone(), next);
    tx.put(&end.model, owner, record)?;
    Ok(displaced)
}

/// Remove `target` from the relation field of `owner`'s record on end
/// `end`; clearing an absent link is a no-op.
fn unlink<T: Transaction>(tx: &mut T, end: &EdgeEnd, owner: &Key, target: &Key) -> Result<()> {
    let mut record = fetch(tx, &end.model, owner)?;
    let current = record.get(&end.field).cloned().unwrap_or(Value::Null);

    let next = match end.arity {
        Arity::One => match Key::from_value(&current) {
            Some(existing) if &existing == target => Value::Null,
            _ => return Ok(()),
        },
        Arity::Many => {
            let mut keys = key_list(&current);
            let before = keys.len();
            keys.retain(|k| k != target);
            if keys.len() == before {
                return Ok(());
            }
            Value::Array(keys.into_iter().map(Value::from).collect())
        }
    };

    record.insert(end.field.clone(), next);
    tx.put(&end.model, owner, record)
}

/// Keys currently stored in a relation field value.
fn linked_keys(value: &Value) -> Vec<Key> {
    match value {
        Value::Array(_) => key_list(value),
        other => Key::from_value(other).into_iter().collect(),
    }
}

fn key_list(value: &Value) -> Vec<Key> {
    match value {
        Value::Array(items) => items.iter().filter_map(Key::from_value).collect(),
        _ => Vec::new(),
    }
}
