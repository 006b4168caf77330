//! The compiled client: per-model store facades over a storage engine.
//!
//! Reads are full scans with conjunction filters (collection sizes here are
//! small); writes validate through the field layer and hand relation
//! operators to the mutation engine, one transaction per call.

use crate::engine::{StorageEngine, Transaction, TxMode};
use crate::error::{LatticeError, Result};
use crate::mutation::{self, Write, WriteMap};
use crate::schema::{Model, Schema};
use crate::types::{is_subtype, Type};
use crate::value::{Key, Record, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One filter over one field. A query is a conjunction of these.
#[derive(Clone)]
pub enum Filter {
    Eq(Value),
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

/// A predicate over one collection: every filter must hold.
#[derive(Clone, Default)]
pub struct Query {
    filters: Vec<(String, Filter)>,
}

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Query {
        self.filters.push((field.to_string(), Filter::Eq(value.into())));
        self
    }

    pub fn matches(
        mut self,
        field: &str,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Query {
        self.filters
            .push((field.to_string(), Filter::Predicate(Arc::new(predicate))));
        self
    }
}

/// A compiled schema materialized against a storage engine.
pub struct Client<E: StorageEngine> {
    schema: Schema,
    engine: E,
}

impl<E: StorageEngine> Client<E> {
    /// Create or upgrade the engine's collections for this schema version
    /// and hand back the client.
    pub fn open(schema: Schema, engine: E, version: u32) -> Result<Client<E>> {
        engine.create_collections(version, &schema.collection_specs())?;
        Ok(Client { schema, engine })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store_names(&self) -> Vec<String> {
        self.schema.models().map(|m| m.name().to_string()).collect()
    }

    /// The per-model facade.
    pub fn store(&self, name: &str) -> Result<Store<'_, E>> {
        let model = self.schema.model(name).ok_or_else(|| {
            LatticeError::Other(format!("Model '{name}' not found in schema"))
        })?;
        Ok(Store {
            client: self,
            model,
        })
    }
}

/// CRUD over one model's collection.
pub struct Store<'a, E: StorageEngine> {
    client: &'a Client<E>,
    model: &'a Model,
}

impl<E: StorageEngine> Store<'_, E> {
    fn schema(&self) -> &Schema {
        &self.client.schema
    }

    /// Validate, assign the key, resolve relation operators, write.
    /// Returns the stored record.
    pub fn add(&self, data: WriteMap) -> Result<Record> {
        let mut tx = self.client.engine.begin(TxMode::ReadWrite)?;
        let key = mutation::insert_record(self.schema(), &mut tx, self.model, data)?;
        let record = fetch(&tx, self.model.name(), &key)?;
        tx.commit()?;
        Ok(record)
    }

    /// Insert a batch in one transaction; any failure drops the whole batch.
    pub fn add_many(&self, batches: Vec<WriteMap>) -> Result<Vec<Record>> {
        let mut tx = self.client.engine.begin(TxMode::ReadWrite)?;
        let mut keys = Vec::with_capacity(batches.len());
        for data in batches {
            keys.push(mutation::insert_record(self.schema(), &mut tx, self.model, data)?);
        }
        let mut records = Vec::with_capacity(keys.len());
        for key in &keys {
            records.push(fetch(&tx, self.model.name(), key)?);
        }
        tx.commit()?;
        Ok(records)
    }

    /// Primary-key point lookup.
    pub fn get(&self, key: &Key) -> Result<Option<Record>> {
        let tx = self.client.engine.begin(TxMode::ReadOnly)?;
        tx.get(self.model.name(), key)
    }

    /// All records matching the query, in key order.
    pub fn find(&self, query: &Query) -> Result<Vec<Record>> {
        // An equality value that cannot inhabit the declared field type can
        // never match; skip the scan entirely.
        for (field, filter) in &query.filters {
            if let (Filter::Eq(value), Some(declared)) =
                (filter, self.declared_type(field))
            {
                if !is_subtype(&declared, &Type::of(value)) {
                    log::debug!(
                        "filter on {}.{} can never match: {} is not a {}",
                        self.model.name(),
                        field,
                        value,
                        declared
                    );
                    return Ok(Vec::new());
                }
            }
        }

        let tx = self.client.engine.begin(TxMode::ReadOnly)?;
        let records = tx.scan(self.model.name())?;
        Ok(records
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| matches(query, record))
            .collect())
    }

    /// First matching record in key order, or `None`.
    pub fn find_first(&self, query: &Query) -> Result<Option<Record>> {
        let mut found = self.find(query)?;
        if found.is_empty() {
            Ok(None)
        } else {
            Ok(Some(found.swap_remove(0)))
        }
    }

    /// Locate the first match, apply scalar updates and relation operators
    /// in input order, and return the post-update record. `None` if nothing
    /// matched.
    pub fn update_first(&self, query: &Query, data: WriteMap) -> Result<Option<Record>> {
        let mut tx = self.client.engine.begin(TxMode::ReadWrite)?;

        let matched = tx
            .scan(self.model.name())?
            .into_iter()
            .find(|(_, record)| matches(query, record));
        let Some((key, mut record)) = matched else {
            return Ok(None);
        };

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut dirty = false;
        for (name, write) in data {
            if !seen.insert(name.clone()) {
                return Err(LatticeError::Validation(format!(
                    "Field '{name}' written twice"
                )));
            }
            if name == self.model.key_field() {
                return Err(LatticeError::Validation(format!(
                    "Primary key '{name}' is immutable"
                )));
            }
            if let Some(field) = self.model.field(&name) {
                let current = record.get(&name).cloned().unwrap_or(Value::Null);
                let next = match write {
                    Write::Value(v) => v,
                    Write::Apply(update) => update(&current),
                    Write::Relation(_) => {
                        return Err(LatticeError::Validation(format!(
                            "Field '{name}' is not a relation"
                        )))
                    }
                };
                let parsed = field.parse(&name, Some(&next))?;
                record.insert(name, parsed);
                dirty = true;
            } else if self.model.relation(&name).is_some() {
                let Write::Relation(ops) = write else {
                    return Err(LatticeError::Validation(format!(
                        "Relation '{name}' takes relation operators"
                    )));
                };
                // Relation operators read through the transaction, so any
                // pending scalar changes must land first.
                if dirty {
                    tx.put(self.model.name(), &key, record.clone())?;
                    dirty = false;
                }
                mutation::apply_relation_ops(
                    self.schema(),
                    &mut tx,
                    self.model,
                    &key,
                    &name,
                    ops,
                )?;
                record = fetch(&tx, self.model.name(), &key)?;
            } else {
                return Err(LatticeError::Validation(format!(
                    "Unknown field '{name}' on model '{}'",
                    self.model.name()
                )));
            }
        }
        if dirty {
            tx.put(self.model.name(), &key, record.clone())?;
        }

        tx.commit()?;
        Ok(Some(record))
    }

    /// Delete a record, firing cascade policies. `NotFound` if absent.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let mut tx = self.client.engine.begin(TxMode::ReadWrite)?;
        let mut visited = BTreeSet::new();
        mutation::delete_record(self.schema(), &mut tx, self.model, key, &mut visited)?;
        tx.commit()
    }

    /// Declared shape of a plain field, with optionality folded in. `None`
    /// for relation fields, the key field, and adapter-validated fields.
    fn declared_type(&self, field: &str) -> Option<Type> {
        let f = self.model.field(field)?;
        let ty = f.ty()?.clone();
        if f.is_optional() {
            Some(Type::optional(ty))
        } else {
            Some(ty)
        }
    }
}

fn fetch<T: Transaction>(tx: &T, collection: &str, key: &Key) -> Result<Record> {
    tx.get(collection, key)?.ok_or_else(|| LatticeError::NotFound {
        collection: collection.to_string(),
        key: key.to_string(),
    })
}

/// Conjunction match; mismatched stored data is a non-match, never an error.
fn matches(query: &Query, record: &Record) -> bool {
    query.filters.iter().all(|(field, filter)| {
        let value = record.get(field).unwrap_or(&Value::Null);
        match filter {
            Filter::Eq(expected) => value == expected,
            Filter::Predicate(predicate) => predicate(value),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::mutation::RelationOp;
    use crate::schema::{Attr, Field, KeyGen, OnDelete, PrimaryKey, Relation};
    use pretty_assertions::assert_eq;

    fn w(name: &str, value: impl Into<Value>) -> (String, Write) {
        (name.to_string(), Write::value(value))
    }

    fn test_client() -> Client<MemoryEngine> {
        let schema = Schema::compile(vec![
            Model::define(
                "users",
                vec![
                    ("id", Attr::Key(PrimaryKey::auto_increment())),
                    ("name", Attr::Field(Field::string())),
                    ("email", Attr::Field(Field::string().unique())),
                    (
                        "role",
                        Attr::Field(Field::string().default_value("member")),
                    ),
                    ("age", Attr::Field(Field::int().optional())),
                    (
                        "posts",
                        Attr::Relation(
                            Relation::many("posts", "author").on_delete(OnDelete::Cascade),
                        ),
                    ),
                ],
            )
            .unwrap(),
            Model::define(
                "posts",
                vec![
                    (
                        "id",
                        Attr::Key(PrimaryKey::string().generated(KeyGen::Ulid)),
                    ),
                    ("title", Attr::Field(Field::string())),
                    (
                        "tags",
                        Attr::Field(
                            Field::of(crate::types::Type::array(crate::types::Type::String))
                                .default_value(Value::Array(vec![])),
                        ),
                    ),
                    (
                        "author",
                        Attr::Relation(Relation::one("users", "author").optional()),
                    ),
                ],
            )
            .unwrap(),
        ])
        .unwrap();
        Client::open(schema, MemoryEngine::new(), 1).unwrap()
    }

    #[test]
    fn test_store_names() {
        let client = test_client();
        assert_eq!(client.store_names(), vec!["posts", "users"]);
        assert!(client.store("ghosts").is_err());
    }

    #[test]
    fn test_add_roundtrip_with_defaults() {
        let client = test_client();
        let users = client.store("users").unwrap();

        let added = users
            .add(vec![w("name", "Alice"), w("email", "alice@test.com")])
            .unwrap();
        let key = Key::from_value(added.get("id").unwrap()).unwrap();

        let fetched = users.get(&key).unwrap().unwrap();
        assert_eq!(fetched, added);
        assert_eq!(fetched.get("role"), Some(&Value::String("member".into())));
        assert_eq!(fetched.get("age"), Some(&Value::Null));
        // Relation field starts as an empty key list.
        assert_eq!(fetched.get("posts"), Some(&Value::Array(vec![])));
    }

    #[test]
    fn test_add_rejects_unknown_field() {
        let client = test_client();
        let users = client.store("users").unwrap();
        let err = users
            .add(vec![
                w("name", "Alice"),
                w("email", "a@test.com"),
                w("nickname", "Al"),
            ])
            .unwrap_err();
        assert!(err.to_string().contains("nickname"));
    }

    #[test]
    fn test_unique_field_rejected_across_adds() {
        let client = test_client();
        let users = client.store("users").unwrap();
        users
            .add(vec![w("name", "Alice"), w("email", "a@test.com")])
            .unwrap();
        let err = users
            .add(vec![w("name", "Bob"), w("email", "a@test.com")])
            .unwrap_err();
        assert!(matches!(err, LatticeError::DuplicateKey(_)));
    }

    #[test]
    fn test_generated_string_keys() {
        let client = test_client();
        let posts = client.store("posts").unwrap();
        let added = posts.add(vec![w("title", "hello")]).unwrap();
        let key = Key::from_value(added.get("id").unwrap()).unwrap();
        assert!(matches!(key, Key::String(_)));
        assert!(posts.get(&key).unwrap().is_some());
    }

    #[test]
    fn test_find_conjunction() {
        let client = test_client();
        let users = client.store("users").unwrap();
        users
            .add(vec![
                w("name", "Alice"),
                w("email", "a@test.com"),
                w("role", "admin"),
                w("age", 30i64),
            ])
            .unwrap();
        users
            .add(vec![
                w("name", "Bob"),
                w("email", "b@test.com"),
                w("role", "admin"),
            ])
            .unwrap();

        let admins = users.find(&Query::new().eq("role", "admin")).unwrap();
        assert_eq!(admins.len(), 2);

        let grown = users
            .find(
                &Query::new()
                    .eq("role", "admin")
                    .matches("age", |v| matches!(v, Value::Int(n) if *n >= 18)),
            )
            .unwrap();
        assert_eq!(grown.len(), 1);
        assert_eq!(grown[0].get("name"), Some(&Value::String("Alice".into())));
    }

    #[test]
    fn test_find_first_in_key_order() {
        let client = test_client();
        let users = client.store("users").unwrap();
        users
            .add(vec![w("name", "Alice"), w("email", "a@test.com")])
            .unwrap();
        users
            .add(vec![w("name", "Bob"), w("email", "b@test.com")])
            .unwrap();

        let first = users.find_first(&Query::new()).unwrap().unwrap();
        assert_eq!(first.get("name"), Some(&Value::String("Alice".into())));
        assert!(users
            .find_first(&Query::new().eq("name", "Zed"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_incompatible_filter_matches_nothing() {
        let client = test_client();
        let users = client.store("users").unwrap();
        users
            .add(vec![w("name", "Alice"), w("email", "a@test.com")])
            .unwrap();

        // name is a string field; an integer equality can never hold.
        let found = users.find(&Query::new().eq("name", 42i64)).unwrap();
        assert!(found.is_empty());
        // Null against an optional field is a legitimate probe.
        let unaged = users.find(&Query::new().eq("age", Value::Null)).unwrap();
        assert_eq!(unaged.len(), 1);
    }

    #[test]
    fn test_update_first_scalars() {
        let client = test_client();
        let users = client.store("users").unwrap();
        users
            .add(vec![w("name", "Alice"), w("email", "a@test.com")])
            .unwrap();

        let updated = users
            .update_first(
                &Query::new().eq("name", "Alice"),
                vec![w("role", "admin")],
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("role"), Some(&Value::String("admin".into())));

        let fetched = users
            .find_first(&Query::new().eq("name", "Alice"))
            .unwrap()
            .unwrap();
        assert_eq!(fetched, updated);

        let missed = users
            .update_first(&Query::new().eq("name", "Zed"), vec![w("role", "admin")])
            .unwrap();
        assert!(missed.is_none());
    }

    #[test]
    fn test_update_first_updater_closure_persists_returned_array() {
        let client = test_client();
        let posts = client.store("posts").unwrap();
        posts
            .add(vec![
                w("title", "hello"),
                (
                    "tags".to_string(),
                    Write::value(Value::Array(vec![
                        Value::String("a".into()),
                        Value::String("b".into()),
                        Value::String("c".into()),
                    ])),
                ),
            ])
            .unwrap();

        let updated = posts
            .update_first(
                &Query::new().eq("title", "hello"),
                vec![(
                    "tags".to_string(),
                    Write::apply(|current| {
                        let mut items = current.as_array().unwrap_or(&[]).to_vec();
                        if !items.is_empty() {
                            items.remove(0);
                        }
                        Value::Array(items)
                    }),
                )],
            )
            .unwrap()
            .unwrap();

        let expected = Value::Array(vec![Value::String("b".into()), Value::String("c".into())]);
        assert_eq!(updated.get("tags"), Some(&expected));
        let fetched = posts
            .find_first(&Query::new().eq("title", "hello"))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.get("tags"), Some(&expected));
    }

    #[test]
    fn test_update_first_rejects_primary_key_write() {
        let client = test_client();
        let users = client.store("users").unwrap();
        users
            .add(vec![w("name", "Alice"), w("email", "a@test.com")])
            .unwrap();
        let err = users
            .update_first(&Query::new(), vec![w("id", 7i64)])
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn test_update_first_connects_relation() {
        let client = test_client();
        let users = client.store("users").unwrap();
        let posts = client.store("posts").unwrap();

        users
            .add(vec![w("name", "Alice"), w("email", "a@test.com")])
            .unwrap();
        let post = posts.add(vec![w("title", "hello")]).unwrap();
        let post_key = Key::from_value(post.get("id").unwrap()).unwrap();

        let updated = users
            .update_first(
                &Query::new().eq("name", "Alice"),
                vec![(
                    "posts".to_string(),
                    Write::relation([RelationOp::Connect(post_key.clone())]),
                )],
            )
            .unwrap()
            .unwrap();

        assert_eq!(
            updated.get("posts"),
            Some(&Value::Array(vec![Value::from(post_key.clone())]))
        );
        let linked = posts.get(&post_key).unwrap().unwrap();
        assert_eq!(linked.get("author"), Some(updated.get("id").unwrap()));
    }

    #[test]
    fn test_add_many_is_all_or_nothing() {
        let client = test_client();
        let users = client.store("users").unwrap();

        let err = users
            .add_many(vec![
                vec![w("name", "Alice"), w("email", "a@test.com")],
                // Missing required email.
                vec![w("name", "Bob")],
            ])
            .unwrap_err();
        assert!(matches!(err, LatticeError::Validation(_)));
        assert!(users.find(&Query::new()).unwrap().is_empty());

        let added = users
            .add_many(vec![
                vec![w("name", "Alice"), w("email", "a@test.com")],
                vec![w("name", "Bob"), w("email", "b@test.com")],
            ])
            .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(users.find(&Query::new()).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_cascades_through_store() {
        let client = test_client();
        let users = client.store("users").unwrap();
        let posts = client.store("posts").unwrap();

        let user = users
            .add(vec![
                w("name", "Alice"),
                w("email", "a@test.com"),
                (
                    "posts".to_string(),
                    Write::relation([RelationOp::Create(vec![w("title", "one")])]),
                ),
            ])
            .unwrap();
        let user_key = Key::from_value(user.get("id").unwrap()).unwrap();
        assert_eq!(posts.find(&Query::new()).unwrap().len(), 1);

        users.delete(&user_key).unwrap();
        assert!(users.get(&user_key).unwrap().is_none());
        assert!(posts.find(&Query::new()).unwrap().is_empty());

        let err = users.delete(&user_key).unwrap_err();
        assert!(matches!(err, LatticeError::NotFound { .. }));
    }

    #[test]
    fn test_spell_list_set_null_scenario() {
        let schema = Schema::compile(vec![
            Model::define(
                "classes",
                vec![
                    ("id", Attr::Key(PrimaryKey::auto_increment())),
                    ("name", Attr::Field(Field::string())),
                    (
                        "spell_list",
                        Attr::Relation(
                            Relation::one("spell_lists", "class_spells")
                                .optional()
                                .on_delete(OnDelete::SetNull),
                        ),
                    ),
                ],
            )
            .unwrap(),
            Model::define(
                "spell_lists",
                vec![
                    ("id", Attr::Key(PrimaryKey::auto_increment())),
                    ("title", Attr::Field(Field::string())),
                    (
                        "class",
                        Attr::Relation(Relation::one("classes", "class_spells").optional()),
                    ),
                ],
            )
            .unwrap(),
        ])
        .unwrap();
        let client = Client::open(schema, MemoryEngine::new(), 1).unwrap();
        let classes = client.store("classes").unwrap();
        let lists = client.store("spell_lists").unwrap();

        let list = lists.add(vec![w("title", "evocation")]).unwrap();
        let list_key = Key::from_value(list.get("id").unwrap()).unwrap();

        let class = classes
            .add(vec![
                w("name", "wizard"),
                (
                    "spell_list".to_string(),
                    Write::relation([RelationOp::Connect(list_key.clone())]),
                ),
            ])
            .unwrap();
        let class_key = Key::from_value(class.get("id").unwrap()).unwrap();

        classes.delete(&class_key).unwrap();

        // The spell list persists with its class reference cleared.
        let surviving = lists.get(&list_key).unwrap().unwrap();
        assert_eq!(surviving.get("class"), Some(&Value::Null));
    }
}
