use crate::engine::CollectionSpec;
use crate::error::{LatticeError, Result};
use crate::schema::model::Model;
use crate::schema::relation::{Arity, OnDelete, Relation};
use std::collections::{BTreeMap, HashMap};

/// One resolved side of an edge.
#[derive(Debug, Clone)]
pub struct EdgeEnd {
    pub model: String,
    pub field: String,
    pub arity: Arity,
    pub optional: bool,
    pub on_delete: OnDelete,
}

/// A logical relation between two models: two same-named declarations paired
/// at compile time. Mutation code reaches ends by index, never by rescanning
/// model field maps.
#[derive(Debug, Clone)]
pub struct Edge {
    pub name: String,
    pub ends: [EdgeEnd; 2],
}

/// A compiled schema: models plus the edge registry. Immutable; materialize
/// a client against a storage engine to use it.
#[derive(Debug)]
pub struct Schema {
    models: BTreeMap<String, Model>,
    edges: Vec<Edge>,
    end_index: HashMap<(String, String), (usize, usize)>,
}

impl Schema {
    /// Pair every relation declaration into edges and validate the result:
    /// model names unique, relation targets known, every edge name carried
    /// by exactly two declarations whose targets cross-reference.
    pub fn compile(models: Vec<Model>) -> Result<Schema> {
        let mut by_name: BTreeMap<String, Model> = BTreeMap::new();
        for model in models {
            if by_name.contains_key(model.name()) {
                return Err(LatticeError::InvalidSchema(format!(
                    "Duplicate model name '{}'",
                    model.name()
                )));
            }
            by_name.insert(model.name().to_string(), model);
        }

        // Group declarations by edge name, in deterministic model/field order.
        let mut groups: BTreeMap<String, Vec<(String, String, Relation)>> = BTreeMap::new();
        for model in by_name.values() {
            for (field, relation) in model.relations() {
                if !by_name.contains_key(relation.target()) {
                    return Err(LatticeError::InvalidSchema(format!(
                        "Relation '{}.{}' targets unknown model '{}'",
                        model.name(),
                        field,
                        relation.target()
                    )));
                }
                groups.entry(relation.edge().to_string()).or_default().push((
                    model.name().to_string(),
                    field.clone(),
                    relation.clone(),
                ));
            }
        }

        let mut edges = Vec::new();
        let mut end_index = HashMap::new();
        for (edge_name, mut declarations) in groups {
            if declarations.len() != 2 {
                return Err(LatticeError::InvalidSchema(format!(
                    "Edge '{edge_name}' has {} declaration(s), expected 2",
                    declarations.len()
                )));
            }
            let (b_model, b_field, b_rel) = declarations.pop().unwrap();
            let (a_model, a_field, a_rel) = declarations.pop().unwrap();

            if a_rel.target() != b_model || b_rel.target() != a_model {
                return Err(LatticeError::InvalidSchema(format!(
                    "Edge '{edge_name}': '{a_model}.{a_field}' targets '{}' but pairs with \
                     '{b_model}.{b_field}' targeting '{}'",
                    a_rel.target(),
                    b_rel.target()
                )));
            }

            let edge_idx = edges.len();
            let ends = [
                EdgeEnd {
                    model: a_model.clone(),
                    field: a_field.clone(),
                    arity: a_rel.arity(),
                    optional: a_rel.optional,
                    on_delete: a_rel.delete_policy(),
                },
                EdgeEnd {
                    model: b_model.clone(),
                    field: b_field.clone(),
                    arity: b_rel.arity(),
                    optional: b_rel.optional,
                    on_delete: b_rel.delete_policy(),
                },
            ];
            end_index.insert((a_model, a_field), (edge_idx, 0));
            end_index.insert((b_model, b_field), (edge_idx, 1));
            edges.push(Edge {
                name: edge_name,
                ends,
            });
        }

        log::debug!(
            "compiled schema: {} model(s), {} edge(s)",
            by_name.len(),
            edges.len()
        );

        Ok(Schema {
            models: by_name,
            edges,
            end_index,
        })
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// The edge a relation field belongs to, with this side's end index.
    pub(crate) fn edge_for(&self, model: &str, field: &str) -> Option<(&Edge, usize)> {
        let (edge_idx, end_idx) = self
            .end_index
            .get(&(model.to_string(), field.to_string()))?;
        Some((&self.edges[*edge_idx], *end_idx))
    }

    /// Collection specs handed to a storage engine when materializing a
    /// client: one collection per model, unique secondary indexes for
    /// unique fields, auto-increment flag from the primary key.
    pub fn collection_specs(&self) -> Vec<CollectionSpec> {
        self.models
            .values()
            .map(|model| CollectionSpec {
                name: model.name().to_string(),
                key_field: model.key_field().to_string(),
                auto_increment: model.primary_key().is_auto_increment(),
                unique_fields: model
                    .fields()
                    .iter()
                    .filter(|(_, f)| f.is_unique())
                    .map(|(name, _)| name.clone())
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::{Field, PrimaryKey};
    use crate::schema::model::Attr;
    use crate::schema::relation::Relation;

    fn users_posts() -> Vec<Model> {
        vec![
            Model::define(
                "users",
                vec![
                    ("id", Attr::Key(PrimaryKey::auto_increment())),
                    ("name", Attr::Field(Field::string())),
                    ("posts", Attr::Relation(Relation::many("posts", "author"))),
                ],
            )
            .unwrap(),
            Model::define(
                "posts",
                vec![
                    ("id", Attr::Key(PrimaryKey::auto_increment())),
                    ("title", Attr::Field(Field::string())),
                    ("author", Attr::Relation(Relation::one("users", "author"))),
                ],
            )
            .unwrap(),
        ]
    }

    #[test]
    fn test_compile_pairs_edges() {
        let schema = Schema::compile(users_posts()).unwrap();
        assert_eq!(schema.edges().len(), 1);

        let (edge, end) = schema.edge_for("users", "posts").unwrap();
        assert_eq!(edge.name, "author");
        assert_eq!(edge.ends[end].arity, Arity::Many);
        assert_eq!(edge.ends[1 - end].model, "posts");

        let (same_edge, other_end) = schema.edge_for("posts", "author").unwrap();
        assert_eq!(same_edge.name, "author");
        assert_ne!(end, other_end);
    }

    #[test]
    fn test_compile_rejects_unpaired_edge() {
        let mut models = users_posts();
        // Rebuild posts without its side of the edge.
        models[1] = Model::define(
            "posts",
            vec![
                ("id", Attr::Key(PrimaryKey::auto_increment())),
                ("title", Attr::Field(Field::string())),
            ],
        )
        .unwrap();
        let err = Schema::compile(models).unwrap_err();
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn test_compile_rejects_unknown_target() {
        let models = vec![Model::define(
            "users",
            vec![
                ("id", Attr::Key(PrimaryKey::string())),
                ("posts", Attr::Relation(Relation::many("posts", "author"))),
            ],
        )
        .unwrap()];
        let err = Schema::compile(models).unwrap_err();
        assert!(err.to_string().contains("unknown model"));
    }

    #[test]
    fn test_compile_rejects_three_ends() {
        let mut models = users_posts();
        models.push(
            Model::define(
                "comments",
                vec![
                    ("id", Attr::Key(PrimaryKey::auto_increment())),
                    ("author", Attr::Relation(Relation::one("users", "author"))),
                ],
            )
            .unwrap(),
        );
        assert!(Schema::compile(models).is_err());
    }

    #[test]
    fn test_compile_rejects_mismatched_targets() {
        let models = vec![
            Model::define(
                "users",
                vec![
                    ("id", Attr::Key(PrimaryKey::string())),
                    ("pet", Attr::Relation(Relation::one("users", "owner"))),
                ],
            )
            .unwrap(),
            Model::define(
                "dogs",
                vec![
                    ("id", Attr::Key(PrimaryKey::string())),
                    ("owner", Attr::Relation(Relation::one("users", "owner"))),
                ],
            )
            .unwrap(),
        ];
        assert!(Schema::compile(models).is_err());
    }

    #[test]
    fn test_compile_self_relation() {
        let schema = Schema::compile(vec![Model::define(
            "folders",
            vec![
                ("id", Attr::Key(PrimaryKey::auto_increment())),
                (
                    "parent",
                    Attr::Relation(Relation::one("folders", "tree").optional()),
                ),
                ("children", Attr::Relation(Relation::many("folders", "tree"))),
            ],
        )
        .unwrap()])
        .unwrap();

        let (edge, end) = schema.edge_for("folders", "parent").unwrap();
        assert_eq!(edge.ends[end].field, "parent");
        assert_eq!(edge.ends[1 - end].field, "children");
    }

    #[test]
    fn test_collection_specs() {
        let models = vec![Model::define(
            "users",
            vec![
                ("id", Attr::Key(PrimaryKey::auto_increment())),
                ("email", Attr::Field(Field::string().unique())),
                ("name", Attr::Field(Field::string())),
            ],
        )
        .unwrap()];
        let schema = Schema::compile(models).unwrap();
        let specs = schema.collection_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "users");
        assert_eq!(specs[0].key_field, "id");
        assert!(specs[0].auto_increment);
        assert_eq!(specs[0].unique_fields, vec!["email".to_string()]);
    }
}
