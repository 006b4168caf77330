use crate::error::{LatticeError, Result};
use crate::schema::field::{Field, PrimaryKey};
use crate::schema::relation::Relation;
use std::collections::BTreeMap;

/// One named attribute of a model under definition.
#[derive(Debug, Clone)]
pub enum Attr {
    Field(Field),
    Key(PrimaryKey),
    Relation(Relation),
}

/// A compiled model: resolved fields, the primary key, and this model's
/// sides of its edges. Immutable once defined.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    key_field: String,
    primary_key: PrimaryKey,
    fields: BTreeMap<String, Field>,
    relations: BTreeMap<String, Relation>,
}

impl Model {
    /// Partition an attribute list into plain fields, the primary key, and
    /// relations. Fails unless exactly one primary key is declared, every
    /// default inhabits its declared shape, and the key generator matches
    /// the key kind.
    pub fn define(name: &str, attrs: Vec<(&str, Attr)>) -> Result<Model> {
        let mut key: Option<(String, PrimaryKey)> = None;
        let mut fields = BTreeMap::new();
        let mut relations = BTreeMap::new();

        for (attr_name, attr) in attrs {
            let taken = fields.contains_key(attr_name)
                || relations.contains_key(attr_name)
                || key.as_ref().is_some_and(|(k, _)| k == attr_name);
            if taken {
                return Err(LatticeError::InvalidSchema(format!(
                    "Model '{name}': duplicate attribute '{attr_name}'"
                )));
            }

            match attr {
                Attr::Field(field) => {
                    field.check_default(attr_name)?;
                    fields.insert(attr_name.to_string(), field);
                }
                Attr::Key(primary_key) => {
                    if key.is_some() {
                        return Err(LatticeError::InvalidSchema(format!(
                            "Model '{name}': more than one primary key"
                        )));
                    }
                    primary_key.check(name)?;
                    key = Some((attr_name.to_string(), primary_key));
                }
                Attr::Relation(relation) => {
                    relations.insert(attr_name.to_string(), relation);
                }
            }
        }

        let (key_field, primary_key) = key.ok_or_else(|| {
            LatticeError::InvalidSchema(format!("Model '{name}': no primary key declared"))
        })?;

        Ok(Model {
            name: name.to_string(),
            key_field,
            primary_key,
            fields,
            relations,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the attribute holding the primary key.
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    pub fn fields(&self) -> &BTreeMap<String, Field> {
        &self.fields
    }

    pub fn relations(&self) -> &BTreeMap<String, Relation> {
        &self.relations
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::relation::OnDelete;
    use crate::types::Type;
    use crate::value::Value;

    #[test]
    fn test_define_partitions_attrs() {
        let model = Model::define(
            "users",
            vec![
                ("id", Attr::Key(PrimaryKey::auto_increment())),
                ("name", Attr::Field(Field::string())),
                ("email", Attr::Field(Field::string().unique())),
                (
                    "posts",
                    Attr::Relation(Relation::many("posts", "author").on_delete(OnDelete::Cascade)),
                ),
            ],
        )
        .unwrap();

        assert_eq!(model.name(), "users");
        assert_eq!(model.key_field(), "id");
        assert_eq!(model.fields().len(), 2);
        assert_eq!(model.relations().len(), 1);
        assert!(model.field("email").unwrap().is_unique());
    }

    #[test]
    fn test_define_requires_exactly_one_key() {
        let missing = Model::define("users", vec![("name", Attr::Field(Field::string()))]);
        assert!(missing.is_err());

        let twice = Model::define(
            "users",
            vec![
                ("id", Attr::Key(PrimaryKey::string())),
                ("id2", Attr::Key(PrimaryKey::string())),
            ],
        );
        assert!(twice.is_err());
    }

    #[test]
    fn test_define_rejects_duplicate_attr() {
        let result = Model::define(
            "users",
            vec![
                ("id", Attr::Key(PrimaryKey::string())),
                ("name", Attr::Field(Field::string())),
                ("name", Attr::Field(Field::int())),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_define_rejects_bad_default() {
        let result = Model::define(
            "users",
            vec![
                ("id", Attr::Key(PrimaryKey::string())),
                (
                    "age",
                    Attr::Field(Field::of(Type::Int).default_value(Value::String("ten".into()))),
                ),
            ],
        );
        assert!(result.is_err());
    }
}
