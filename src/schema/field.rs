use crate::error::{LatticeError, Result};
use crate::types::Type;
use crate::value::{Key, Value};
use std::fmt;
use std::sync::Arc;

/// Capability contract for plugging an external validator into a field.
/// Success returns the (possibly coerced) value to store.
pub trait Validate: Send + Sync {
    fn parse(&self, value: &Value) -> std::result::Result<Value, String>;
}

#[derive(Clone)]
enum Checker {
    Typed(Type),
    Adapter(Arc<dyn Validate>),
}

/// A plain record field: a type (or external validator) plus uniqueness,
/// optionality, and defaulting metadata.
///
/// Builders consume and return by value, so a derived field never aliases
/// state with the field it was built from, and a finished field can be
/// attached to any number of models.
#[derive(Clone)]
pub struct Field {
    checker: Checker,
    unique: bool,
    optional: bool,
    default: Option<Value>,
}

impl Field {
    /// A field validated by the type algebra.
    pub fn of(ty: Type) -> Field {
        Field {
            checker: Checker::Typed(ty),
            unique: false,
            optional: false,
            default: None,
        }
    }

    /// A field validated by an external adapter.
    pub fn external(adapter: Arc<dyn Validate>) -> Field {
        Field {
            checker: Checker::Adapter(adapter),
            unique: false,
            optional: false,
            default: None,
        }
    }

    pub fn string() -> Field {
        Field::of(Type::String)
    }

    pub fn int() -> Field {
        Field::of(Type::Int)
    }

    pub fn float() -> Field {
        Field::of(Type::Float)
    }

    pub fn number() -> Field {
        Field::of(Type::Number)
    }

    pub fn boolean() -> Field {
        Field::of(Type::Boolean)
    }

    pub fn date() -> Field {
        Field::of(Type::Date)
    }

    /// Enforce that no two records in the collection share this field's value.
    pub fn unique(mut self) -> Field {
        self.unique = true;
        self
    }

    /// Allow the field to be absent (stored as `Null`).
    pub fn optional(mut self) -> Field {
        self.optional = true;
        self
    }

    /// Value used when the field is absent from a write.
    pub fn default_value(mut self, value: impl Into<Value>) -> Field {
        self.default = Some(value.into());
        self
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// The declared type, when the field is validated by the type algebra.
    pub fn ty(&self) -> Option<&Type> {
        match &self.checker {
            Checker::Typed(t) => Some(t),
            Checker::Adapter(_) => None,
        }
    }

    /// Resolve a written value: absent values take the default (or `Null`
    /// when optional), then the checker accepts or rejects.
    pub fn parse(&self, name: &str, value: Option<&Value>) -> Result<Value> {
        let value = match value {
            Some(v) if !v.is_null() => v.clone(),
            _ => match (&self.default, self.optional) {
                (Some(d), _) => d.clone(),
                (None, true) => return Ok(Value::Null),
                (None, false) => {
                    return Err(LatticeError::Validation(format!(
                        "Required field '{name}' is missing"
                    )))
                }
            },
        };

        match &self.checker {
            Checker::Typed(t) => {
                if t.is_type(&value) {
                    Ok(value)
                } else {
                    Err(LatticeError::Validation(format!(
                        "Field '{name}' expected {t}, got {}",
                        value.kind_name()
                    )))
                }
            }
            Checker::Adapter(adapter) => adapter
                .parse(&value)
                .map_err(|e| LatticeError::Validation(format!("Field '{name}': {e}"))),
        }
    }

    /// Compile-time check that the declared default inhabits the checker.
    pub(crate) fn check_default(&self, name: &str) -> Result<()> {
        let Some(default) = &self.default else {
            return Ok(());
        };
        match &self.checker {
            Checker::Typed(t) if !t.is_type(default) => Err(LatticeError::InvalidSchema(
                format!("Default for field '{name}' does not satisfy {t}"),
            )),
            Checker::Typed(_) => Ok(()),
            Checker::Adapter(adapter) => adapter.parse(default).map(|_| ()).map_err(|e| {
                LatticeError::InvalidSchema(format!("Default for field '{name}': {e}"))
            }),
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match &self.checker {
            Checker::Typed(t) => t.to_string(),
            Checker::Adapter(_) => "external".to_string(),
        };
        f.debug_struct("Field")
            .field("shape", &shape)
            .field("unique", &self.unique)
            .field("optional", &self.optional)
            .field("default", &self.default)
            .finish()
    }
}

/// Kind of a model's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KeyKind {
    String,
    Int,
    Date,
}

impl KeyKind {
    pub fn matches(&self, key: &Key) -> bool {
        matches!(
            (self, key),
            (KeyKind::String, Key::String(_))
                | (KeyKind::Int, Key::Int(_))
                | (KeyKind::Date, Key::Date(_))
        )
    }
}

/// How a primary key is produced when the caller does not supply one.
#[derive(Clone)]
pub enum KeyGen {
    /// The caller must supply the key.
    None,
    /// The storage engine allocates the next integer key.
    AutoIncrement,
    Ulid,
    Uuid,
    Nanoid,
    Custom(Arc<dyn Fn() -> Key + Send + Sync>),
}

impl fmt::Debug for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyGen::None => "None",
            KeyGen::AutoIncrement => "AutoIncrement",
            KeyGen::Ulid => "Ulid",
            KeyGen::Uuid => "Uuid",
            KeyGen::Nanoid => "Nanoid",
            KeyGen::Custom(_) => "Custom",
        };
        write!(f, "KeyGen::{name}")
    }
}

/// The primary key descriptor. Exactly one per model.
#[derive(Debug, Clone)]
pub struct PrimaryKey {
    kind: KeyKind,
    generator: KeyGen,
}

impl PrimaryKey {
    pub fn string() -> PrimaryKey {
        PrimaryKey {
            kind: KeyKind::String,
            generator: KeyGen::None,
        }
    }

    pub fn int() -> PrimaryKey {
        PrimaryKey {
            kind: KeyKind::Int,
            generator: KeyGen::None,
        }
    }

    pub fn date() -> PrimaryKey {
        PrimaryKey {
            kind: KeyKind::Date,
            generator: KeyGen::None,
        }
    }

    /// Integer key allocated by the storage engine on insert.
    pub fn auto_increment() -> PrimaryKey {
        PrimaryKey {
            kind: KeyKind::Int,
            generator: KeyGen::AutoIncrement,
        }
    }

    pub fn generated(mut self, generator: KeyGen) -> PrimaryKey {
        self.generator = generator;
        self
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn generator(&self) -> &KeyGen {
        &self.generator
    }

    pub fn is_auto_increment(&self) -> bool {
        matches!(self.generator, KeyGen::AutoIncrement)
    }

    /// Run the generator strategy. `None` for caller-supplied and
    /// engine-allocated keys.
    pub fn generate(&self) -> Option<Key> {
        match &self.generator {
            KeyGen::None | KeyGen::AutoIncrement => None,
            KeyGen::Ulid => Some(Key::String(ulid::Ulid::new().to_string().to_lowercase())),
            KeyGen::Uuid => Some(Key::String(uuid::Uuid::new_v4().to_string())),
            KeyGen::Nanoid => Some(Key::String(nanoid::nanoid!())),
            KeyGen::Custom(generate) => Some(generate()),
        }
    }

    /// Generator strategies must produce keys of the declared kind.
    pub(crate) fn check(&self, model: &str) -> Result<()> {
        let ok = match &self.generator {
            KeyGen::None | KeyGen::Custom(_) => true,
            KeyGen::AutoIncrement => self.kind == KeyKind::Int,
            KeyGen::Ulid | KeyGen::Uuid | KeyGen::Nanoid => self.kind == KeyKind::String,
        };
        if ok {
            Ok(())
        } else {
            Err(LatticeError::InvalidSchema(format!(
                "Model '{model}': key generator does not produce {:?} keys",
                self.kind
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_applies_default() {
        let field = Field::string().default_value("member");
        assert_eq!(
            field.parse("role", None).unwrap(),
            Value::String("member".into())
        );
        assert_eq!(
            field.parse("role", Some(&Value::String("admin".into()))).unwrap(),
            Value::String("admin".into())
        );
    }

    #[test]
    fn test_parse_missing_required() {
        let field = Field::string();
        assert!(field.parse("name", None).is_err());
        assert!(field.parse("name", Some(&Value::Null)).is_err());
    }

    #[test]
    fn test_parse_optional_stores_null() {
        let field = Field::string().optional();
        assert_eq!(field.parse("bio", None).unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_rejects_wrong_kind() {
        let field = Field::int();
        let err = field.parse("age", Some(&Value::String("old".into()))).unwrap_err();
        assert!(err.to_string().contains("age"));
        assert!(err.to_string().contains("int"));
    }

    #[test]
    fn test_derived_field_does_not_alias() {
        let base = Field::string();
        let derived = base.clone().unique().default_value("x");
        assert!(!base.is_unique());
        assert!(derived.is_unique());
        assert!(base.default().is_none());
    }

    #[test]
    fn test_external_adapter() {
        struct Lowercase;
        impl Validate for Lowercase {
            fn parse(&self, value: &Value) -> std::result::Result<Value, String> {
                match value {
                    Value::String(s) => Ok(Value::String(s.to_lowercase())),
                    other => Err(format!("expected string, got {}", other.kind_name())),
                }
            }
        }

        let field = Field::external(Arc::new(Lowercase));
        assert_eq!(
            field.parse("tag", Some(&Value::String("ABC".into()))).unwrap(),
            Value::String("abc".into())
        );
        assert!(field.parse("tag", Some(&Value::Int(1))).is_err());
    }

    #[test]
    fn test_generated_keys_match_kind() {
        assert!(PrimaryKey::string().generated(KeyGen::Ulid).check("m").is_ok());
        assert!(PrimaryKey::int().generated(KeyGen::Ulid).check("m").is_err());
        assert!(PrimaryKey::auto_increment().check("m").is_ok());
        assert!(PrimaryKey::date()
            .generated(KeyGen::AutoIncrement)
            .check("m")
            .is_err());

        let key = PrimaryKey::string().generated(KeyGen::Uuid).generate().unwrap();
        assert!(matches!(key, Key::String(_)));
        assert!(PrimaryKey::int().generate().is_none());
    }
}
