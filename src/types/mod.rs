//! The structural type algebra.
//!
//! Every field shape is a self-describing [`Type`] tree. Two pure functions
//! do all the work: [`Type::is_type`] answers "does this value inhabit this
//! type", [`is_subtype`] answers "is every value of `candidate` also a value
//! of `base`". The `Display` form is deterministic and doubles as the
//! identity used to de-duplicate union options.

use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A structural type node.
#[derive(Clone)]
pub enum Type {
    String,
    Int,
    Float,
    /// Any numeric value; `Int` and `Float` are both subtypes.
    Number,
    Boolean,
    BigInt,
    Date,
    Bytes,
    /// The top type: accepts every value.
    Unknown,
    /// Exactly one value.
    Literal(Value),
    Array(Box<Type>),
    /// An array whose elements are pairwise distinct.
    Set(Box<Type>),
    /// Fixed length, positional element types.
    Tuple(Vec<Type>),
    /// Accepts `Null` in addition to the inner type.
    Optional(Box<Type>),
    /// Ordered options, first match wins on membership.
    Union(Vec<Type>),
    /// Structural object shape; extra keys on values are ignored.
    Object(BTreeMap<String, Type>),
    /// Opaque user predicate.
    Custom(Predicate),
}

/// A named membership predicate for [`Type::Custom`].
#[derive(Clone)]
pub struct Predicate {
    name: String,
    check: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl Predicate {
    pub fn new(name: &str, check: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Predicate {
            name: name.to_string(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.name)
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Type {
    pub fn literal(value: impl Into<Value>) -> Type {
        Type::Literal(value.into())
    }

    pub fn array(element: Type) -> Type {
        Type::Array(Box::new(element))
    }

    pub fn set(element: Type) -> Type {
        Type::Set(Box::new(element))
    }

    pub fn tuple(elements: impl IntoIterator<Item = Type>) -> Type {
        Type::Tuple(elements.into_iter().collect())
    }

    pub fn optional(inner: Type) -> Type {
        Type::Optional(Box::new(inner))
    }

    /// Build a union: nested unions are flattened and options de-duplicated
    /// by their printed form, keeping first occurrences in order.
    pub fn union(options: impl IntoIterator<Item = Type>) -> Type {
        let mut flat = Vec::new();
        let mut seen = Vec::new();
        flatten_union(options.into_iter().collect(), &mut flat, &mut seen);
        if flat.len() == 1 {
            flat.pop().unwrap()
        } else {
            Type::Union(flat)
        }
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Type)>) -> Type {
        Type::Object(fields.into_iter().map(|(k, t)| (k.into(), t)).collect())
    }

    pub fn custom(name: &str, check: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Type {
        Type::Custom(Predicate::new(name, check))
    }

    /// Structural membership test. Pure and deterministic.
    pub fn is_type(&self, value: &Value) -> bool {
        match self {
            Type::Unknown => true,
            Type::String => matches!(value, Value::String(_)),
            Type::Int => matches!(value, Value::Int(_)),
            Type::Float => matches!(value, Value::Float(x) if x.is_finite()),
            Type::Number => matches!(value, Value::Int(_) | Value::Float(_)),
            Type::Boolean => matches!(value, Value::Bool(_)),
            Type::BigInt => matches!(value, Value::BigInt(_)),
            Type::Date => matches!(value, Value::Date(_)),
            Type::Bytes => matches!(value, Value::Bytes(_)),
            Type::Literal(expected) => value == expected,
            Type::Array(element) => match value {
                Value::Array(items) => items.iter().all(|v| element.is_type(v)),
                _ => false,
            },
            Type::Set(element) => match value {
                Value::Array(items) => {
                    items.iter().all(|v| element.is_type(v)) && pairwise_distinct(items)
                }
                _ => false,
            },
            Type::Tuple(elements) => match value {
                Value::Array(items) => {
                    items.len() == elements.len()
                        && elements.iter().zip(items).all(|(t, v)| t.is_type(v))
                }
                _ => false,
            },
            Type::Optional(inner) => value.is_null() || inner.is_type(value),
            Type::Union(options) => options.iter().any(|t| t.is_type(value)),
            Type::Object(fields) => match value {
                Value::Object(entries) => fields
                    .iter()
                    .all(|(name, t)| t.is_type(entries.get(name).unwrap_or(&Value::Null))),
                _ => false,
            },
            Type::Custom(predicate) => (predicate.check)(value),
        }
    }

    /// Infer the narrowest sensible type for a runtime value. Scalars become
    /// literals; containers recurse. Used to check query-filter values
    /// against declared field types via [`is_subtype`].
    pub fn of(value: &Value) -> Type {
        match value {
            Value::Array(items) => Type::Tuple(items.iter().map(Type::of).collect()),
            Value::Object(entries) => Type::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Type::of(v)))
                    .collect(),
            ),
            scalar => Type::Literal(scalar.clone()),
        }
    }
}

fn flatten_union(options: Vec<Type>, flat: &mut Vec<Type>, seen: &mut Vec<String>) {
    for option in options {
        match option {
            Type::Union(nested) => flatten_union(nested, flat, seen),
            other => {
                let printed = other.to_string();
                if !seen.contains(&printed) {
                    seen.push(printed);
                    flat.push(other);
                }
            }
        }
    }
}

fn pairwise_distinct(items: &[Value]) -> bool {
    for (i, a) in items.iter().enumerate() {
        if items[i + 1..].contains(a) {
            return false;
        }
    }
    true
}

/// True iff every value accepted by `candidate` is accepted by `base`
/// (candidate is narrower-or-equal). Covariant and structural.
pub fn is_subtype(base: &Type, candidate: &Type) -> bool {
    // A union candidate is covered iff each of its options is; a non-union
    // candidate against a union base needs some base option to cover it.
    if let Type::Union(options) = candidate {
        return options.iter().all(|c| is_subtype(base, c));
    }

    match base {
        Type::Unknown => true,
        Type::Union(options) => options.iter().any(|b| is_subtype(b, candidate)),
        Type::Literal(expected) => matches!(candidate, Type::Literal(v) if v == expected),
        Type::String => primitive_or_literal(candidate, &Type::String),
        Type::Int => primitive_or_literal(candidate, &Type::Int),
        Type::Float => primitive_or_literal(candidate, &Type::Float),
        Type::Boolean => primitive_or_literal(candidate, &Type::Boolean),
        Type::BigInt => primitive_or_literal(candidate, &Type::BigInt),
        Type::Date => primitive_or_literal(candidate, &Type::Date),
        Type::Bytes => primitive_or_literal(candidate, &Type::Bytes),
        Type::Number => match candidate {
            Type::Number | Type::Int | Type::Float => true,
            Type::Literal(v) => Type::Number.is_type(v),
            _ => false,
        },
        Type::Array(element) => match candidate {
            Type::Array(c) => is_subtype(element, c),
            // A tuple value is an array; it fits when every slot fits.
            Type::Tuple(slots) => slots.iter().all(|s| is_subtype(element, s)),
            _ => false,
        },
        Type::Set(element) => matches!(candidate, Type::Set(c) if is_subtype(element, c)),
        Type::Tuple(elements) => match candidate {
            Type::Tuple(c) => {
                c.len() == elements.len()
                    && elements.iter().zip(c).all(|(b, c)| is_subtype(b, c))
            }
            _ => false,
        },
        Type::Optional(inner) => match candidate {
            Type::Optional(c) => is_subtype(inner, c),
            Type::Literal(Value::Null) => true,
            other => is_subtype(inner, other),
        },
        // Width subtyping: candidate must carry every base field, covariantly,
        // and may add more.
        Type::Object(fields) => match candidate {
            Type::Object(c) => fields
                .iter()
                .all(|(name, b)| c.get(name).is_some_and(|t| is_subtype(b, t))),
            _ => false,
        },
        // Opaque predicates admit no subtyping beyond identity.
        Type::Custom(predicate) => match candidate {
            Type::Custom(c) => Arc::ptr_eq(&predicate.check, &c.check),
            _ => false,
        },
    }
}

fn primitive_or_literal(candidate: &Type, base: &Type) -> bool {
    match candidate {
        Type::Literal(v) => base.is_type(v),
        other => std::mem::discriminant(other) == std::mem::discriminant(base),
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::String => write!(f, "string"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Number => write!(f, "number"),
            Type::Boolean => write!(f, "boolean"),
            Type::BigInt => write!(f, "bigint"),
            Type::Date => write!(f, "date"),
            Type::Bytes => write!(f, "bytes"),
            Type::Unknown => write!(f, "unknown"),
            Type::Literal(v) => write!(f, "{v}"),
            Type::Array(element) => {
                if element.needs_parens() {
                    write!(f, "({element})[]")
                } else {
                    write!(f, "{element}[]")
                }
            }
            Type::Set(element) => write!(f, "Set<{element}>"),
            Type::Tuple(elements) => {
                write!(f, "[")?;
                for (i, t) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "]")
            }
            Type::Optional(inner) => {
                if inner.needs_parens() {
                    write!(f, "({inner})?")
                } else {
                    write!(f, "{inner}?")
                }
            }
            Type::Union(options) => {
                for (i, t) in options.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{t}")?;
                }
                Ok(())
            }
            Type::Object(fields) => {
                write!(f, "{{ ")?;
                for (i, (name, t)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {t}")?;
                }
                write!(f, " }}")
            }
            Type::Custom(predicate) => write!(f, "custom<{}>", predicate.name),
        }
    }
}

impl Type {
    fn needs_parens(&self) -> bool {
        matches!(self, Type::Union(_) | Type::Optional(_))
    }
}
