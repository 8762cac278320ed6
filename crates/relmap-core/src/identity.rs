//! Identity keys.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::value::Value;

/// Entity name plus ordered primary-key values.
///
/// Two keys are equal when they name the same entity and their key values
/// are equal under [`Value::key_eq`], so integer width does not matter.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    entity: &'static str,
    values: Vec<Value>,
}

impl IdentityKey {
    pub fn new(entity: &'static str, values: Vec<Value>) -> Self {
        Self { entity, values }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.values.len() == other.values.len()
            && self.values.iter().zip(&other.values).all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.values.len().hash(state);
        for value in &self.values {
            value.hash_key(state);
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.entity)?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "]")
    }
}
