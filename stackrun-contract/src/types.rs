//! IDL document types.
//!
//! A contract is a JSON array of entities. Only `interface` entities matter for
//! dispatch; structs, enums and the trailing `meta` entry are parsed loosely and
//! otherwise ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entity {
    Interface(Interface),
    Struct(Named),
    Enum(Named),
    Meta(Value),
}

/// Any entity we only need the name of.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Named {
    pub name: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<TypeRef>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Param {
    pub name: String,
    #[serde(flatten)]
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TypeRef {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub optional: bool,
}

/// Built-in scalar types the dispatcher can check without a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    String,
    Int,
    Float,
    Bool,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
        }
    }
}

impl TypeRef {
    /// Check a value against this type.
    ///
    /// User-defined types (structs, enums) accept any value; their shape belongs
    /// to the implementation.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            return if self.optional {
                Ok(())
            } else {
                Err(format!("null is not allowed for type '{}'", self.name))
            };
        }

        if self.is_array {
            let items = value
                .as_array()
                .ok_or_else(|| format!("expected an array of '{}'", self.name))?;
            let element = TypeRef {
                name: self.name.clone(),
                is_array: false,
                optional: false,
            };
            for (i, item) in items.iter().enumerate() {
                element.check(item).map_err(|e| format!("element {i}: {e}"))?;
            }
            return Ok(());
        }

        match Builtin::from_name(&self.name) {
            Some(builtin) if !builtin.accepts(value) => {
                Err(format!("expected '{}', got {}", self.name, kind_of(value)))
            }
            _ => Ok(()),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
