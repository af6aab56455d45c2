//! Tool descriptors published by gates, and their JSON-schema projection.
//!
//! A gate declares each session tool as an explicit [`ToolDescriptor`];
//! there is no runtime reflection anywhere. Schema generation is a pure
//! function over the descriptor union, so the broker side can validate
//! exactly what the gate side will coerce.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Type of one tool argument, as declared by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeDesc {
    String,
    Integer,
    Number,
    Boolean,
    Enum {
        values: Vec<String>,
        #[serde(default)]
        description: String,
    },
    Struct {
        fields: Vec<StructField>,
    },
    Array {
        items: Box<TypeDesc>,
    },
    /// Escape hatch for types with no structured mapping; `type_name` names
    /// the underlying interpreter type for the schema description.
    Any {
        #[serde(default)]
        type_name: String,
    },
    /// Union of a type with a none marker. Unwrapped at registration; the
    /// argument becomes non-required.
    Optional {
        inner: Box<TypeDesc>,
    },
}

impl TypeDesc {
    /// JSON schema fragment for this type.
    pub fn json_schema(&self) -> Value {
        match self {
            Self::String => json!({"type": "string"}),
            Self::Integer => json!({"type": "integer"}),
            Self::Number => json!({"type": "number"}),
            Self::Boolean => json!({"type": "boolean"}),
            Self::Enum {
                values,
                description,
            } => {
                let mut schema = Map::new();
                schema.insert("type".into(), json!("string"));
                schema.insert("enum".into(), json!(values));
                if !description.is_empty() {
                    schema.insert("description".into(), json!(description));
                }
                Value::Object(schema)
            }
            Self::Struct { fields } => {
                let mut properties = Map::new();
                let mut required = Vec::with_capacity(fields.len());
                for field in fields {
                    let mut prop = field.ty.json_schema();
                    if !field.description.is_empty() {
                        if let Some(obj) = prop.as_object_mut() {
                            obj.insert("description".into(), json!(field.description));
                        }
                    }
                    properties.insert(field.name.clone(), prop);
                    required.push(field.name.clone());
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })
            }
            Self::Array { items } => json!({
                "type": "array",
                "items": items.json_schema(),
            }),
            Self::Any { type_name } => {
                if type_name.is_empty() {
                    json!({"type": "string"})
                } else {
                    json!({"type": "string", "description": format!("value of type {type_name}")})
                }
            }
            Self::Optional { inner } => inner.json_schema(),
        }
    }

    /// Unwrap one level of `Optional`, reporting whether it was present.
    pub fn unwrap_optional(&self) -> (&TypeDesc, bool) {
        match self {
            Self::Optional { inner } => (inner, true),
            other => (other, false),
        }
    }
}

/// One field of a struct-typed argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeDesc,
    #[serde(default)]
    pub description: String,
}

/// One argument of a session tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolArg {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeDesc,
    pub required: bool,
    #[serde(default)]
    pub keyword_only: bool,
}

impl ToolArg {
    pub fn new(name: impl Into<String>, ty: TypeDesc) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            keyword_only: false,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn keyword_only(mut self) -> Self {
        self.keyword_only = true;
        self
    }

    /// Normalize `Optional` wrappers: the declared type is unwrapped and
    /// the argument marked non-required.
    #[must_use]
    pub fn normalized(self) -> Self {
        let (inner, was_optional) = self.ty.unwrap_optional();
        if was_optional {
            Self {
                ty: inner.clone(),
                required: false,
                ..self
            }
        } else {
            self
        }
    }
}

/// A tool as published by a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: Vec<ToolArg>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self, arg: ToolArg) -> Self {
        self.args.push(arg.normalized());
        self
    }

    /// Full JSON schema for this tool's input object.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in &self.args {
            properties.insert(arg.name.clone(), arg.ty.json_schema());
            if arg.required {
                required.push(arg.name.clone());
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}
