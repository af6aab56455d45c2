//! Session-scoped tools and argument coercion.
//!
//! Embedders declare each tool as an explicit descriptor plus a handler;
//! the gate coerces incoming argument maps against the declared types
//! before invoking the handler on a blocking worker.

use std::sync::Arc;

use serde_json::{Map, Value};

use gate_protocol::tools::{StructField, ToolDescriptor, TypeDesc};

/// Handler invoked for a session tool.
///
/// Runs on a blocking worker with the gate's eval lock held. Errors are
/// returned to the caller as tool errors, never as transport failures.
pub type ToolHandler =
    Arc<dyn Fn(Map<String, Value>, &ToolContext) -> Result<Value, String> + Send + Sync>;

/// One session tool as handed to the gate.
#[derive(Clone)]
pub struct SessionToolBinding {
    pub descriptor: ToolDescriptor,
    pub handler: ToolHandler,
}

impl SessionToolBinding {
    pub fn new(descriptor: ToolDescriptor, handler: ToolHandler) -> Self {
        Self {
            descriptor,
            handler,
        }
    }
}

/// Per-invocation context passed to tool handlers.
pub struct ToolContext {
    progress: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl ToolContext {
    pub(crate) fn new(progress: Option<Box<dyn Fn(&str) + Send + Sync>>) -> Self {
        Self { progress }
    }

    /// Report intermediate progress. For asynchronous calls the text is
    /// published as a `tool_progress` event; synchronous calls discard it.
    pub fn progress(&self, text: &str) {
        if let Some(report) = &self.progress {
            report(text);
        }
    }
}

/// Coerce a raw argument map against a tool descriptor.
///
/// Unknown and missing-required parameters are reported together with the
/// set of valid keys so the caller can fix the call without a round trip.
pub fn coerce_arguments(
    descriptor: &ToolDescriptor,
    mut arguments: Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let valid: Vec<&str> = descriptor.args.iter().map(|a| a.name.as_str()).collect();

    let unknown: Vec<String> = arguments
        .keys()
        .filter(|k| !valid.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(format!(
            "unknown parameters {unknown:?}; valid parameters are {valid:?}"
        ));
    }

    let mut coerced = Map::new();
    for arg in &descriptor.args {
        match arguments.remove(&arg.name) {
            Some(value) => {
                let value = coerce_value(&arg.ty, value)
                    .map_err(|e| format!("parameter {:?}: {e}", arg.name))?;
                coerced.insert(arg.name.clone(), value);
            }
            None if arg.required => {
                return Err(format!(
                    "missing required parameter {:?}; valid parameters are {valid:?}",
                    arg.name
                ));
            }
            None => {}
        }
    }
    Ok(coerced)
}

/// Coerce one value to a declared type.
///
/// Struct arguments also accept positional arrays, zipped against the
/// declared fields in order; this is why field order is preserved end to
/// end through the codec.
pub fn coerce_value(ty: &TypeDesc, value: Value) -> Result<Value, String> {
    match ty {
        TypeDesc::String => match value {
            Value::String(_) => Ok(value),
            other => Err(format!("expected string, got {}", kind_of(&other))),
        },
        TypeDesc::Integer => match value {
            Value::Number(ref n) if n.is_i64() || n.is_u64() => Ok(value),
            Value::Number(ref n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err("expected integer, got fractional number".to_string()),
            },
            other => Err(format!("expected integer, got {}", kind_of(&other))),
        },
        TypeDesc::Number => match value {
            Value::Number(_) => Ok(value),
            other => Err(format!("expected number, got {}", kind_of(&other))),
        },
        TypeDesc::Boolean => match value {
            Value::Bool(_) => Ok(value),
            other => Err(format!("expected boolean, got {}", kind_of(&other))),
        },
        TypeDesc::Enum { values, .. } => match value {
            Value::String(ref s) if values.contains(s) => Ok(value),
            Value::String(s) => Err(format!("{s:?} is not one of {values:?}")),
            other => Err(format!("expected one of {values:?}, got {}", kind_of(&other))),
        },
        TypeDesc::Struct { fields } => coerce_struct(fields, value),
        TypeDesc::Array { items } => match value {
            Value::Array(elements) => {
                let coerced: Result<Vec<Value>, String> = elements
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| coerce_value(items, v).map_err(|e| format!("element {i}: {e}")))
                    .collect();
                Ok(Value::Array(coerced?))
            }
            other => Err(format!("expected array, got {}", kind_of(&other))),
        },
        TypeDesc::Any { .. } => Ok(value),
        TypeDesc::Optional { inner } => match value {
            Value::Null => Ok(Value::Null),
            other => coerce_value(inner, other),
        },
    }
}

fn coerce_struct(fields: &[StructField], value: Value) -> Result<Value, String> {
    match value {
        Value::Object(mut map) => {
            let mut out = Map::new();
            for field in fields {
                let raw = map
                    .remove(&field.name)
                    .ok_or_else(|| format!("missing struct field {:?}", field.name))?;
                let coerced = coerce_value(&field.ty, raw)
                    .map_err(|e| format!("field {:?}: {e}", field.name))?;
                out.insert(field.name.clone(), coerced);
            }
            if let Some(extra) = map.keys().next() {
                return Err(format!("unexpected struct field {extra:?}"));
            }
            Ok(Value::Object(out))
        }
        // Positional form: values zipped against declared field order.
        Value::Array(elements) => {
            if elements.len() != fields.len() {
                return Err(format!(
                    "expected {} positional struct values, got {}",
                    fields.len(),
                    elements.len()
                ));
            }
            let mut out = Map::new();
            for (field, raw) in fields.iter().zip(elements) {
                let coerced = coerce_value(&field.ty, raw)
                    .map_err(|e| format!("field {:?}: {e}", field.name))?;
                out.insert(field.name.clone(), coerced);
            }
            Ok(Value::Object(out))
        }
        other => Err(format!("expected object, got {}", kind_of(&other))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use gate_protocol::tools::ToolArg;

    use super::*;

    fn point_type() -> TypeDesc {
        TypeDesc::Struct {
            fields: vec![
                StructField {
                    name: "x".into(),
                    ty: TypeDesc::Number,
                    description: String::new(),
                },
                StructField {
                    name: "y".into(),
                    ty: TypeDesc::Number,
                    description: String::new(),
                },
            ],
        }
    }

    fn plot_tool() -> ToolDescriptor {
        ToolDescriptor::new("plot", "Plot a point")
            .with_arg(ToolArg::new("point", point_type()))
            .with_arg(ToolArg::new("label", TypeDesc::String).optional())
    }

    #[test]
    fn test_coerce_rejects_unknown_parameters() {
        let args = json!({"point": {"x": 1, "y": 2}, "bogus": true});
        let err = coerce_arguments(&plot_tool(), args.as_object().unwrap().clone()).unwrap_err();
        assert!(err.contains("bogus"));
        assert!(err.contains("point"));
        assert!(err.contains("label"));
    }

    #[test]
    fn test_coerce_reports_missing_required() {
        let err = coerce_arguments(&plot_tool(), Map::new()).unwrap_err();
        assert!(err.contains("point"));
    }

    #[test]
    fn test_struct_accepts_positional_array() {
        let coerced = coerce_value(&point_type(), json!([1.5, 2.5])).unwrap();
        assert_eq!(coerced, json!({"x": 1.5, "y": 2.5}));
    }

    #[test]
    fn test_struct_rejects_arity_mismatch() {
        let err = coerce_value(&point_type(), json!([1.5])).unwrap_err();
        assert!(err.contains("positional"));
    }

    #[test]
    fn test_integer_accepts_whole_float() {
        let coerced = coerce_value(&TypeDesc::Integer, json!(3.0)).unwrap();
        assert_eq!(coerced, json!(3));
        assert!(coerce_value(&TypeDesc::Integer, json!(3.5)).is_err());
    }

    #[test]
    fn test_enum_membership() {
        let ty = TypeDesc::Enum {
            values: vec!["fast".into(), "exact".into()],
            description: String::new(),
        };
        assert!(coerce_value(&ty, json!("fast")).is_ok());
        assert!(coerce_value(&ty, json!("slow")).is_err());
    }

    #[test]
    fn test_optional_accepts_null() {
        let ty = TypeDesc::Optional {
            inner: Box::new(TypeDesc::String),
        };
        assert_eq!(coerce_value(&ty, Value::Null).unwrap(), Value::Null);
        assert!(coerce_value(&ty, json!(5)).is_err());
    }

    #[test]
    fn test_tool_context_progress_is_optional() {
        let ctx = ToolContext::new(None);
        ctx.progress("ignored");

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = ToolContext::new(Some(Box::new(move |text| {
            sink.lock().push(text.to_string());
        })));
        ctx.progress("halfway");
        assert_eq!(seen.lock().as_slice(), ["halfway"]);
    }
}
