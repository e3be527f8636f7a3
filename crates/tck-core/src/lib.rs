use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const PYTHON_AGENT_PATH: &str = "/test_agent/python/testagent.py";
pub const JAVA_AGENT_PATH: &str = "/test_agent/java/target/tck-test-agent-java-jar-with-dependencies.jar";
pub const RUST_AGENT_PATH: &str = "/test_agent/rust/target/debug/rust_tck";
pub const CPP_AGENT_PATH: &str = "/test_agent/cpp/build/bin/test_agent_cpp";

pub const TRANSPORT_FLAG: &str = "--transport";
pub const SDK_NAME_FLAG: &str = "--sdkname";

/// Sentinel prefix letting raw bytes ride a JSON-only transport as a string.
pub const BYTES_SENTINEL: &str = "BYTES:";
/// Byte comparisons are anchored at this authority marker; prefixes differ
/// per implementation and are deliberately ignored.
pub const ANY_AUTHORITY_MARKER: &str = "googleapis.com/";
pub const ANY_TYPE_PREFIX: &str = "type.googleapis.com/";

pub const PATH_SEPARATOR: &str = ".";

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("unsupported agent artifact '{artifact}': only .jar, .py, and executable files are accepted")]
    UnsupportedAgentArtifact { artifact: String },
    #[error("unsupported host platform '{platform}'")]
    UnsupportedPlatform { platform: String },
    #[error("no entity registered for ordinal {ordinal}")]
    UnknownEntity { ordinal: usize },
    #[error("malformed entity handle '{handle}'")]
    MalformedEntityHandle { handle: String },
    #[error("cannot cast '{value}' to {expected}")]
    TypeMismatch { value: String, expected: String },
    #[error("protobuf_field_type '{declared}' not handled")]
    UnsupportedFieldType { declared: String },
    #[error("unknown status code member '{name}'")]
    UnknownStatusCode { name: String },
    #[error("path conflict at '{path}': a leaf and a mapping share the key")]
    PathConflict { path: String },
    #[error("path '{path}' not found in response")]
    PathNotFound { path: String },
    #[error("normalization marker '{marker}' absent; expected is {expected} but received {actual}")]
    NormalizationMismatch {
        marker: String,
        expected: String,
        actual: String,
    },
    #[error("assertion error; expected is {expected} but received {actual}")]
    AssertionFailure { expected: String, actual: String },
    #[error("agent '{agent}' did not connect within {waited_secs}s")]
    ConnectionTimeout { agent: String, waited_secs: u64 },
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Protocol status codes shared by every implementation under test.
/// Scenario tables reference members as `UCode.NAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl UCode {
    pub fn code(self) -> i64 {
        match self {
            UCode::Ok => 0,
            UCode::Cancelled => 1,
            UCode::Unknown => 2,
            UCode::InvalidArgument => 3,
            UCode::DeadlineExceeded => 4,
            UCode::NotFound => 5,
            UCode::AlreadyExists => 6,
            UCode::PermissionDenied => 7,
            UCode::ResourceExhausted => 8,
            UCode::FailedPrecondition => 9,
            UCode::Aborted => 10,
            UCode::OutOfRange => 11,
            UCode::Unimplemented => 12,
            UCode::Internal => 13,
            UCode::Unavailable => 14,
            UCode::DataLoss => 15,
            UCode::Unauthenticated => 16,
        }
    }

    pub fn from_name(name: &str) -> Result<UCode> {
        let code = match name {
            "OK" => UCode::Ok,
            "CANCELLED" => UCode::Cancelled,
            "UNKNOWN" => UCode::Unknown,
            "INVALID_ARGUMENT" => UCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => UCode::DeadlineExceeded,
            "NOT_FOUND" => UCode::NotFound,
            "ALREADY_EXISTS" => UCode::AlreadyExists,
            "PERMISSION_DENIED" => UCode::PermissionDenied,
            "RESOURCE_EXHAUSTED" => UCode::ResourceExhausted,
            "FAILED_PRECONDITION" => UCode::FailedPrecondition,
            "ABORTED" => UCode::Aborted,
            "OUT_OF_RANGE" => UCode::OutOfRange,
            "UNIMPLEMENTED" => UCode::Unimplemented,
            "INTERNAL" => UCode::Internal,
            "UNAVAILABLE" => UCode::Unavailable,
            "DATA_LOSS" => UCode::DataLoss,
            "UNAUTHENTICATED" => UCode::Unauthenticated,
            other => {
                return Err(HarnessError::UnknownStatusCode {
                    name: other.to_string(),
                })
            }
        };
        Ok(code)
    }

    pub fn name(self) -> &'static str {
        match self {
            UCode::Ok => "OK",
            UCode::Cancelled => "CANCELLED",
            UCode::Unknown => "UNKNOWN",
            UCode::InvalidArgument => "INVALID_ARGUMENT",
            UCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            UCode::NotFound => "NOT_FOUND",
            UCode::AlreadyExists => "ALREADY_EXISTS",
            UCode::PermissionDenied => "PERMISSION_DENIED",
            UCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            UCode::FailedPrecondition => "FAILED_PRECONDITION",
            UCode::Aborted => "ABORTED",
            UCode::OutOfRange => "OUT_OF_RANGE",
            UCode::Unimplemented => "UNIMPLEMENTED",
            UCode::Internal => "INTERNAL",
            UCode::Unavailable => "UNAVAILABLE",
            UCode::DataLoss => "DATA_LOSS",
            UCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for UCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves a scenario literal of the form `UCode.MEMBER` to its numeric
/// code rendered as a string. Literals without the enum reference pass
/// through unchanged.
pub fn resolve_code_literal(raw: &str) -> Result<String> {
    if !raw.contains("UCode") {
        return Ok(raw.to_string());
    }
    let member = raw.split('.').nth(1).unwrap_or("");
    Ok(UCode::from_name(member)?.code().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Str,
    Bool,
    Float,
    Bytes,
    /// Enumerated status code; the literal must resolve to a numeric code.
    EnumCode,
}

impl FieldType {
    pub fn parse(declared: &str) -> Result<FieldType> {
        match declared {
            "int" => Ok(FieldType::Int),
            "str" => Ok(FieldType::Str),
            "bool" => Ok(FieldType::Bool),
            "float" => Ok(FieldType::Float),
            "bytes" => Ok(FieldType::Bytes),
            "enumCode" => Ok(FieldType::EnumCode),
            other => Err(HarnessError::UnsupportedFieldType {
                declared: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::Bytes(b) => {
                write!(f, "{}", String::from_utf8_lossy(b).escape_debug())
            }
        }
    }
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Str(s) => Value::String(s.clone()),
            FieldValue::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

/// Casts a scenario-table literal to its declared protocol type.
///
/// Two behaviors are intentional compatibility quirks, not defects to fix:
/// an unparseable int literal yields `Null` (scenarios assert on absent
/// numeric fields this way), and `bool` treats ANY non-empty literal as
/// true, including `"false"`.
pub fn cast(raw: &str, declared: FieldType, jsonable: bool) -> Result<FieldValue> {
    let resolved = resolve_code_literal(raw)?;
    let value = match declared {
        FieldType::Int => match resolved.parse::<i64>() {
            Ok(n) => FieldValue::Int(n),
            Err(_) => FieldValue::Null,
        },
        FieldType::Str => FieldValue::Str(resolved),
        FieldType::Bool => FieldValue::Bool(!resolved.is_empty()),
        FieldType::Float => {
            let parsed = resolved
                .parse::<f64>()
                .map_err(|_| HarnessError::TypeMismatch {
                    value: resolved.clone(),
                    expected: "float".to_string(),
                })?;
            FieldValue::Float(parsed)
        }
        FieldType::Bytes => {
            if jsonable {
                FieldValue::Str(format!("{BYTES_SENTINEL}{resolved}"))
            } else {
                FieldValue::Bytes(resolved.into_bytes())
            }
        }
        FieldType::EnumCode => {
            let parsed = resolved
                .parse::<i64>()
                .map_err(|_| HarnessError::TypeMismatch {
                    value: resolved.clone(),
                    expected: "enumCode".to_string(),
                })?;
            FieldValue::Int(parsed)
        }
    };
    Ok(value)
}

/// Joins nested object keys into dotted paths. Leaves map whole; scenario
/// data is tree-shaped, so no cycle handling.
pub fn flatten(value: &Value, sep: &str) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_inner(value, "", sep, &mut out);
    out
}

fn flatten_inner(value: &Value, prefix: &str, sep: &str, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let joined = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}{sep}{key}")
                };
                flatten_inner(child, &joined, sep, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Rebuilds a nested object from dotted paths, creating intermediate
/// objects on demand. A leaf and a mapping claiming the same key is a
/// `PathConflict`.
pub fn unflatten(entries: &BTreeMap<String, Value>, delim: &str) -> Result<Value> {
    let mut root = Map::new();
    for (path, value) in entries {
        let parts: Vec<&str> = path.split(delim).collect();
        let mut cursor = &mut root;
        for part in &parts[..parts.len() - 1] {
            let slot = cursor
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            cursor = match slot {
                Value::Object(map) => map,
                _ => {
                    return Err(HarnessError::PathConflict {
                        path: path.clone(),
                    })
                }
            };
        }
        let leaf = parts[parts.len() - 1];
        if matches!(cursor.get(leaf), Some(Value::Object(_))) {
            return Err(HarnessError::PathConflict { path: path.clone() });
        }
        cursor.insert(leaf.to_string(), value.clone());
    }
    Ok(Value::Object(root))
}

/// Walks a dotted path through a response tree. A string node holding an
/// encoded JSON document is decoded before descending, which is how nested
/// payloads embedded as opaque strings stay addressable. The empty path
/// returns the root unchanged.
pub fn access_nested(root: &Value, dotted: &str) -> Result<Value> {
    if dotted.is_empty() {
        return Ok(root.clone());
    }
    let mut current = root.clone();
    for segment in dotted.split(PATH_SEPARATOR) {
        if let Value::String(encoded) = &current {
            current = serde_json::from_str(encoded).map_err(|_| HarnessError::PathNotFound {
                path: dotted.to_string(),
            })?;
        }
        current = current
            .get(segment)
            .cloned()
            .ok_or_else(|| HarnessError::PathNotFound {
                path: dotted.to_string(),
            })?;
    }
    Ok(current)
}
