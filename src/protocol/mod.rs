//! Control channel wire protocol.
//!
//! Requests are JSON objects naming an `action` plus the fields that
//! action requires. Responses are a handler payload, the generic
//! acknowledgment `{"error": false}`, or `{"error": "<message>"}`.
//!
//! The method table ([`REGISTRY`]) is the single source of truth for the
//! method surface and is sent to clients that ask for `methods`.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use wifi_agent_esp32::protocol::{Method, Request};
//!
//! let request = Request::parse(json!({"action": "wifi_reset"})).unwrap();
//! assert_eq!(request.method, Method::WifiReset);
//! assert!(request.method.descriptor().expects_generic_ack);
//! ```

mod codec;

pub use codec::{write_message, CodecError, MessageReader};

use serde_json::{json, Map, Value};
use std::fmt;

/// Receive buffer size; also the largest accepted request.
pub const RECEIVE_LEN: usize = 2048;

/// Methods understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Return the method table.
    Methods,
    /// Stop serving, persist settings and reboot.
    Reset,
    /// Register a known access point.
    WifiAdd,
    /// Re-run the connect-or-broadcast decision.
    WifiReset,
    /// Receive a file.
    LoadFile,
}

/// Static description of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub method: Method,
    pub name: &'static str,
    pub required_fields: &'static [&'static str],
    /// Dispatcher sends `{"error": false}` once the handler returns.
    pub expects_generic_ack: bool,
}

/// The method table.
pub const REGISTRY: &[MethodDescriptor] = &[
    MethodDescriptor {
        method: Method::Methods,
        name: "methods",
        required_fields: &[],
        expects_generic_ack: false,
    },
    MethodDescriptor {
        method: Method::Reset,
        name: "reset",
        required_fields: &[],
        expects_generic_ack: true,
    },
    MethodDescriptor {
        method: Method::WifiAdd,
        name: "wifi_add",
        required_fields: &["ssid", "password", "hidden"],
        expects_generic_ack: true,
    },
    MethodDescriptor {
        method: Method::WifiReset,
        name: "wifi_reset",
        required_fields: &[],
        expects_generic_ack: true,
    },
    MethodDescriptor {
        method: Method::LoadFile,
        name: "load_file",
        required_fields: &["filename", "length"],
        expects_generic_ack: true,
    },
];

impl Method {
    /// Resolve an action name.
    pub fn from_action(action: &str) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|descriptor| descriptor.name == action)
            .map(|descriptor| descriptor.method)
    }

    /// Table entry for this method.
    pub fn descriptor(self) -> &'static MethodDescriptor {
        let index = match self {
            Self::Methods => 0,
            Self::Reset => 1,
            Self::WifiAdd => 2,
            Self::WifiReset => 3,
            Self::LoadFile => 4,
        };
        &REGISTRY[index]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated request: known action, all required fields present.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub fields: Map<String, Value>,
}

impl Request {
    /// Validate a decoded message against the method table.
    pub fn parse(message: Value) -> Result<Self, ProtocolError> {
        let Value::Object(fields) = message else {
            return Err(ProtocolError::NotAnObject);
        };

        let action = match fields.get("action") {
            Some(Value::String(action)) => action,
            Some(_) => return Err(ProtocolError::NoSuchMethod),
            None => return Err(ProtocolError::MissingField("action")),
        };
        let method = Method::from_action(action).ok_or(ProtocolError::NoSuchMethod)?;

        if let Some(missing) = method
            .descriptor()
            .required_fields
            .iter()
            .find(|field| !fields.contains_key(**field))
        {
            return Err(ProtocolError::MissingField(missing));
        }

        Ok(Self { method, fields })
    }

    /// A field that must be a string.
    pub fn str_field(&self, name: &'static str) -> Result<&str, ProtocolError> {
        match self.fields.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(ProtocolError::InvalidField {
                field: name,
                expected: "string",
            }),
            None => Err(ProtocolError::MissingField(name)),
        }
    }

    /// A field that must be a non-negative integer.
    pub fn u64_field(&self, name: &'static str) -> Result<u64, ProtocolError> {
        match self.fields.get(name) {
            Some(value) => value.as_u64().ok_or(ProtocolError::InvalidField {
                field: name,
                expected: "non-negative integer",
            }),
            None => Err(ProtocolError::MissingField(name)),
        }
    }

    /// A loosely typed flag. Command-line clients send `"no"`/`"false"`
    /// strings as well as JSON booleans.
    pub fn flag_field(&self, name: &'static str) -> Result<bool, ProtocolError> {
        self.fields
            .get(name)
            .map(is_truthy)
            .ok_or(ProtocolError::MissingField(name))
    }
}

/// Loose truthiness for flags stored or sent as JSON.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !matches!(
            s.trim().to_lowercase().as_str(),
            "" | "0" | "no" | "false" | "off"
        ),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// `{"error": false}`
pub fn ack() -> Value {
    json!({ "error": false })
}

/// `{"ready": true}`, sent before the raw bytes of an upload.
pub fn ready() -> Value {
    json!({ "ready": true })
}

/// `{"error": "<message>"}`
pub fn error_response(message: impl fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// The method table as sent to clients: method name to its arguments.
pub fn methods_table() -> Value {
    let table: Map<String, Value> = REGISTRY
        .iter()
        .map(|descriptor| {
            (
                descriptor.name.to_string(),
                json!({
                    "args": descriptor.required_fields,
                    "generic_ack": descriptor.expects_generic_ack,
                }),
            )
        })
        .collect();
    Value::Object(table)
}

/// True if a response reports a failure.
pub fn is_error(response: &Value) -> bool {
    matches!(response.get("error"), Some(e) if *e != Value::Bool(false))
}

/// Request validation errors. The `Display` text is what the client sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request is valid JSON but not an object.
    NotAnObject,
    /// Unknown or non-string `action`.
    NoSuchMethod,
    /// A required field is absent.
    MissingField(&'static str),
    /// A field has the wrong type.
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "request must be a JSON object"),
            Self::NoSuchMethod => write!(f, "no such method"),
            Self::MissingField(field) => write!(f, "Missing '{}' field", field),
            Self::InvalidField { field, expected } => {
                write!(f, "Invalid '{}' field: expected {}", field, expected)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_resolve() {
        for descriptor in REGISTRY {
            assert_eq!(Method::from_action(descriptor.name), Some(descriptor.method));
            assert_eq!(descriptor.method.descriptor(), descriptor);
        }
        assert_eq!(Method::from_action("frobnicate"), None);
    }

    #[test]
    fn test_every_method_has_its_own_entry() {
        let all = [
            Method::Methods,
            Method::Reset,
            Method::WifiAdd,
            Method::WifiReset,
            Method::LoadFile,
        ];
        assert_eq!(all.len(), REGISTRY.len());
        for method in all {
            assert_eq!(method.descriptor().method, method);
        }
    }

    #[test]
    fn test_generic_ack_flags() {
        assert!(!Method::Methods.descriptor().expects_generic_ack);
        assert!(Method::Reset.descriptor().expects_generic_ack);
        assert!(Method::WifiAdd.descriptor().expects_generic_ack);
        assert!(Method::WifiReset.descriptor().expects_generic_ack);
        assert!(Method::LoadFile.descriptor().expects_generic_ack);
    }

    #[test]
    fn test_missing_required_field() {
        let result = Request::parse(json!({
            "action": "wifi_add", "ssid": "X", "password": "Y"
        }));
        let err = result.unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("hidden"));
        assert_eq!(err.to_string(), "Missing 'hidden' field");
    }

    #[test]
    fn test_missing_action() {
        let err = Request::parse(json!({"ssid": "X"})).unwrap_err();
        assert_eq!(err.to_string(), "Missing 'action' field");
    }

    #[test]
    fn test_unknown_action() {
        let err = Request::parse(json!({"action": "frobnicate"})).unwrap_err();
        assert_eq!(err, ProtocolError::NoSuchMethod);
        assert_eq!(
            Request::parse(json!({"action": 7})).unwrap_err(),
            ProtocolError::NoSuchMethod
        );
    }

    #[test]
    fn test_not_an_object() {
        assert_eq!(
            Request::parse(json!(["action"])).unwrap_err(),
            ProtocolError::NotAnObject
        );
    }

    #[test]
    fn test_field_accessors() {
        let request = Request::parse(json!({
            "action": "load_file", "filename": "main.py", "length": 5000
        }))
        .unwrap();
        assert_eq!(request.str_field("filename"), Ok("main.py"));
        assert_eq!(request.u64_field("length"), Ok(5000));

        let negative = Request::parse(json!({
            "action": "load_file", "filename": 3, "length": -1
        }))
        .unwrap();
        assert!(matches!(
            negative.str_field("filename"),
            Err(ProtocolError::InvalidField { field: "filename", .. })
        ));
        assert!(matches!(
            negative.u64_field("length"),
            Err(ProtocolError::InvalidField { field: "length", .. })
        ));
    }

    #[test]
    fn test_flag_field_accepts_cli_strings() {
        let parse = |hidden: Value| {
            Request::parse(json!({
                "action": "wifi_add", "ssid": "X", "password": "", "hidden": hidden
            }))
            .unwrap()
            .flag_field("hidden")
            .unwrap()
        };
        assert!(parse(json!(true)));
        assert!(!parse(json!(false)));
        assert!(!parse(json!("no")));
        assert!(!parse(json!("False")));
        assert!(parse(json!("yes")));
        assert!(parse(json!(1)));
        assert!(!parse(json!(0)));
    }

    #[test]
    fn test_methods_table_shape() {
        let table = methods_table();
        assert_eq!(table["wifi_add"]["args"], json!(["ssid", "password", "hidden"]));
        assert_eq!(table["methods"]["generic_ack"], json!(false));
        assert_eq!(table.as_object().unwrap().len(), REGISTRY.len());
    }

    #[test]
    fn test_error_detection() {
        assert!(!is_error(&ack()));
        assert!(!is_error(&ready()));
        assert!(is_error(&error_response("no such method")));
    }
}
