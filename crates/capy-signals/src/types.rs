//! Core types for capy-signals

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Payload carried by a notification, keyed by argument or header name.
pub type UserInfo = BTreeMap<String, Value>;

/// Fixed header keys present in every delivered notification.
pub const KEY_MEMBER: &str = "member";
pub const KEY_INTERFACE: &str = "interface";
pub const KEY_SENDER: &str = "sender";
pub const KEY_PATH: &str = "path";
pub const KEY_DESTINATION: &str = "destination";

/// Positional key for an argument without a key annotation: "arg0", "arg1", ...
pub fn positional_key(index: usize) -> String {
    format!("arg{}", index)
}

/// A single signal argument value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Variant(Box<Value>),
    /// A wire value this crate has no structured representation for.
    Opaque(String),
}

impl Value {
    /// Borrow the string if this is a `Str`. Object paths and signatures
    /// are not strings for matching purposes.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value can be sent as an argument of type `signature`.
    ///
    /// Basic types must match exactly. Containers are checked by their
    /// outer type only, and `Opaque` is accepted for any container.
    pub fn fits(&self, signature: &str) -> bool {
        let expected = ArgKind::from_signature(signature);
        if expected != ArgKind::Composite {
            return self.kind() == Some(expected);
        }

        match (self, signature.as_bytes().first()) {
            (Value::Array(_), Some(b'a')) => !signature.starts_with("a{"),
            (Value::Dict(_), Some(b'a')) => signature.starts_with("a{"),
            (Value::Struct(_), Some(b'(')) => true,
            (Value::Variant(_), Some(b'v')) => true,
            (Value::Opaque(_), Some(_)) => true,
            _ => false,
        }
    }

    /// Basic kind of this value, `None` for containers.
    fn kind(&self) -> Option<ArgKind> {
        let kind = match self {
            Value::Bool(_) => ArgKind::Bool,
            Value::Byte(_) => ArgKind::Byte,
            Value::Int16(_) => ArgKind::Int16,
            Value::UInt16(_) => ArgKind::UInt16,
            Value::Int32(_) => ArgKind::Int32,
            Value::UInt32(_) => ArgKind::UInt32,
            Value::Int64(_) => ArgKind::Int64,
            Value::UInt64(_) => ArgKind::UInt64,
            Value::Double(_) => ArgKind::Double,
            Value::Str(_) => ArgKind::Str,
            Value::ObjectPath(_) => ArgKind::ObjectPath,
            Value::Signature(_) => ArgKind::Signature,
            _ => return None,
        };
        Some(kind)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Classification of a D-Bus type signature for posting purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Str,
    ObjectPath,
    Signature,
    /// Arrays, structs, dict entries, variants and unix fds.
    Composite,
}

impl ArgKind {
    /// Classify a single complete type signature, e.g. "s", "u" or "a{sv}".
    pub fn from_signature(signature: &str) -> Self {
        match signature {
            "y" => ArgKind::Byte,
            "b" => ArgKind::Bool,
            "n" => ArgKind::Int16,
            "q" => ArgKind::UInt16,
            "i" => ArgKind::Int32,
            "u" => ArgKind::UInt32,
            "x" => ArgKind::Int64,
            "t" => ArgKind::UInt64,
            "d" => ArgKind::Double,
            "s" => ArgKind::Str,
            "o" => ArgKind::ObjectPath,
            "g" => ArgKind::Signature,
            _ => ArgKind::Composite,
        }
    }

    /// Value substituted for a missing basic argument on post.
    pub fn zero_value(&self) -> Option<Value> {
        let value = match self {
            ArgKind::Byte => Value::Byte(0),
            ArgKind::Bool => Value::Bool(false),
            ArgKind::Int16 => Value::Int16(0),
            ArgKind::UInt16 => Value::UInt16(0),
            ArgKind::Int32 => Value::Int32(0),
            ArgKind::UInt32 => Value::UInt32(0),
            ArgKind::Int64 => Value::Int64(0),
            ArgKind::UInt64 => Value::UInt64(0),
            ArgKind::Double => Value::Double(0.0),
            ArgKind::Str => Value::Str(String::new()),
            // An empty string is not a valid object path
            ArgKind::ObjectPath => Value::ObjectPath("/".to_string()),
            ArgKind::Signature => Value::Signature(String::new()),
            ArgKind::Composite => return None,
        };
        Some(value)
    }
}

/// Handle for a remote object: bus name plus object path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Proxy {
    /// Bus name, e.g. ":1.42" or "org.freedesktop.DBus"
    pub bus_name: String,
    /// Object path, e.g. "/org/freedesktop/DBus"
    pub path: String,
}

impl Proxy {
    pub fn new(bus_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.bus_name, self.path)
    }
}

/// Structural identity of a signal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub interface: String,
    pub member: String,
}

impl SignalKey {
    pub fn new(interface: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            member: member.into(),
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.member)
    }
}

/// One declared signal argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentInfo {
    /// Complete D-Bus type signature of the argument
    pub signature: String,
    /// Key-name annotation, used instead of "argN" in payloads
    pub key: Option<String>,
}

impl ArgumentInfo {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn kind(&self) -> ArgKind {
        ArgKind::from_signature(&self.signature)
    }

    /// Payload key for this argument at `index`.
    pub fn payload_key(&self, index: usize) -> String {
        self.key.clone().unwrap_or_else(|| positional_key(index))
    }
}

/// Introspection data for one signal. Immutable once recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalMetadata {
    pub interface: String,
    pub member: String,
    pub args: Vec<ArgumentInfo>,
    /// Notification-name annotation
    pub notification_name: Option<String>,
}

impl SignalMetadata {
    pub fn new(interface: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            member: member.into(),
            args: Vec::new(),
            notification_name: None,
        }
    }

    pub fn with_arg(mut self, arg: ArgumentInfo) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_notification_name(mut self, name: impl Into<String>) -> Self {
        self.notification_name = Some(name.into());
        self
    }

    pub fn key(&self) -> SignalKey {
        SignalKey::new(self.interface.clone(), self.member.clone())
    }
}

/// A notification as delivered to observers or handed to `post_notification`.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub name: String,
    /// Emitting object for delivered notifications; for posting only the
    /// path is used and must be exported.
    pub object: Proxy,
    pub user_info: UserInfo,
}

/// Identity of an observer. Registrations are grouped and removed by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

static NEXT_OBSERVER: AtomicU64 = AtomicU64::new(1);

impl ObserverId {
    /// Allocate a process-unique observer id.
    pub fn next() -> Self {
        ObserverId(NEXT_OBSERVER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}
