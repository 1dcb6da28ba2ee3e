//! Error types for capy-signals

/// Errors reported by the bus collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus rejected request: {0}")]
    Rejected(String),

    #[error("Unsupported argument for emission: {0}")]
    Unsupported(String),

    #[cfg(feature = "dbus")]
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[cfg(feature = "dbus")]
    #[error("D-Bus fdo error: {0}")]
    Fdo(#[from] zbus::fdo::Error),

    #[cfg(feature = "dbus")]
    #[error("D-Bus value error: {0}")]
    Variant(#[from] zbus::zvariant::Error),
}

/// Notification center errors
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Notification name '{name}' is taken (requested for {interface}.{member})")]
    DuplicateMapping {
        name: String,
        interface: String,
        member: String,
    },

    #[error("No signal mapping for notification name '{0}'")]
    UnresolvableName(String),

    #[error("No metadata recorded for signal {interface}.{member}")]
    UnknownSignal { interface: String, member: String },

    #[error("Object at '{0}' is not exported on the bus")]
    ObjectNotExported(String),

    #[error("Missing required argument {index} ('{key}', type '{signature}')")]
    MissingRequiredArgument {
        index: usize,
        key: String,
        signature: String,
    },

    #[error("Argument {index} ('{key}') does not fit type '{signature}'")]
    ArgumentTypeMismatch {
        index: usize,
        key: String,
        signature: String,
    },

    #[error("Bus registration failed: {0}")]
    BusRegistrationFailed(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
