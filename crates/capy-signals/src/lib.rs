//! capy-signals - D-Bus signal notification center
//!
//! Features:
//! - Observers subscribe by notification name or by signal/interface/sender
//! - One bus match rule per distinct rule, shared by all its observers
//! - Local notifications posted back onto the bus as signals
//! - zbus backend behind the default `dbus` feature

pub mod bus;
pub mod catalog;
pub mod center;
pub mod config;
#[cfg(feature = "dbus")]
pub mod dbus;
pub mod dispatch;
pub mod error;
pub mod names;
pub mod post;
pub mod registry;
pub mod rule;
pub mod types;

pub use bus::{SignalBus, SignalEmission};
pub use center::NotificationCenter;
pub use config::{BusKind, CenterConfig, NameMapping, WatchRule};
pub use dispatch::SignalOccurrence;
pub use error::{BusError, ConfigError, SignalError};
pub use names::CANONICAL_PREFIX;
pub use post::PostTarget;
pub use rule::{MatchRule, RuleSpec};
pub use types::{
    ArgKind, ArgumentInfo, Notification, ObserverId, Proxy, SignalKey, SignalMetadata, UserInfo,
    Value,
};
