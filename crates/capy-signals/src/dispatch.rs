//! Incoming signal matching and notification payloads.

use crate::catalog::SignalCatalog;
use crate::names::NameMapper;
use crate::registry::{Registration, Registry};
use crate::types::{
    KEY_DESTINATION, KEY_INTERFACE, KEY_MEMBER, KEY_PATH, KEY_SENDER, Notification, Proxy,
    UserInfo, Value, positional_key,
};
use log::debug;
use std::collections::HashMap;

/// Interface and member of the bus daemon's ownership signal.
const DAEMON_INTERFACE: &str = "org.freedesktop.DBus";
const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";

/// One signal emission received from the bus.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalOccurrence {
    pub interface: String,
    pub member: String,
    /// Unique bus name of the emitter
    pub sender: String,
    pub path: String,
    pub destination: Option<String>,
    pub args: Vec<Value>,
}

impl SignalOccurrence {
    pub fn new(
        interface: impl Into<String>,
        member: impl Into<String>,
        sender: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            member: member.into(),
            sender: sender.into(),
            path: path.into(),
            destination: None,
            args: Vec::new(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Current unique owners of well-known bus names.
///
/// Signals always carry the emitter's unique name, so a rule naming a
/// well-known sender matches through this table.
#[derive(Debug, Default)]
pub struct NameOwners {
    owners: HashMap<String, String>,
}

impl NameOwners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the owner of `name`; `None` or an empty owner clears it.
    pub fn set(&mut self, name: &str, owner: Option<&str>) {
        match owner.filter(|o| !o.is_empty()) {
            Some(owner) => {
                debug!("{} is owned by {}", name, owner);
                self.owners.insert(name.to_string(), owner.to_string());
            }
            None => {
                self.owners.remove(name);
            }
        }
    }

    pub fn owner_of(&self, name: &str) -> Option<&str> {
        self.owners.get(name).map(String::as_str)
    }

    /// Every name `unique` is known by, starting with itself.
    pub fn names_of<'a>(&'a self, unique: &'a str) -> Vec<&'a str> {
        let mut names = vec![unique];
        names.extend(
            self.owners
                .iter()
                .filter(|(_, owner)| owner.as_str() == unique)
                .map(|(name, _)| name.as_str()),
        );
        names
    }

    /// Track ownership from a `NameOwnerChanged` occurrence. Returns false
    /// for any other signal.
    pub fn observe(&mut self, occurrence: &SignalOccurrence) -> bool {
        if occurrence.interface != DAEMON_INTERFACE || occurrence.member != NAME_OWNER_CHANGED {
            return false;
        }
        let strings: Vec<&str> = occurrence.args.iter().filter_map(Value::as_str).collect();
        let [name, _old, new] = strings[..] else {
            return false;
        };
        if name.starts_with(':') {
            return true;
        }
        self.set(name, Some(new));
        true
    }
}

/// Registrations of every active observable matching `occurrence`, in
/// registry order and insertion order within an observable.
pub fn matching_registrations(
    registry: &Registry,
    occurrence: &SignalOccurrence,
    owners: &NameOwners,
) -> Vec<Registration> {
    let senders = owners.names_of(&occurrence.sender);
    registry
        .active()
        .filter(|o| {
            o.rule.matches_header(
                &occurrence.interface,
                &occurrence.member,
                &senders,
                &occurrence.path,
                occurrence.destination.as_deref(),
            ) && o.rule.matches_args(&occurrence.args)
        })
        .flat_map(|o| o.registrations.iter().cloned())
        .collect()
}

/// Build the notification delivered for `occurrence`.
pub fn build_notification(
    occurrence: &SignalOccurrence,
    names: &NameMapper,
    catalog: &SignalCatalog,
) -> Notification {
    let mut user_info = UserInfo::new();
    user_info.insert(KEY_MEMBER.to_string(), Value::from(occurrence.member.as_str()));
    user_info.insert(KEY_INTERFACE.to_string(), Value::from(occurrence.interface.as_str()));
    user_info.insert(KEY_SENDER.to_string(), Value::from(occurrence.sender.as_str()));
    user_info.insert(KEY_PATH.to_string(), Value::from(occurrence.path.as_str()));
    user_info.insert(
        KEY_DESTINATION.to_string(),
        Value::from(occurrence.destination.clone().unwrap_or_default()),
    );

    let declared = catalog
        .get(&occurrence.interface, &occurrence.member)
        .map(|m| m.args.as_slice())
        .unwrap_or_default();

    for (index, value) in occurrence.args.iter().enumerate() {
        let key = declared
            .get(index)
            .map(|arg| arg.payload_key(index))
            .unwrap_or_else(|| positional_key(index));
        user_info.insert(key, value.clone());
    }

    Notification {
        name: names.name_for(&occurrence.interface, &occurrence.member, catalog),
        object: Proxy::new(occurrence.sender.clone(), occurrence.path.clone()),
        user_info,
    }
}
