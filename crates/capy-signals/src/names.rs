//! Notification name mapping.
//!
//! Names resolve in three steps:
//! - explicit registrations (`register_name`)
//! - notification-name annotations in the signal catalog
//! - the canonical form `Signal_<interface>_<member>`

use crate::catalog::SignalCatalog;
use crate::error::SignalError;
use crate::types::SignalKey;
use log::debug;
use std::collections::HashMap;

/// Prefix of synthesized notification names.
pub const CANONICAL_PREFIX: &str = "Signal_";

/// Bijective name <-> signal tables.
#[derive(Debug, Default)]
pub struct NameMapper {
    by_name: HashMap<String, SignalKey>,
    by_signal: HashMap<SignalKey, String>,
}

impl NameMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `interface.member`. Registering the identical pair again
    /// succeeds. Reusing either side with a different partner fails and
    /// leaves both tables untouched, as does a name that the catalog or the
    /// canonical form already gives to another signal.
    pub fn register_name(
        &mut self,
        name: &str,
        member: &str,
        interface: &str,
        catalog: &SignalCatalog,
    ) -> Result<(), SignalError> {
        let key = SignalKey::new(interface, member);
        let name_taken = self.by_name.get(name).is_some_and(|k| k != &key);
        let signal_taken = self.by_signal.get(&key).is_some_and(|n| n != name);
        let annotated_elsewhere = catalog
            .by_notification_name(name)
            .is_some_and(|m| m.key() != key);
        let canonical_elsewhere = parse_canonical(name, catalog).is_some_and(|k| k != key);

        if name_taken || signal_taken || annotated_elsewhere || canonical_elsewhere {
            return Err(SignalError::DuplicateMapping {
                name: name.to_string(),
                interface: interface.to_string(),
                member: member.to_string(),
            });
        }

        if self.by_name.insert(name.to_string(), key.clone()).is_none() {
            debug!("Registered notification name '{}' for {}", name, key);
        }
        self.by_signal.insert(key, name.to_string());
        Ok(())
    }

    /// Resolve a notification name to its signal identity.
    pub fn resolve(&self, name: &str, catalog: &SignalCatalog) -> Result<SignalKey, SignalError> {
        if let Some(key) = self.by_name.get(name) {
            return Ok(key.clone());
        }

        if let Some(metadata) = catalog.by_notification_name(name) {
            return Ok(metadata.key());
        }

        parse_canonical(name, catalog)
            .ok_or_else(|| SignalError::UnresolvableName(name.to_string()))
    }

    /// Notification name used when delivering `interface.member`. An
    /// annotation is only used if it resolves back to the same signal.
    pub fn name_for(&self, interface: &str, member: &str, catalog: &SignalCatalog) -> String {
        let key = SignalKey::new(interface, member);
        if let Some(name) = self.by_signal.get(&key) {
            return name.clone();
        }

        catalog
            .get(interface, member)
            .and_then(|m| m.notification_name.clone())
            .filter(|name| self.resolve(name, catalog).is_ok_and(|k| k == key))
            .unwrap_or_else(|| canonical_name(interface, member))
    }
}

/// `Signal_<interface>_<member>`
pub fn canonical_name(interface: &str, member: &str) -> String {
    format!("{}{}_{}", CANONICAL_PREFIX, interface, member)
}

/// Split a canonical name back into interface and member.
///
/// Member names never contain dots, so the separator is an underscore after
/// the last dot. If the last interface element itself has underscores,
/// a split naming a catalogued signal wins; otherwise the first candidate.
fn parse_canonical(name: &str, catalog: &SignalCatalog) -> Option<SignalKey> {
    let rest = name.strip_prefix(CANONICAL_PREFIX)?;
    let last_dot = rest.rfind('.')?;

    let candidates: Vec<SignalKey> = rest[last_dot..]
        .match_indices('_')
        .map(|(offset, _)| last_dot + offset)
        .filter_map(|split| {
            let (interface, member) = (&rest[..split], &rest[split + 1..]);
            if interface.ends_with('.') || member.is_empty() {
                None
            } else {
                Some(SignalKey::new(interface, member))
            }
        })
        .collect();

    candidates
        .iter()
        .find(|k| catalog.contains(&k.interface, &k.member))
        .or_else(|| candidates.first())
        .cloned()
}
