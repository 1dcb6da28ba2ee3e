//! Match rules and their specificity order.

use crate::types::{Proxy, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Argument filters cannot address indices at or above this bound.
pub const MAX_FILTER_INDEX: usize = 64;

/// Argument filters keyed by argument index.
pub type ArgFilters = BTreeMap<u8, String>;

/// Constraints deciding whether a signal occurrence is delivered.
/// Unset fields are wildcards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub member: Option<String>,
    pub interface: Option<String>,
    /// Matched against both the sender bus name and the object path.
    pub sender: Option<Proxy>,
    /// Destination bus name.
    pub destination: Option<String>,
    pub filters: ArgFilters,
}

impl MatchRule {
    /// True if every constraint `other` sets is set identically here and
    /// `other`'s filters are a subset of ours.
    pub fn is_at_least_as_specific_as(&self, other: &MatchRule) -> bool {
        fn covers<T: PartialEq>(mine: &Option<T>, theirs: &Option<T>) -> bool {
            match theirs {
                None => true,
                Some(t) => mine.as_ref() == Some(t),
            }
        }

        covers(&self.member, &other.member)
            && covers(&self.interface, &other.interface)
            && covers(&self.sender, &other.sender)
            && covers(&self.destination, &other.destination)
            && other
                .filters
                .iter()
                .all(|(index, expected)| self.filters.get(index) == Some(expected))
    }

    /// Header part of the match: member, interface, sender and destination.
    /// `senders` holds every bus name the emitter is known by: its unique
    /// name plus any well-known names it owns.
    pub fn matches_header(
        &self,
        interface: &str,
        member: &str,
        senders: &[&str],
        path: &str,
        destination: Option<&str>,
    ) -> bool {
        if self.member.as_deref().is_some_and(|m| m != member) {
            return false;
        }
        if self.interface.as_deref().is_some_and(|i| i != interface) {
            return false;
        }
        if let Some(proxy) = &self.sender {
            if !senders.contains(&proxy.bus_name.as_str()) || proxy.path != path {
                return false;
            }
        }
        if let Some(expected) = &self.destination {
            if destination != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }

    /// Every filter needs a string argument equal to the expected value.
    pub fn matches_args(&self, args: &[Value]) -> bool {
        self.filters.iter().all(|(index, expected)| {
            args.get(*index as usize)
                .and_then(Value::as_str)
                .is_some_and(|actual| actual == expected)
        })
    }
}

impl fmt::Display for MatchRule {
    /// Rendered like a D-Bus match rule string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type='signal'")?;
        if let Some(sender) = &self.sender {
            write!(f, ",sender='{}',path='{}'", sender.bus_name, sender.path)?;
        }
        if let Some(interface) = &self.interface {
            write!(f, ",interface='{}'", interface)?;
        }
        if let Some(member) = &self.member {
            write!(f, ",member='{}'", member)?;
        }
        if let Some(destination) = &self.destination {
            write!(f, ",destination='{}'", destination)?;
        }
        for (index, value) in &self.filters {
            write!(f, ",arg{}='{}'", index, value)?;
        }
        Ok(())
    }
}

/// How a rule names its signal before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// A notification name, resolved through the name mapper.
    Name(String),
    /// Structural selection; either part may be a wildcard.
    Signal {
        member: Option<String>,
        interface: Option<String>,
    },
}

/// An unresolved match rule as supplied by callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSpec {
    pub selector: Selector,
    pub sender: Option<Proxy>,
    /// Only the destination's bus name takes part in matching.
    pub destination: Option<Proxy>,
    /// Filters keyed by raw argument index; out-of-range keys are dropped
    /// when the rule is resolved.
    pub filters: BTreeMap<usize, String>,
}

impl RuleSpec {
    pub fn name(name: impl Into<String>) -> Self {
        Self::with_selector(Selector::Name(name.into()))
    }

    pub fn signal(member: Option<&str>, interface: Option<&str>) -> Self {
        Self::with_selector(Selector::Signal {
            member: member.map(str::to_string),
            interface: interface.map(str::to_string),
        })
    }

    fn with_selector(selector: Selector) -> Self {
        Self {
            selector,
            sender: None,
            destination: None,
            filters: BTreeMap::new(),
        }
    }

    pub fn sender(mut self, sender: Option<&Proxy>) -> Self {
        self.sender = sender.cloned();
        self
    }

    pub fn destination(mut self, destination: Option<&Proxy>) -> Self {
        self.destination = destination.cloned();
        self
    }

    pub fn filter(mut self, index: usize, value: impl Into<String>) -> Self {
        self.filters.insert(index, value.into());
        self
    }

    pub fn filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = (usize, S)>,
        S: Into<String>,
    {
        self.filters
            .extend(filters.into_iter().map(|(index, value)| (index, value.into())));
        self
    }

    /// Filters given as (value, index) pairs, the order of the old
    /// variadic filter list.
    pub fn filter_list(self, pairs: &[(&str, usize)]) -> Self {
        self.filters(pairs.iter().map(|(value, index)| (*index, *value)))
    }
}
