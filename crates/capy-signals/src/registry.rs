//! Observable registry.
//!
//! Each distinct match rule owns one `Observable`, shared by every
//! registration for that rule. Bus registration is two-phase:
//! - `Pending` until the bus confirms `AddMatch`
//! - `Active` while registrations exist
//! - `Removing` while `RemoveMatch` is in flight
//!
//! The registry never talks to the bus itself. Operations return the
//! `BusRequest`s the caller must issue, and the caller reports results back
//! through `complete_add` / `complete_remove`.

use crate::rule::MatchRule;
use crate::types::{Notification, ObserverId};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Callback invoked with each matching notification.
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Registry-local identifier of an observable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservableId(u64);

impl fmt::Display for ObservableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observable#{}", self.0)
    }
}

/// One (observer, callback) registration.
#[derive(Clone)]
pub struct Registration {
    pub observer: ObserverId,
    pub callback: Callback,
    live: Arc<AtomicBool>,
}

impl Registration {
    pub fn new(observer: ObserverId, callback: Callback) -> Self {
        Self {
            observer,
            callback,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// False once the registration was removed, even for snapshots taken
    /// before the removal.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("observer", &self.observer)
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservableState {
    Pending,
    Active,
    Removing,
}

/// Outcome of a bus registration as seen by waiting adders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Waiting,
    Confirmed,
    Failed(String),
    /// Torn down before it became active; every registration was removed.
    Withdrawn,
}

pub struct Observable {
    pub id: ObservableId,
    pub rule: MatchRule,
    pub registrations: Vec<Registration>,
    pub state: ObservableState,
    confirm: watch::Sender<Confirmation>,
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.id)
            .field("rule", &self.rule.to_string())
            .field("registrations", &self.registrations.len())
            .field("state", &self.state)
            .finish()
    }
}

/// Bus call the registry needs issued on its behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusRequest {
    AddMatch(ObservableId, MatchRule),
    RemoveMatch(ObservableId, MatchRule),
}

/// Result of `Registry::add`.
pub enum AddOutcome {
    /// Joined an observable that is already active.
    Active,
    /// Wait for confirmation; issue the request if one is returned.
    Wait(watch::Receiver<Confirmation>, Option<BusRequest>),
}

#[derive(Debug, Default)]
pub struct Registry {
    observables: BTreeMap<ObservableId, Observable>,
    next_id: u64,
    /// Observables with a bus request in flight.
    queue_count: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: MatchRule, registration: Registration) -> AddOutcome {
        if let Some(observable) = self.observables.values_mut().find(|o| o.rule == rule) {
            debug!(
                "{} joins {} ({:?})",
                registration.observer, observable.id, observable.state
            );
            observable.registrations.push(registration);

            return match observable.state {
                ObservableState::Active => AddOutcome::Active,
                ObservableState::Pending => AddOutcome::Wait(observable.confirm.subscribe(), None),
                ObservableState::Removing => {
                    // Re-added once the in-flight removal completes
                    observable.confirm.send_replace(Confirmation::Waiting);
                    AddOutcome::Wait(observable.confirm.subscribe(), None)
                }
            };
        }

        self.next_id += 1;
        let id = ObservableId(self.next_id);
        let (confirm, _rx) = watch::channel(Confirmation::Waiting);
        let rx = confirm.subscribe();

        debug!("{} created for {} by {}", id, rule, registration.observer);
        self.observables.insert(
            id,
            Observable {
                id,
                rule: rule.clone(),
                registrations: vec![registration],
                state: ObservableState::Pending,
                confirm,
            },
        );
        self.queue_count += 1;

        AddOutcome::Wait(rx, Some(BusRequest::AddMatch(id, rule)))
    }

    /// Drop every registration of `observer` on observables whose rule
    /// satisfies `selects`.
    pub fn remove<F>(&mut self, observer: ObserverId, selects: F) -> Vec<BusRequest>
    where
        F: Fn(&MatchRule) -> bool,
    {
        let mut requests = Vec::new();

        for observable in self.observables.values_mut().filter(|o| selects(&o.rule)) {
            let before = observable.registrations.len();
            observable.registrations.retain(|r| {
                if r.observer == observer {
                    r.retire();
                    false
                } else {
                    true
                }
            });

            if observable.registrations.len() == before {
                continue;
            }
            debug!(
                "Removed {} registration(s) of {} from {}",
                before - observable.registrations.len(),
                observer,
                observable.id
            );

            // Pending observables are torn down when their AddMatch completes
            if observable.registrations.is_empty() && observable.state == ObservableState::Active {
                observable.state = ObservableState::Removing;
                requests.push(BusRequest::RemoveMatch(observable.id, observable.rule.clone()));
            }
        }

        self.queue_count += requests.len();
        requests
    }

    /// Apply the bus answer to an `AddMatch`.
    pub fn complete_add(
        &mut self,
        id: ObservableId,
        result: Result<(), String>,
    ) -> Option<BusRequest> {
        let Some(observable) = self.observables.get_mut(&id) else {
            warn!("AddMatch completed for unknown {}", id);
            return None;
        };
        self.queue_count = self.queue_count.saturating_sub(1);

        match result {
            Ok(()) if observable.registrations.is_empty() => {
                debug!("{} confirmed with no registrations left, removing", id);
                observable.state = ObservableState::Removing;
                observable.confirm.send_replace(Confirmation::Withdrawn);
                self.queue_count += 1;
                Some(BusRequest::RemoveMatch(id, observable.rule.clone()))
            }
            Ok(()) => {
                debug!("{} active", id);
                observable.state = ObservableState::Active;
                observable.confirm.send_replace(Confirmation::Confirmed);
                None
            }
            Err(reason) => {
                warn!("AddMatch for {} failed: {}", observable.rule, reason);
                if let Some(observable) = self.observables.remove(&id) {
                    for registration in &observable.registrations {
                        registration.retire();
                    }
                    observable.confirm.send_replace(Confirmation::Failed(reason));
                }
                None
            }
        }
    }

    /// Apply the bus answer to a `RemoveMatch`.
    pub fn complete_remove(
        &mut self,
        id: ObservableId,
        result: Result<(), String>,
    ) -> Option<BusRequest> {
        let Some(observable) = self.observables.get_mut(&id) else {
            warn!("RemoveMatch completed for unknown {}", id);
            return None;
        };
        self.queue_count = self.queue_count.saturating_sub(1);

        if let Err(reason) = result {
            warn!("RemoveMatch for {} failed: {}", observable.rule, reason);
        }

        if observable.registrations.is_empty() {
            debug!("{} removed", id);
            if let Some(observable) = self.observables.remove(&id) {
                observable.confirm.send_replace(Confirmation::Withdrawn);
            }
            return None;
        }

        debug!("{} gained registrations while removing, re-adding", id);
        observable.state = ObservableState::Pending;
        self.queue_count += 1;
        Some(BusRequest::AddMatch(id, observable.rule.clone()))
    }

    /// Observables eligible for delivery, in registry order.
    pub fn active(&self) -> impl Iterator<Item = &Observable> {
        self.observables
            .values()
            .filter(|o| o.state == ObservableState::Active)
    }

    pub fn get(&self, id: ObservableId) -> Option<&Observable> {
        self.observables.get(&id)
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    pub fn len(&self) -> usize {
        self.observables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observables.is_empty()
    }

    /// Registrations across all observables, whatever their state.
    pub fn registration_count(&self) -> usize {
        self.observables.values().map(|o| o.registrations.len()).sum()
    }

    /// Count of observables in `Pending` or `Removing`; equals `queue_count`.
    pub fn in_flight(&self) -> usize {
        self.observables
            .values()
            .filter(|o| o.state != ObservableState::Active)
            .count()
    }
}
