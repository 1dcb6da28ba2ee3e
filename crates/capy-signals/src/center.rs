//! Notification center: the public face of the registry.
//!
//! All shared state sits behind one mutex that is never held while a
//! callback runs or across an await, so callbacks may freely call back into
//! the center. Bus requests run as tasks on the runtime handed to `new` and
//! apply their result under the same lock.

use crate::bus::{SignalBus, SignalEmission};
use crate::catalog::SignalCatalog;
use crate::dispatch::{NameOwners, SignalOccurrence, build_notification, matching_registrations};
use crate::error::SignalError;
use crate::names::NameMapper;
use crate::post::{PostTarget, declared_signal, fill_arguments};
use crate::registry::{AddOutcome, BusRequest, Confirmation, Registration, Registry};
use crate::rule::{ArgFilters, MAX_FILTER_INDEX, MatchRule, RuleSpec, Selector};
use crate::types::{Notification, ObserverId, Proxy, SignalKey, SignalMetadata, UserInfo};
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;

#[derive(Default)]
struct CenterState {
    catalog: SignalCatalog,
    names: NameMapper,
    owners: NameOwners,
    registry: Registry,
}

struct Shared {
    bus: Arc<dyn SignalBus>,
    runtime: Handle,
    state: Mutex<CenterState>,
}

/// Routes bus signals to local observers and local notifications to the bus.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct NotificationCenter {
    shared: Arc<Shared>,
}

impl NotificationCenter {
    /// Create a center on `bus`. Bus registration requests are spawned on
    /// `runtime`.
    pub fn new(bus: Arc<dyn SignalBus>, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                runtime,
                state: Mutex::new(CenterState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CenterState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ============ Catalog and names ============

    /// Record introspected signal metadata. Returns false if the signal was
    /// already known.
    pub fn record_signal(&self, metadata: SignalMetadata) -> bool {
        self.state().catalog.record(metadata)
    }

    /// Deliver `interface.signal` under `name`. Fails without side effects if
    /// either side is already mapped differently.
    pub fn register_notification_name(
        &self,
        name: &str,
        signal: &str,
        interface: &str,
    ) -> Result<(), SignalError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state
            .names
            .register_name(name, signal, interface, &state.catalog)
    }

    pub fn resolve_name(&self, name: &str) -> Result<SignalKey, SignalError> {
        let state = self.state();
        state.names.resolve(name, &state.catalog)
    }

    pub fn name_for(&self, interface: &str, member: &str) -> String {
        let state = self.state();
        state.names.name_for(interface, member, &state.catalog)
    }

    // ============ Observing ============

    /// Register `callback` for signals matching `spec`.
    ///
    /// Returns once the bus has confirmed the match rule. Concurrent adds
    /// for an identical rule share one bus request and all see its outcome.
    pub async fn add<F>(
        &self,
        observer: ObserverId,
        spec: &RuleSpec,
        callback: F,
    ) -> Result<(), SignalError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        if let Some(sender) = &spec.sender {
            if !sender.bus_name.starts_with(':') {
                self.refresh_owner(&sender.bus_name).await;
            }
        }

        let registration = Registration::new(observer, Arc::new(callback));
        let outcome = {
            let mut state = self.state();
            let rule = resolve_rule(&state, spec)?;
            state.registry.add(rule, registration)
        };

        match outcome {
            AddOutcome::Active => Ok(()),
            AddOutcome::Wait(rx, request) => {
                if let Some(request) = request {
                    self.issue(request);
                }
                wait_for_confirmation(rx).await
            }
        }
    }

    /// Observe notifications named `name`, optionally only from `sender`.
    pub async fn add_observer<F>(
        &self,
        observer: ObserverId,
        name: &str,
        sender: Option<&Proxy>,
        callback: F,
    ) -> Result<(), SignalError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.add_observer_with_destination(observer, name, sender, None, callback)
            .await
    }

    pub async fn add_observer_with_destination<F>(
        &self,
        observer: ObserverId,
        name: &str,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        callback: F,
    ) -> Result<(), SignalError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let spec = RuleSpec::name(name)
            .sender(sender)
            .destination(destination);
        self.add(observer, &spec, callback).await
    }

    /// Structural observation; `None` fields are wildcards, so e.g. a whole
    /// interface can be observed.
    pub async fn add_signal_observer<F>(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        callback: F,
    ) -> Result<(), SignalError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination);
        self.add(observer, &spec, callback).await
    }

    /// Like `add_signal_observer`, matching only when the string argument at
    /// `index` (< 64) equals `filter`.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_signal_observer_with_filter<F>(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        filter: &str,
        index: usize,
        callback: F,
    ) -> Result<(), SignalError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination)
            .filter(index, filter);
        self.add(observer, &spec, callback).await
    }

    /// Filters keyed by argument index. Keys that cannot address an
    /// argument of the signal are ignored.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_signal_observer_with_filters<F>(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        filters: &BTreeMap<usize, String>,
        callback: F,
    ) -> Result<(), SignalError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination)
            .filters(filters.iter().map(|(i, v)| (*i, v.as_str())));
        self.add(observer, &spec, callback).await
    }

    #[deprecated(note = "use add_signal_observer_with_filters")]
    #[allow(clippy::too_many_arguments)]
    pub async fn add_signal_observer_with_filter_list<F>(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        filters_and_indices: &[(&str, usize)],
        callback: F,
    ) -> Result<(), SignalError>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination)
            .filter_list(filters_and_indices);
        self.add(observer, &spec, callback).await
    }

    /// Remove every registration of `observer`.
    pub fn remove_observer(&self, observer: ObserverId) {
        let requests = self.state().registry.remove(observer, |_| true);
        self.issue_all(requests);
    }

    /// Remove registrations of `observer` whose rule is at least as specific
    /// as `spec`. A name that does not resolve matches nothing.
    pub fn remove_matching(&self, observer: ObserverId, spec: &RuleSpec) {
        let requests = {
            let mut state = self.state();
            let rule = match resolve_rule(&state, spec) {
                Ok(rule) => rule,
                Err(e) => {
                    debug!("Nothing to remove for {}: {}", observer, e);
                    return;
                }
            };
            state
                .registry
                .remove(observer, |candidate| candidate.is_at_least_as_specific_as(&rule))
        };
        self.issue_all(requests);
    }

    pub fn remove_observer_name(
        &self,
        observer: ObserverId,
        name: &str,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
    ) {
        let spec = RuleSpec::name(name)
            .sender(sender)
            .destination(destination);
        self.remove_matching(observer, &spec);
    }

    pub fn remove_signal_observer(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
    ) {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination);
        self.remove_matching(observer, &spec);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn remove_signal_observer_with_filter(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        filter: &str,
        index: usize,
    ) {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination)
            .filter(index, filter);
        self.remove_matching(observer, &spec);
    }

    pub fn remove_signal_observer_with_filters(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        filters: &BTreeMap<usize, String>,
    ) {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination)
            .filters(filters.iter().map(|(i, v)| (*i, v.as_str())));
        self.remove_matching(observer, &spec);
    }

    #[deprecated(note = "use remove_signal_observer_with_filters")]
    pub fn remove_signal_observer_with_filter_list(
        &self,
        observer: ObserverId,
        signal: Option<&str>,
        interface: Option<&str>,
        sender: Option<&Proxy>,
        destination: Option<&Proxy>,
        filters_and_indices: &[(&str, usize)],
    ) {
        let spec = RuleSpec::signal(signal, interface)
            .sender(sender)
            .destination(destination)
            .filter_list(filters_and_indices);
        self.remove_matching(observer, &spec);
    }

    // ============ Dispatch ============

    /// Deliver an incoming signal to every matching observer. Returns the
    /// number of callbacks that completed.
    pub fn dispatch(&self, occurrence: &SignalOccurrence) -> usize {
        let (notification, registrations) = {
            let mut state = self.state();
            state.owners.observe(occurrence);
            let registrations = matching_registrations(&state.registry, occurrence, &state.owners);
            if registrations.is_empty() {
                return 0;
            }
            let notification = build_notification(occurrence, &state.names, &state.catalog);
            (notification, registrations)
        };

        debug!(
            "Dispatching '{}' to {} registration(s)",
            notification.name,
            registrations.len()
        );

        let mut delivered = 0;
        for registration in registrations {
            // Removed by an earlier callback of this delivery
            if !registration.is_live() {
                continue;
            }
            let callback = &registration.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&notification))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    "Callback of {} panicked while handling '{}'",
                    registration.observer, notification.name
                ),
            }
        }
        delivered
    }

    // ============ Posting ============

    /// Emit a local notification as a bus signal from the exported object at
    /// `sender`.
    pub async fn post(
        &self,
        target: &PostTarget,
        sender: &str,
        info: &UserInfo,
    ) -> Result<(), SignalError> {
        if !self.shared.bus.is_exported(sender) {
            return Err(SignalError::ObjectNotExported(sender.to_string()));
        }

        let emission = {
            let state = self.state();
            let key = target.resolve(&state.names, &state.catalog)?;
            let signal = declared_signal(&state.catalog, &key)?;
            let args = fill_arguments(signal, info)?;
            SignalEmission {
                interface: key.interface,
                member: key.member,
                path: sender.to_string(),
                args,
            }
        };

        debug!(
            "Posting {}.{} from {}",
            emission.interface, emission.member, emission.path
        );
        self.shared.bus.emit(emission).await?;
        Ok(())
    }

    /// Post using the notification's name, object path and user info.
    pub async fn post_notification(&self, notification: &Notification) -> Result<(), SignalError> {
        let target = PostTarget::Name(notification.name.clone());
        self.post(&target, &notification.object.path, &notification.user_info)
            .await
    }

    pub async fn post_notification_name(
        &self,
        name: &str,
        sender: &str,
        info: Option<&UserInfo>,
    ) -> Result<(), SignalError> {
        let empty = UserInfo::new();
        let target = PostTarget::Name(name.to_string());
        self.post(&target, sender, info.unwrap_or(&empty)).await
    }

    pub async fn post_signal_name(
        &self,
        signal: &str,
        interface: &str,
        sender: &str,
        info: Option<&UserInfo>,
    ) -> Result<(), SignalError> {
        let empty = UserInfo::new();
        let target = PostTarget::Signal {
            member: signal.to_string(),
            interface: interface.to_string(),
        };
        self.post(&target, sender, info.unwrap_or(&empty)).await
    }

    // ============ Bookkeeping ============

    /// Ask the bus who currently owns the well-known `name`.
    async fn refresh_owner(&self, name: &str) {
        match self.shared.bus.name_owner(name).await {
            Ok(owner) => {
                self.state().owners.set(name, owner.as_deref());
            }
            Err(e) => warn!("Could not look up the owner of {}: {}", name, e),
        }
    }

    /// Observables waiting for the bus to confirm an add or remove.
    pub fn queue_count(&self) -> usize {
        self.state().registry.queue_count()
    }

    pub fn observable_count(&self) -> usize {
        self.state().registry.len()
    }

    /// Registrations across all observables, whatever their state.
    pub fn registration_count(&self) -> usize {
        self.state().registry.registration_count()
    }

    fn issue_all(&self, requests: Vec<BusRequest>) {
        for request in requests {
            self.issue(request);
        }
    }

    /// Send a registry request to the bus and feed the answer back.
    fn issue(&self, request: BusRequest) {
        let center = self.clone();
        match request {
            BusRequest::AddMatch(id, rule) => {
                debug!("AddMatch {}", rule);
                let answer = self.shared.bus.add_match(&rule);
                self.shared.runtime.spawn(async move {
                    let result = answer.await.map_err(|e| e.to_string());
                    let follow_up = center.state().registry.complete_add(id, result);
                    if let Some(next) = follow_up {
                        center.issue(next);
                    }
                });
            }
            BusRequest::RemoveMatch(id, rule) => {
                debug!("RemoveMatch {}", rule);
                let answer = self.shared.bus.remove_match(&rule);
                self.shared.runtime.spawn(async move {
                    let result = answer.await.map_err(|e| e.to_string());
                    let follow_up = center.state().registry.complete_remove(id, result);
                    if let Some(next) = follow_up {
                        center.issue(next);
                    }
                });
            }
        }
    }
}

/// Turn a caller's rule into a registry rule: resolve names and drop
/// filters that cannot address an argument.
fn resolve_rule(state: &CenterState, spec: &RuleSpec) -> Result<MatchRule, SignalError> {
    let (member, interface) = match &spec.selector {
        Selector::Name(name) => {
            let key = state.names.resolve(name, &state.catalog)?;
            (Some(key.member), Some(key.interface))
        }
        Selector::Signal { member, interface } => (member.clone(), interface.clone()),
    };

    let declared_args = match (&member, &interface) {
        (Some(m), Some(i)) => state.catalog.get(i, m).map(|s| s.args.len()),
        _ => None,
    };

    let mut filters = ArgFilters::new();
    for (index, value) in &spec.filters {
        let out_of_range = *index >= MAX_FILTER_INDEX || declared_args.is_some_and(|n| *index >= n);
        if out_of_range {
            warn!("Ignoring filter on argument {} ('{}')", index, value);
            continue;
        }
        filters.insert(*index as u8, value.clone());
    }

    Ok(MatchRule {
        member,
        interface,
        sender: spec.sender.clone(),
        destination: spec.destination.as_ref().map(|d| d.bus_name.clone()),
        filters,
    })
}

async fn wait_for_confirmation(mut rx: watch::Receiver<Confirmation>) -> Result<(), SignalError> {
    let outcome = match rx.wait_for(|c| *c != Confirmation::Waiting).await {
        Ok(confirmation) => confirmation.clone(),
        // Sender gone: the observable was torn down
        Err(_) => Confirmation::Withdrawn,
    };

    match outcome {
        Confirmation::Failed(reason) => Err(SignalError::BusRegistrationFailed(reason)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::types::{ArgumentInfo, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const IFACE: &str = "org.example.Thing";
    const PATH: &str = "/org/example/thing";

    fn center(bus: &Arc<MockBus>) -> NotificationCenter {
        NotificationCenter::new(bus.clone(), Handle::current())
    }

    fn changed(args: Vec<Value>) -> SignalOccurrence {
        SignalOccurrence::new(IFACE, "Changed", ":1.7", PATH).with_args(args)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Notification) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        (hits, move |_: &Notification| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn eventually<F: FnMut() -> bool>(mut check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_identical_rules_share_one_bus_registration() {
        let bus = MockBus::new();
        let center = center(&bus);
        let a = ObserverId::next();
        let b = ObserverId::next();
        let (a_hits, a_cb) = counter();
        let (b_hits, b_cb) = counter();

        center
            .add_signal_observer(a, Some("Changed"), Some(IFACE), None, None, a_cb)
            .await
            .unwrap();
        center
            .add_signal_observer(b, Some("Changed"), Some(IFACE), None, None, b_cb)
            .await
            .unwrap();

        assert_eq!(bus.add_calls(), 1);
        assert_eq!(center.observable_count(), 1);

        center.remove_observer(a);
        assert_eq!(center.dispatch(&changed(vec![])), 1);
        assert_eq!(a_hits.load(Ordering::SeqCst), 0);
        assert_eq!(b_hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.remove_calls(), 0);
    }

    #[tokio::test]
    async fn test_broad_removal_cascades_to_narrow_rules() {
        let bus = MockBus::new();
        let center = center(&bus);
        let observer = ObserverId::next();

        center
            .add_signal_observer(observer, Some("Changed"), Some(IFACE), None, None, |_| {})
            .await
            .unwrap();
        center
            .add_signal_observer(observer, None, Some(IFACE), None, None, |_| {})
            .await
            .unwrap();
        assert_eq!(center.observable_count(), 2);

        // Narrow removal leaves the broad rule alone
        center.remove_signal_observer(observer, Some("Changed"), Some(IFACE), None, None);
        eventually(|| center.observable_count() == 1).await;
        assert_eq!(center.dispatch(&changed(vec![])), 1);

        center
            .add_signal_observer(observer, Some("Changed"), Some(IFACE), None, None, |_| {})
            .await
            .unwrap();
        center.remove_signal_observer(observer, None, Some(IFACE), None, None);
        eventually(|| center.observable_count() == 0).await;
        assert_eq!(center.queue_count(), 0);
        assert_eq!(center.dispatch(&changed(vec![])), 0);
    }

    #[tokio::test]
    async fn test_removal_is_per_observer() {
        let bus = MockBus::new();
        let center = center(&bus);
        let a = ObserverId::next();
        let b = ObserverId::next();
        let (b_hits, b_cb) = counter();

        center
            .add_signal_observer(a, None, Some(IFACE), None, None, |_| {})
            .await
            .unwrap();
        center
            .add_signal_observer(b, Some("Changed"), Some(IFACE), None, None, b_cb)
            .await
            .unwrap();

        center.remove_signal_observer(a, None, Some(IFACE), None, None);
        eventually(|| center.observable_count() == 1).await;
        center.dispatch(&changed(vec![]));
        assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_name_based_observation() {
        let bus = MockBus::new();
        let center = center(&bus);
        let observer = ObserverId::next();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        center
            .register_notification_name("ThingChanged", "Changed", IFACE)
            .unwrap();
        center
            .add_observer(observer, "ThingChanged", None, move |n| {
                sink.lock().unwrap().push(n.clone());
            })
            .await
            .unwrap();

        center.dispatch(&changed(vec![Value::from("foo")]));
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].name, "ThingChanged");
        assert_eq!(received[0].user_info.get("arg0"), Some(&Value::from("foo")));
        assert_eq!(received[0].object, Proxy::new(":1.7", PATH));
    }

    #[tokio::test]
    async fn test_unknown_name_add_fails_and_remove_is_noop() {
        let bus = MockBus::new();
        let center = center(&bus);
        let observer = ObserverId::next();

        let err = center
            .add_observer(observer, "NoSuchName", None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::UnresolvableName(_)));

        center.remove_observer_name(observer, "NoSuchName", None, None);
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_name_registration_no_clobber() {
        let bus = MockBus::new();
        let center = center(&bus);

        center.register_notification_name("X", "Sig", "iface.a").unwrap();
        assert!(matches!(
            center.register_notification_name("X", "Other", "iface.a"),
            Err(SignalError::DuplicateMapping { .. })
        ));
        assert_eq!(
            center.resolve_name("X").unwrap(),
            SignalKey::new("iface.a", "Sig")
        );
    }

    #[tokio::test]
    async fn test_string_filter_dispatch() {
        let bus = MockBus::new();
        let center = center(&bus);
        let (hits, cb) = counter();

        center
            .add_signal_observer_with_filter(
                ObserverId::next(),
                Some("Changed"),
                Some(IFACE),
                None,
                None,
                "foo",
                0,
                cb,
            )
            .await
            .unwrap();

        center.dispatch(&changed(vec![Value::from("foo")]));
        center.dispatch(&changed(vec![Value::from("bar")]));
        center.dispatch(&changed(vec![Value::Int32(0)]));
        center.dispatch(&changed(vec![]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_filtered_rules_remove_by_filter() {
        let bus = MockBus::new();
        let center = center(&bus);
        let observer = ObserverId::next();

        center
            .add_signal_observer_with_filter_list(
                observer,
                Some("Changed"),
                Some(IFACE),
                None,
                None,
                &[("foo", 0)],
                |_| {},
            )
            .await
            .unwrap();
        center
            .add_signal_observer(observer, Some("Changed"), Some(IFACE), None, None, |_| {})
            .await
            .unwrap();
        assert_eq!(center.observable_count(), 2);

        // Unfiltered rule is broader than the filter, so it stays
        center.remove_signal_observer_with_filter(
            observer,
            Some("Changed"),
            Some(IFACE),
            None,
            None,
            "foo",
            0,
        );
        eventually(|| center.observable_count() == 1).await;
        assert_eq!(center.dispatch(&changed(vec![Value::from("bar")])), 1);
    }

    #[tokio::test]
    async fn test_filters_beyond_declared_arguments_are_ignored() {
        let bus = MockBus::new();
        let center = center(&bus);
        center.record_signal(
            SignalMetadata::new(IFACE, "Changed").with_arg(ArgumentInfo::new("s")),
        );

        let mut filters = BTreeMap::new();
        filters.insert(0, "foo".to_string());
        filters.insert(3, "never".to_string());
        filters.insert(70, "never".to_string());
        center
            .add_signal_observer_with_filters(
                ObserverId::next(),
                Some("Changed"),
                Some(IFACE),
                None,
                None,
                &filters,
                |_| {},
            )
            .await
            .unwrap();

        match &bus.calls()[0] {
            crate::bus::mock::BusCall::AddMatch(rule) => {
                assert_eq!(rule.filters.len(), 1);
                assert_eq!(rule.filters.get(&0).map(String::as_str), Some("foo"));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_registration_reaches_every_adder() {
        let bus = MockBus::new();
        bus.hold(true);
        let center = center(&bus);

        let first = {
            let center = center.clone();
            tokio::spawn(async move {
                let observer = ObserverId::next();
                center
                    .add_signal_observer(observer, Some("Changed"), Some(IFACE), None, None, |_| {})
                    .await
            })
        };
        let second = {
            let center = center.clone();
            tokio::spawn(async move {
                let observer = ObserverId::next();
                center
                    .add_signal_observer(observer, Some("Changed"), Some(IFACE), None, None, |_| {})
                    .await
            })
        };

        eventually(|| center.registration_count() == 2).await;
        assert_eq!(bus.held_count(), 1);
        bus.release_all(Err("access denied"));

        for handle in [first, second] {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(SignalError::BusRegistrationFailed(_))));
        }
        assert_eq!(center.observable_count(), 0);
        assert_eq!(center.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_add_leaves_nothing_behind() {
        let bus = MockBus::new();
        bus.reject_adds("no such interface");
        let center = center(&bus);

        let err = center
            .add_signal_observer(ObserverId::next(), None, Some(IFACE), None, None, |_| {})
            .await
            .unwrap_err();
        match err {
            SignalError::BusRegistrationFailed(reason) => {
                assert!(reason.contains("no such interface"))
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(center.observable_count(), 0);
        assert_eq!(center.dispatch(&changed(vec![])), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_adds_coalesce() {
        let bus = MockBus::new();
        bus.hold(true);
        let center = center(&bus);
        let (hits, cb) = counter();
        let cb = Arc::new(cb);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let center = center.clone();
                let cb = cb.clone();
                tokio::spawn(async move {
                    let observer = ObserverId::next();
                    let callback = move |n: &Notification| cb(n);
                    let spec = RuleSpec::signal(Some("Changed"), Some(IFACE));
                    center.add(observer, &spec, callback).await
                })
            })
            .collect();

        eventually(|| center.registration_count() == 2).await;
        assert_eq!(bus.add_calls(), 1);
        assert_eq!(center.observable_count(), 1);
        assert_eq!(center.queue_count(), 1);

        bus.release_all(Ok(()));
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(center.queue_count(), 0);
        assert_eq!(center.dispatch(&changed(vec![])), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.add_calls(), 1);
    }

    #[tokio::test]
    async fn test_remove_while_pending_is_cleaned_up() {
        let bus = MockBus::new();
        bus.hold(true);
        let center = center(&bus);
        let observer = ObserverId::next();

        let add = {
            let center = center.clone();
            tokio::spawn(async move {
                center
                    .add_signal_observer(observer, Some("Changed"), Some(IFACE), None, None, |_| {})
                    .await
            })
        };
        eventually(|| bus.held_count() == 1).await;

        center.remove_observer(observer);
        assert_eq!(center.observable_count(), 1);

        bus.hold(false);
        bus.release_all(Ok(()));
        add.await.unwrap().unwrap();

        eventually(|| center.observable_count() == 0).await;
        assert_eq!(center.queue_count(), 0);
        assert_eq!(bus.remove_calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_delivery() {
        let bus = MockBus::new();
        let center = center(&bus);
        let (hits, cb) = counter();

        center
            .add_signal_observer(ObserverId::next(), None, Some(IFACE), None, None, |_| {
                panic!("observer bug");
            })
            .await
            .unwrap();
        center
            .add_signal_observer(ObserverId::next(), None, Some(IFACE), None, None, cb)
            .await
            .unwrap();

        assert_eq!(center.dispatch(&changed(vec![])), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(center.observable_count(), 1);
    }

    #[tokio::test]
    async fn test_callback_may_remove_observers_reentrantly() {
        let bus = MockBus::new();
        let center = center(&bus);
        let first = ObserverId::next();
        let second = ObserverId::next();
        let (hits, cb) = counter();

        let handle = center.clone();
        center
            .add_signal_observer(first, None, Some(IFACE), None, None, move |_| {
                handle.remove_observer(first);
                handle.remove_observer(second);
            })
            .await
            .unwrap();
        center
            .add_signal_observer(second, None, Some(IFACE), None, None, cb)
            .await
            .unwrap();

        assert_eq!(center.dispatch(&changed(vec![])), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        eventually(|| center.observable_count() == 0).await;
    }

    #[tokio::test]
    async fn test_callback_may_add_and_post_from_spawned_task() {
        let bus = MockBus::new();
        bus.export(PATH);
        let center = center(&bus);
        center.record_signal(SignalMetadata::new(IFACE, "Changed"));
        let first = ObserverId::next();
        let late = ObserverId::next();
        let (hits, hit_cb) = counter();
        let hit_cb = Arc::new(hit_cb);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));

        let handle = center.clone();
        center
            .add_signal_observer(first, Some("Changed"), Some(IFACE), None, None, move |_| {
                let Some(done) = done_tx.lock().unwrap().take() else {
                    return;
                };
                let center = handle.clone();
                let hit_cb = hit_cb.clone();
                Handle::current().spawn(async move {
                    let added = center
                        .add_signal_observer(late, None, Some(IFACE), None, None, move |n| {
                            hit_cb(n)
                        })
                        .await;
                    let posted = center.post_signal_name("Changed", IFACE, PATH, None).await;
                    let _ = done.send(added.and(posted));
                });
            })
            .await
            .unwrap();

        assert_eq!(center.dispatch(&changed(vec![])), 1);
        let result = tokio::time::timeout(Duration::from_secs(2), done_rx)
            .await
            .expect("spawned add and post finished")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(bus.emitted().len(), 1);
        assert_eq!(center.observable_count(), 2);

        assert_eq!(center.dispatch(&changed(vec![])), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_well_known_sender_follows_owner_changes() {
        let bus = MockBus::new();
        bus.set_owner("org.example.Service", ":1.42");
        let center = center(&bus);
        let observer = ObserverId::next();
        let (hits, cb) = counter();
        let service = Proxy::new("org.example.Service", PATH);

        center
            .add_signal_observer(observer, Some("Changed"), Some(IFACE), Some(&service), None, cb)
            .await
            .unwrap();

        let from = |sender: &str| SignalOccurrence::new(IFACE, "Changed", sender, PATH);
        assert_eq!(center.dispatch(&from(":1.42")), 1);
        assert_eq!(center.dispatch(&from(":1.7")), 0);

        let handover = SignalOccurrence::new(
            "org.freedesktop.DBus",
            "NameOwnerChanged",
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
        )
        .with_args(vec![
            Value::from("org.example.Service"),
            Value::from(":1.42"),
            Value::from(":1.50"),
        ]);
        center.dispatch(&handover);

        assert_eq!(center.dispatch(&from(":1.50")), 1);
        assert_eq!(center.dispatch(&from(":1.42")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_post_fills_missing_numeric_argument() {
        let bus = MockBus::new();
        bus.export(PATH);
        let center = center(&bus);
        center.record_signal(
            SignalMetadata::new(IFACE, "Changed")
                .with_arg(ArgumentInfo::new("s").with_key("name"))
                .with_arg(ArgumentInfo::new("u")),
        );

        let mut info = UserInfo::new();
        info.insert("name".into(), Value::from("foo"));
        center
            .post_notification_name("Signal_org.example.Thing_Changed", PATH, Some(&info))
            .await
            .unwrap();

        let emitted = bus.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].path, PATH);
        assert_eq!(emitted[0].member, "Changed");
        assert_eq!(emitted[0].args, vec![Value::from("foo"), Value::UInt32(0)]);
    }

    #[tokio::test]
    async fn test_post_missing_composite_emits_nothing() {
        let bus = MockBus::new();
        bus.export(PATH);
        let center = center(&bus);
        center.record_signal(
            SignalMetadata::new(IFACE, "Changed").with_arg(ArgumentInfo::new("a{sv}")),
        );

        let err = center
            .post_signal_name("Changed", IFACE, PATH, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::MissingRequiredArgument { index: 0, .. }));
        assert!(bus.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_post_preconditions() {
        let bus = MockBus::new();
        let center = center(&bus);
        center.record_signal(SignalMetadata::new(IFACE, "Changed"));

        let err = center
            .post_signal_name("Changed", IFACE, PATH, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::ObjectNotExported(_)));

        bus.export(PATH);
        let err = center
            .post_notification_name("NoSuchName", PATH, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::UnresolvableName(_)));

        let err = center
            .post_signal_name("Unknown", IFACE, PATH, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::UnknownSignal { .. }));

        let notification = Notification {
            name: "Signal_org.example.Thing_Changed".into(),
            object: Proxy::new(":1.1", PATH),
            user_info: UserInfo::new(),
        };
        center.post_notification(&notification).await.unwrap();
        assert_eq!(bus.emitted().len(), 1);
    }
}
