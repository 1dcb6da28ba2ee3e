//! The bus collaborator.
//!
//! The notification center never touches the wire. Whatever carries the
//! signals implements `SignalBus`; see the `dbus` module for the zbus one.

use crate::error::BusError;
use crate::rule::MatchRule;
use crate::types::Value;
use futures_util::future::BoxFuture;

/// A fully resolved signal ready to be sent.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalEmission {
    pub interface: String,
    pub member: String,
    /// Object path of the exported sender
    pub path: String,
    pub args: Vec<Value>,
}

/// Trait every bus backend must implement.
pub trait SignalBus: Send + Sync + 'static {
    /// Ask the bus to start routing signals matching `rule` to us.
    fn add_match(&self, rule: &MatchRule) -> BoxFuture<'static, Result<(), BusError>>;

    /// Undo a previous `add_match` for an identical rule.
    fn remove_match(&self, rule: &MatchRule) -> BoxFuture<'static, Result<(), BusError>>;

    /// Current unique owner of a bus name, `None` if nobody owns it.
    fn name_owner(&self, bus_name: &str) -> BoxFuture<'static, Result<Option<String>, BusError>>;

    /// Whether a local object is exported at `path`.
    fn is_exported(&self, path: &str) -> bool;

    fn emit(&self, emission: SignalEmission) -> BoxFuture<'static, Result<(), BusError>>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use futures_util::FutureExt;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[derive(Clone, Debug, PartialEq)]
    pub enum BusCall {
        AddMatch(MatchRule),
        RemoveMatch(MatchRule),
    }

    type Answer = oneshot::Sender<Result<(), BusError>>;

    /// In-memory bus. Answers immediately unless held, in which case
    /// requests wait until `release_all`.
    #[derive(Default)]
    pub struct MockBus {
        calls: Mutex<Vec<BusCall>>,
        hold: AtomicBool,
        reject_adds: Mutex<Option<String>>,
        held: Mutex<Vec<Answer>>,
        exported: Mutex<HashSet<String>>,
        owners: Mutex<HashMap<String, String>>,
        emitted: Mutex<Vec<SignalEmission>>,
    }

    impl MockBus {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn hold(&self, on: bool) {
            self.hold.store(on, Ordering::SeqCst);
        }

        pub fn reject_adds(&self, reason: &str) {
            *self.reject_adds.lock().unwrap() = Some(reason.to_string());
        }

        pub fn export(&self, path: &str) {
            self.exported.lock().unwrap().insert(path.to_string());
        }

        pub fn set_owner(&self, name: &str, owner: &str) {
            self.owners
                .lock()
                .unwrap()
                .insert(name.to_string(), owner.to_string());
        }

        pub fn calls(&self) -> Vec<BusCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn add_calls(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, BusCall::AddMatch(_)))
                .count()
        }

        pub fn remove_calls(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, BusCall::RemoveMatch(_)))
                .count()
        }

        pub fn held_count(&self) -> usize {
            self.held.lock().unwrap().len()
        }

        /// Answer every held request.
        pub fn release_all(&self, result: Result<(), &str>) {
            let held: Vec<Answer> = self.held.lock().unwrap().drain(..).collect();
            for answer in held {
                let _ = answer.send(result.map_err(|r| BusError::Rejected(r.to_string())));
            }
        }

        pub fn emitted(&self) -> Vec<SignalEmission> {
            self.emitted.lock().unwrap().clone()
        }

        fn answer(&self, rejection: Option<String>) -> BoxFuture<'static, Result<(), BusError>> {
            if let Some(reason) = rejection {
                return futures_util::future::ready(Err(BusError::Rejected(reason))).boxed();
            }
            if !self.hold.load(Ordering::SeqCst) {
                return futures_util::future::ready(Ok(())).boxed();
            }

            let (tx, rx) = oneshot::channel();
            self.held.lock().unwrap().push(tx);
            async move {
                rx.await
                    .unwrap_or_else(|_| Err(BusError::Rejected("answer dropped".to_string())))
            }
            .boxed()
        }
    }

    impl SignalBus for MockBus {
        fn add_match(&self, rule: &MatchRule) -> BoxFuture<'static, Result<(), BusError>> {
            self.calls.lock().unwrap().push(BusCall::AddMatch(rule.clone()));
            let rejection = self.reject_adds.lock().unwrap().clone();
            self.answer(rejection)
        }

        fn remove_match(&self, rule: &MatchRule) -> BoxFuture<'static, Result<(), BusError>> {
            self.calls.lock().unwrap().push(BusCall::RemoveMatch(rule.clone()));
            self.answer(None)
        }

        fn name_owner(
            &self,
            bus_name: &str,
        ) -> BoxFuture<'static, Result<Option<String>, BusError>> {
            let owner = self.owners.lock().unwrap().get(bus_name).cloned();
            futures_util::future::ready(Ok(owner)).boxed()
        }

        fn is_exported(&self, path: &str) -> bool {
            self.exported.lock().unwrap().contains(path)
        }

        fn emit(&self, emission: SignalEmission) -> BoxFuture<'static, Result<(), BusError>> {
            self.emitted.lock().unwrap().push(emission);
            futures_util::future::ready(Ok(())).boxed()
        }
    }
}
