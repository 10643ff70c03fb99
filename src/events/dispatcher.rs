use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::events::phase::TransactionPhase;
use crate::events::registry::{
    FailureObserver, ListenerError, ListenerFailure, LoggingObserver, SynchronizationRegistry,
};
use crate::transaction::TransactionContext;
use crate::transaction::context::{active_synchronizations, context_synchronizations};

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type Callback<E> = Box<dyn Fn(&E) -> Result<(), ListenerError> + Send + Sync>;

/// A callback bound to a transaction phase.
///
/// ```
/// use txscope::events::{Listener, TransactionPhase};
///
/// let listener = Listener::new("audit", |order: &u64| {
///     println!("order {} stored", order);
///     Ok(())
/// })
/// .in_phase(TransactionPhase::AfterCommit)
/// .when(|order| *order > 100)
/// .fallback_execution(true);
///
/// assert_eq!(listener.name(), "audit");
/// ```
pub struct Listener<E> {
    name: String,
    phase: TransactionPhase,
    predicate: Option<Predicate<E>>,
    callback: Callback<E>,
    fallback_execution: bool,
}

impl<E> Listener<E> {
    /// A listener for the after-commit phase, without fallback execution.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&E) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            phase: TransactionPhase::default(),
            predicate: None,
            callback: Box::new(callback),
            fallback_execution: false,
        }
    }

    pub fn in_phase(mut self, phase: TransactionPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Only events accepted by `predicate` reach the callback.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Invoke immediately when published outside a transaction.
    pub fn fallback_execution(mut self, enabled: bool) -> Self {
        self.fallback_execution = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn has_fallback_execution(&self) -> bool {
        self.fallback_execution
    }

    fn accepts(&self, event: &E) -> bool {
        self.predicate.as_ref().map_or(true, |predicate| predicate(event))
    }
}

impl<E> fmt::Debug for Listener<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("filtered", &self.predicate.is_some())
            .field("fallback_execution", &self.fallback_execution)
            .finish()
    }
}

/// What happened to one published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Publication {
    /// Queued on the active transaction.
    pub deferred: usize,
    /// Run at publish time because no transaction was active.
    pub invoked: usize,
    /// Skipped because no transaction was active and fallback was off.
    pub dropped: usize,
}

/// Routes events of type `E` to listeners, deferred to transaction phases.
pub struct EventDispatcher<E> {
    listeners: RwLock<Vec<Arc<Listener<E>>>>,
    observer: Arc<dyn FailureObserver>,
}

impl<E> EventDispatcher<E>
where
    E: Clone + Send + 'static,
{
    /// A dispatcher reporting listener failures through [`LoggingObserver`].
    pub fn new() -> Self {
        Self::with_observer(LoggingObserver)
    }

    pub fn with_observer(observer: impl FailureObserver + 'static) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            observer: Arc::new(observer),
        }
    }

    pub fn register(&self, listener: Listener<E>) {
        tracing::debug!(listener = %listener.name, phase = %listener.phase, "listener registered");
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Publish against the transaction active where the caller runs.
    ///
    /// The ambient pipeline context of the current task is consulted first,
    /// then the calling thread's slot.
    pub fn publish(&self, event: E) -> Publication {
        self.dispatch(active_synchronizations(), event)
    }

    /// Publish against the transaction held by `context`.
    pub fn publish_in(&self, context: &TransactionContext, event: E) -> Publication {
        self.dispatch(context_synchronizations(context), event)
    }

    fn dispatch(&self, registry: Option<Arc<SynchronizationRegistry>>, event: E) -> Publication {
        // Snapshot so callbacks may register listeners without deadlocking.
        let listeners: Vec<_> = self.listeners.read().clone();
        let mut publication = Publication::default();

        for listener in listeners.into_iter().filter(|l| l.accepts(&event)) {
            match &registry {
                Some(registry) => {
                    let phase = listener.phase;
                    let name = listener.name.clone();
                    let event = event.clone();
                    registry.register(
                        phase,
                        name,
                        self.observer.clone(),
                        Box::new(move || (listener.callback)(&event)),
                    );
                    publication.deferred += 1;
                }
                None if listener.fallback_execution => {
                    if let Err(error) = (listener.callback)(&event) {
                        self.observer.listener_failed(&ListenerFailure {
                            listener: listener.name.clone(),
                            phase: listener.phase,
                            transaction: None,
                            error,
                        });
                    }
                    publication.invoked += 1;
                }
                None => {
                    tracing::debug!(
                        listener = %listener.name,
                        phase = %listener.phase,
                        "no active transaction, event dropped"
                    );
                    publication.dropped += 1;
                }
            }
        }

        publication
    }
}

impl<E> Default for EventDispatcher<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::context::{Binding, ContextStore, ThreadLocalStore};
    use crate::transaction::{ManagerId, Outcome, TransactionId};
    use parking_lot::Mutex;

    fn counting(name: &str, hits: &Arc<Mutex<Vec<String>>>) -> Listener<String> {
        let hits = hits.clone();
        let label = name.to_string();
        Listener::new(name, move |event: &String| {
            hits.lock().push(format!("{}:{}", label, event));
            Ok(())
        })
    }

    fn bind_thread() -> Arc<SynchronizationRegistry> {
        let id = TransactionId::generate();
        let registry = Arc::new(SynchronizationRegistry::new(id));
        ThreadLocalStore.replace(Some(Binding::new(
            ManagerId::generate(),
            id,
            Arc::new(()),
            registry.clone(),
        )));
        registry
    }

    #[test]
    fn test_without_transaction_respects_fallback() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.register(counting("strict", &hits));
        dispatcher.register(counting("lenient", &hits).fallback_execution(true));

        let publication = dispatcher.publish("created".to_string());
        assert_eq!(publication.invoked, 1);
        assert_eq!(publication.dropped, 1);
        assert_eq!(*hits.lock(), vec!["lenient:created"]);
    }

    #[test]
    fn test_with_transaction_defers_until_completion() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.register(counting("first", &hits).fallback_execution(true));
        dispatcher.register(counting("second", &hits));

        let registry = bind_thread();
        let publication = dispatcher.publish("paid".to_string());
        ThreadLocalStore.replace(None);

        assert_eq!(publication.deferred, 2);
        assert!(hits.lock().is_empty());

        registry.trigger_after_completion(Some(Outcome::Commit));
        assert_eq!(*hits.lock(), vec!["first:paid", "second:paid"]);
    }

    #[test]
    fn test_predicate_filters_events() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.register(
            counting("big", &hits)
                .when(|event: &String| event.len() > 3)
                .fallback_execution(true),
        );

        dispatcher.publish("tiny".to_string());
        dispatcher.publish("ok".to_string());
        assert_eq!(*hits.lock(), vec!["big:tiny"]);
    }

    #[test]
    fn test_fallback_failure_goes_to_observer() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let dispatcher = EventDispatcher::with_observer(move |failure: &ListenerFailure| {
            sink.lock().push((failure.listener.clone(), failure.transaction));
        });
        dispatcher.register(
            Listener::new("broken", |_: &u32| Err("boom".into())).fallback_execution(true),
        );

        let publication = dispatcher.publish(7);
        assert_eq!(publication.invoked, 1);
        assert_eq!(*failures.lock(), vec![("broken".to_string(), None)]);
    }

    #[test]
    fn test_publish_in_explicit_context() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.register(counting("rb", &hits).in_phase(TransactionPhase::AfterRollback));

        let id = TransactionId::generate();
        let registry = Arc::new(SynchronizationRegistry::new(id));
        let context = TransactionContext::new();
        context.replace(Some(Binding::new(
            ManagerId::generate(),
            id,
            Arc::new(()),
            registry.clone(),
        )));

        assert_eq!(dispatcher.publish_in(&context, "x".to_string()).deferred, 1);
        registry.trigger_after_completion(Some(Outcome::Commit));
        assert!(hits.lock().is_empty());
    }
}
