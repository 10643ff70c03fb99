use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use txscope::events::{EventDispatcher, Listener, ListenerFailure, TransactionPhase};
use txscope::resource::{DriverOperation, MemoryDriver};
use txscope::transaction::{
    CompletionState, Propagation, TransactionDefinition, TransactionError, TransactionManager,
};

#[derive(Debug, Clone, PartialEq)]
struct OrderPlaced {
    id: u32,
}

type Log = Arc<Mutex<Vec<String>>>;

fn recording(name: &str, phase: TransactionPhase, log: &Log) -> Listener<OrderPlaced> {
    let log = log.clone();
    let label = format!("{}:{}", name, phase);
    Listener::new(name, move |event: &OrderPlaced| {
        log.lock().push(format!("{}#{}", label, event.id));
        Ok(())
    })
    .in_phase(phase)
}

fn setup() -> (MemoryDriver, TransactionManager<MemoryDriver>) {
    let driver = MemoryDriver::new();
    (driver.clone(), TransactionManager::new(driver))
}

// Scenario C
#[test]
fn without_transaction_the_fallback_flag_decides() {
    let log = Log::default();
    let dispatcher = EventDispatcher::new();
    dispatcher.register(recording("mailer", TransactionPhase::AfterCommit, &log));

    let publication = dispatcher.publish(OrderPlaced { id: 1 });
    assert_eq!(publication.dropped, 1);
    assert!(log.lock().is_empty());

    let eager = EventDispatcher::new();
    eager.register(recording("mailer", TransactionPhase::AfterCommit, &log).fallback_execution(true));

    let publication = eager.publish(OrderPlaced { id: 2 });
    assert_eq!(publication.invoked, 1);
    assert_eq!(*log.lock(), vec!["mailer:AFTER_COMMIT#2"]);
}

#[test]
fn commit_delivers_phases_in_order() {
    let (_driver, manager) = setup();
    let log = Log::default();
    let dispatcher = EventDispatcher::new();
    for phase in [
        TransactionPhase::AfterCompletion,
        TransactionPhase::AfterRollback,
        TransactionPhase::AfterCommit,
        TransactionPhase::BeforeCommit,
    ] {
        dispatcher.register(recording("l", phase, &log));
    }

    let status = manager.resolve(&TransactionDefinition::default()).unwrap();
    let publication = dispatcher.publish(OrderPlaced { id: 7 });
    assert_eq!(publication.deferred, 4);
    assert!(log.lock().is_empty());

    manager.commit(&status).unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "l:BEFORE_COMMIT#7",
            "l:AFTER_COMMIT#7",
            "l:AFTER_COMPLETION#7",
        ]
    );
}

#[test]
fn participants_publish_into_the_owner_transaction() {
    let (_driver, manager) = setup();
    let log = Log::default();
    let dispatcher = EventDispatcher::new();
    dispatcher.register(recording("audit", TransactionPhase::AfterRollback, &log));

    let outer = manager.resolve(&TransactionDefinition::default()).unwrap();
    let inner = manager
        .resolve(&TransactionDefinition::with_propagation(Propagation::Mandatory))
        .unwrap();
    dispatcher.publish(OrderPlaced { id: 3 });
    manager.rollback(&inner).unwrap();
    assert!(log.lock().is_empty());

    let report = manager.commit(&outer).unwrap();
    assert!(report.rollback_converted());
    assert_eq!(*log.lock(), vec!["audit:AFTER_ROLLBACK#3"]);
}

#[test]
fn requires_new_keeps_events_with_their_own_transaction() {
    let (_driver, manager) = setup();
    let log = Log::default();
    let dispatcher = EventDispatcher::new();
    dispatcher.register(recording("l", TransactionPhase::AfterCommit, &log));

    let outer = manager.resolve(&TransactionDefinition::default()).unwrap();
    dispatcher.publish(OrderPlaced { id: 1 });

    let inner = manager
        .resolve(&TransactionDefinition::with_propagation(Propagation::RequiresNew))
        .unwrap();
    dispatcher.publish(OrderPlaced { id: 2 });
    manager.commit(&inner).unwrap();
    assert_eq!(*log.lock(), vec!["l:AFTER_COMMIT#2"]);

    manager.commit(&outer).unwrap();
    assert_eq!(*log.lock(), vec!["l:AFTER_COMMIT#2", "l:AFTER_COMMIT#1"]);
}

#[test]
fn before_commit_failure_rolls_back() {
    let (driver, manager) = setup();
    let log = Log::default();
    let dispatcher = EventDispatcher::new();
    dispatcher.register(
        Listener::new("validator", |event: &OrderPlaced| {
            if event.id == 0 {
                return Err("order id must be positive".into());
            }
            Ok(())
        })
        .in_phase(TransactionPhase::BeforeCommit),
    );
    dispatcher.register(recording("l", TransactionPhase::AfterRollback, &log));
    dispatcher.register(recording("l", TransactionPhase::AfterCommit, &log));

    let status = manager.resolve(&TransactionDefinition::default()).unwrap();
    driver.put(status.transaction().unwrap(), "order/0", json!({})).unwrap();
    dispatcher.publish(OrderPlaced { id: 0 });

    let err = manager.commit(&status).unwrap_err();
    match err {
        TransactionError::BeforeCommitFailed { listener, .. } => assert_eq!(listener, "validator"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(status.state(), CompletionState::RolledBack);
    assert!(driver.is_empty());
    assert_eq!(*log.lock(), vec!["l:AFTER_ROLLBACK#0"]);
}

#[test]
fn after_commit_failure_does_not_change_outcome() {
    let (driver, manager) = setup();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let dispatcher = EventDispatcher::with_observer(move |failure: &ListenerFailure| {
        sink.lock().push(failure.to_string());
    });
    let log = Log::default();
    dispatcher.register(Listener::new("flaky", |_: &OrderPlaced| Err("smtp timeout".into())));
    dispatcher.register(recording("steady", TransactionPhase::AfterCommit, &log));

    let status = manager.resolve(&TransactionDefinition::default()).unwrap();
    driver.put(status.transaction().unwrap(), "order/9", json!(9)).unwrap();
    dispatcher.publish(OrderPlaced { id: 9 });

    let report = manager.commit(&status).unwrap();
    assert!(report.is_committed());
    assert_eq!(driver.committed("order/9"), Some(json!(9)));
    assert_eq!(*log.lock(), vec!["steady:AFTER_COMMIT#9"]);

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("flaky"));
    assert!(failures[0].contains("smtp timeout"));
}

#[test]
fn unknown_commit_outcome_only_fires_after_completion() {
    let (driver, manager) = setup();
    let log = Log::default();
    let dispatcher = EventDispatcher::new();
    dispatcher.register(recording("l", TransactionPhase::AfterCommit, &log));
    dispatcher.register(recording("l", TransactionPhase::AfterRollback, &log));
    dispatcher.register(recording("l", TransactionPhase::AfterCompletion, &log));

    let status = manager.resolve(&TransactionDefinition::default()).unwrap();
    dispatcher.publish(OrderPlaced { id: 5 });
    driver.fail_next(DriverOperation::Commit);

    assert!(manager.commit(&status).unwrap_err().is_system_failure());
    assert_eq!(*log.lock(), vec!["l:AFTER_COMPLETION#5"]);
}

#[test]
fn predicate_limits_deferred_listeners() {
    let (_driver, manager) = setup();
    let log = Log::default();
    let dispatcher = EventDispatcher::new();
    dispatcher.register(
        recording("big-orders", TransactionPhase::AfterCommit, &log).when(|e| e.id >= 100),
    );

    let status = manager.resolve(&TransactionDefinition::default()).unwrap();
    assert_eq!(dispatcher.publish(OrderPlaced { id: 5 }).deferred, 0);
    assert_eq!(dispatcher.publish(OrderPlaced { id: 500 }).deferred, 1);
    manager.commit(&status).unwrap();

    assert_eq!(*log.lock(), vec!["big-orders:AFTER_COMMIT#500"]);
    assert_eq!(dispatcher.listener_count(), 1);
}
