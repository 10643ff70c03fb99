use std::sync::Arc;

use serde_json::json;
use txscope::resource::{DriverOperation, MemoryDriver};
use txscope::transaction::{
    CompletionScope, CompletionState, ManagerConfig, Outcome, Propagation, TransactionDefinition,
    TransactionError, TransactionManager, TransactionTemplate,
};

fn setup() -> (MemoryDriver, TransactionManager<MemoryDriver>) {
    let driver = MemoryDriver::new();
    (driver.clone(), TransactionManager::new(driver))
}

fn def(propagation: Propagation) -> TransactionDefinition {
    TransactionDefinition::with_propagation(propagation)
}

#[test]
fn required_inside_required_shares_physical_transaction() {
    let (driver, manager) = setup();

    let outer = manager.resolve(&def(Propagation::Required)).unwrap();
    let inner = manager.resolve(&def(Propagation::Required)).unwrap();

    assert!(outer.is_new_transaction());
    assert!(!inner.is_new_transaction());
    assert_eq!(inner.id(), outer.id());

    let report = manager.commit(&inner).unwrap();
    assert_eq!(report.scope, CompletionScope::Participating);
    assert_eq!(driver.count(DriverOperation::Commit), 0);

    manager.commit(&outer).unwrap();
    assert_eq!(driver.count(DriverOperation::Begin), 1);
    assert_eq!(driver.count(DriverOperation::Commit), 1);
}

#[test]
fn requires_new_commits_independently_of_outer_rollback() {
    let (driver, manager) = setup();

    let outer = manager.resolve(&def(Propagation::Required)).unwrap();
    driver
        .put(outer.transaction().unwrap(), "outer", json!(1))
        .unwrap();

    let inner = manager.resolve(&def(Propagation::RequiresNew)).unwrap();
    assert_ne!(inner.id(), outer.id());
    driver
        .put(inner.transaction().unwrap(), "audit", json!("attempted"))
        .unwrap();
    manager.commit(&inner).unwrap();

    manager.rollback(&outer).unwrap();
    assert_eq!(driver.committed("audit"), Some(json!("attempted")));
    assert_eq!(driver.committed("outer"), None);
}

#[test]
fn mandatory_without_transaction_fails_before_touching_driver() {
    let (driver, manager) = setup();

    let err = manager.resolve(&def(Propagation::Mandatory)).unwrap_err();
    assert!(matches!(err, TransactionError::IllegalTransactionState(_)));
    assert!(driver.calls().is_empty());
}

#[test]
fn never_with_transaction_fails() {
    let (_driver, manager) = setup();

    let outer = manager.resolve(&def(Propagation::Required)).unwrap();
    let err = manager.resolve(&def(Propagation::Never)).unwrap_err();
    assert!(err.is_illegal_state());
    manager.rollback(&outer).unwrap();
}

#[test]
fn supports_runs_without_transaction_when_none_active() {
    let (driver, manager) = setup();

    let status = manager.resolve(&def(Propagation::Supports)).unwrap();
    assert!(!status.has_transaction());
    assert!(status.transaction().is_none());

    let report = manager.commit(&status).unwrap();
    assert_eq!(report.scope, CompletionScope::NonTransactional);
    assert!(driver.calls().is_empty());
}

#[test]
fn completing_twice_fails_for_every_scope() {
    let (_driver, manager) = setup();

    let outer = manager.resolve(&def(Propagation::Required)).unwrap();
    let joined = manager.resolve(&def(Propagation::Required)).unwrap();
    let nested = manager.resolve(&def(Propagation::Nested)).unwrap();

    for status in [&nested, &joined] {
        manager.commit(status).unwrap();
        let err = manager.rollback(status).unwrap_err();
        assert!(matches!(err, TransactionError::NotActive { .. }));
    }

    manager.rollback(&outer).unwrap();
    assert!(manager.commit(&outer).is_err());
}

#[test]
fn rollback_only_is_monotonic() {
    let (_driver, manager) = setup();

    let outer = manager.resolve(&def(Propagation::Required)).unwrap();
    let inner = manager.resolve(&def(Propagation::Required)).unwrap();
    inner.set_rollback_only();
    manager.commit(&inner).unwrap();

    // Nothing a later participant does clears the flag.
    let late = manager.resolve(&def(Propagation::Required)).unwrap();
    manager.commit(&late).unwrap();
    assert!(outer.is_rollback_only());

    let report = manager.commit(&outer).unwrap();
    assert!(report.rollback_converted());
}

// Scenario A
#[test]
fn inner_rollback_only_converts_outer_commit() {
    let (driver, manager) = setup();
    let template = TransactionTemplate::new(manager.clone());

    let completed = template
        .execute_reported(|outer| {
            driver
                .put(outer.transaction().unwrap(), "order/1", json!({"total": 10}))
                .unwrap();
            template
                .execute(|inner| {
                    assert!(!inner.is_new_transaction());
                    inner.set_rollback_only();
                    Ok::<_, String>(())
                })
                .map_err(|e| e.to_string())?;
            Ok::<_, String>("placed")
        })
        .map_err(|e| e.to_string())
        .unwrap();

    assert_eq!(completed.value, "placed");
    assert_eq!(completed.report.requested, Outcome::Commit);
    assert_eq!(completed.report.performed, Outcome::Rollback);
    assert!(completed.report.rollback_converted());
    assert!(driver.is_empty());
    assert_eq!(driver.count(DriverOperation::Commit), 0);
    assert_eq!(driver.count(DriverOperation::Rollback), 1);
}

// Scenario D
#[test]
fn failed_nested_scope_only_rolls_back_its_savepoint() {
    let (driver, manager) = setup();
    let template = TransactionTemplate::new(manager.clone());
    let nested = template.with_definition(def(Propagation::Nested));

    let outcome = template.execute_reported(|outer| {
        let tx = outer.transaction().unwrap();
        driver.put(tx, "customer/1", json!("Ada")).unwrap();

        let inner = nested.execute(|scope| {
            assert!(scope.has_savepoint());
            driver.put(tx, "customer/2", json!("Bob")).unwrap();
            Err::<(), _>("duplicate email")
        });
        assert_eq!(inner.unwrap_err().into_work_error(), Some("duplicate email"));

        assert_eq!(outer.state(), CompletionState::Active);
        assert!(!outer.is_rollback_only());
        Ok::<_, String>(())
    });

    assert!(outcome.unwrap().report.is_committed());
    assert_eq!(driver.committed("customer/1"), Some(json!("Ada")));
    assert_eq!(driver.committed("customer/2"), None);
    assert_eq!(driver.count(DriverOperation::RollbackToSavepoint), 1);
}

#[test]
fn participant_rollback_can_be_left_to_owner() {
    let driver = MemoryDriver::new();
    let manager = TransactionManager::with_config(
        driver.clone(),
        ManagerConfig::new().global_rollback_on_participation_failure(false),
    );

    let outer = manager.resolve(&def(Propagation::Required)).unwrap();
    driver.put(outer.transaction().unwrap(), "k", json!(1)).unwrap();
    let inner = manager.resolve(&def(Propagation::Required)).unwrap();
    manager.rollback(&inner).unwrap();

    let report = manager.commit(&outer).unwrap();
    assert!(report.is_committed());
    assert_eq!(driver.committed("k"), Some(json!(1)));
}

#[test]
fn fail_early_on_global_rollback_only() {
    let driver = MemoryDriver::new();
    let manager = TransactionManager::with_config(
        driver,
        ManagerConfig::new().fail_early_on_global_rollback_only(true),
    );

    let outer = manager.resolve(&def(Propagation::Required)).unwrap();
    outer.set_rollback_only();
    let inner = manager.resolve(&def(Propagation::Required)).unwrap();

    let err = manager.commit(&inner).unwrap_err();
    assert!(matches!(err, TransactionError::UnexpectedRollback { .. }));
    assert_eq!(inner.state(), CompletionState::RolledBack);
    manager.rollback(&outer).unwrap();
}

#[test]
fn threads_do_not_see_each_others_transactions() {
    let (driver, manager) = setup();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let manager = manager.clone();
            let driver = driver.clone();
            std::thread::spawn(move || {
                let status = manager.resolve(&def(Propagation::Required)).unwrap();
                assert!(status.is_new_transaction());
                driver
                    .put(status.transaction().unwrap(), format!("t/{}", n), json!(n))
                    .unwrap();
                let joined = manager.resolve(&def(Propagation::Mandatory)).unwrap();
                assert_eq!(joined.id(), status.id());
                manager.commit(&joined).unwrap();
                manager.commit(&status).unwrap();
                status.id().unwrap()
            })
        })
        .collect();

    let mut ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(driver.len(), 4);
    assert!(!manager.has_active_transaction());
}
