//! Property tests for the saga terminal-state invariant: once a saga
//! reaches `Completed`, `Compensated`, `Failed` or `TimedOut`, no later
//! write moves it anywhere else and `completed_at` never changes, no
//! matter how many duplicate transition signals arrive or in what order
//! (modeling at-least-once delivery of saga transition messages).

use chrono::Utc;
use proptest::prelude::*;
use sagaflow_saga::{SagaInstance, SagaStateStore, SagaStatus};

fn instance(saga_id: &str) -> SagaInstance {
    SagaInstance::new(saga_id, "OrderFulfillment", "corr-1", 3, Utc::now() + chrono::Duration::seconds(60))
}

fn arb_non_terminal() -> impl Strategy<Value = SagaStatus> {
    prop_oneof![
        Just(SagaStatus::Started),
        Just(SagaStatus::InProgress),
        Just(SagaStatus::Compensating),
    ]
}

fn arb_terminal() -> impl Strategy<Value = SagaStatus> {
    prop_oneof![
        Just(SagaStatus::Completed),
        Just(SagaStatus::Compensated),
        Just(SagaStatus::Failed),
        Just(SagaStatus::TimedOut),
    ]
}

#[derive(Debug, Clone)]
enum Write {
    SetStatus(SagaStatus),
    Complete(SagaStatus),
}

fn arb_write() -> impl Strategy<Value = Write> {
    prop_oneof![
        arb_non_terminal().prop_map(Write::SetStatus),
        arb_terminal().prop_map(Write::Complete),
    ]
}

proptest! {
    #[test]
    fn terminal_status_and_completed_at_survive_any_later_writes(
        terminal in arb_terminal(),
        later_writes in prop::collection::vec(arb_write(), 0..12),
    ) {
        let store = SagaStateStore::new();
        store.create(instance("s1")).unwrap();
        let first = store.complete_saga("s1", terminal).unwrap();
        prop_assert!(first.transitioned);
        let completed_at = first.instance.completed_at.unwrap();

        for write in later_writes {
            match write {
                Write::SetStatus(status) => store.set_status("s1", status).unwrap(),
                Write::Complete(status) => {
                    let outcome = store.complete_saga("s1", status).unwrap();
                    prop_assert!(!outcome.transitioned);
                }
            }
        }

        let loaded = store.get("s1").unwrap();
        prop_assert_eq!(loaded.status, terminal);
        prop_assert_eq!(loaded.completed_at.unwrap(), completed_at);
    }

    #[test]
    fn non_terminal_transitions_always_take_effect(status in arb_non_terminal()) {
        let store = SagaStateStore::new();
        store.create(instance("s1")).unwrap();
        store.set_status("s1", status).unwrap();
        let loaded = store.get("s1").unwrap();
        prop_assert_eq!(loaded.status, status);
        prop_assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn exactly_one_of_many_competing_finalizers_transitions(
        statuses in prop::collection::vec(arb_terminal(), 1..8),
    ) {
        let store = SagaStateStore::new();
        store.create(instance("s1")).unwrap();

        let mut transitions = 0;
        for status in &statuses {
            if store.complete_saga("s1", *status).unwrap().transitioned {
                transitions += 1;
            }
        }
        prop_assert_eq!(transitions, 1);
        prop_assert_eq!(store.get("s1").unwrap().status, statuses[0]);
    }
}
