use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use conductor::config::StateConfig;
use conductor::state::TaskUpdate;
use conductor::{ExecutionStateMachine, GlobalState, Task, TaskState};

fn machine() -> ExecutionStateMachine {
    ExecutionStateMachine::new(&StateConfig {
        wait_poll_ms: 10,
        ..Default::default()
    })
}

fn diamond() -> Vec<Task> {
    vec![
        Task::new("1", "root"),
        Task::new("2", "left").with_dependencies(vec!["1".into()]),
        Task::new("3", "right").with_dependencies(vec!["1".into()]),
        Task::new("4", "join").with_dependencies(vec!["2".into(), "3".into()]),
    ]
}

#[test]
fn rollback_restores_exact_states() {
    let sm = machine();
    sm.initialize_tasks(&diamond());

    sm.mark_running("1").unwrap();
    sm.mark_completed("1", "root done").unwrap();
    let checkpoint = sm.create_snapshot();

    sm.mark_running("2").unwrap();
    sm.mark_running("3").unwrap();
    sm.mark_completed("2", "left done").unwrap();

    assert!(sm.rollback_to_snapshot(checkpoint.timestamp));

    // Byte-for-byte equality against the checkpoint copy.
    for (id, expected) in &checkpoint.tasks {
        let live = sm.task(id).unwrap();
        assert_eq!(
            serde_json::to_string(&live).unwrap(),
            serde_json::to_string(expected).unwrap(),
            "task {} state drifted after rollback",
            id
        );
    }

    // History only contains entries at or before the checkpoint.
    for snapshot in sm.history() {
        assert!(snapshot.timestamp <= checkpoint.timestamp);
    }
}

#[test]
fn snapshot_history_evicts_fifo() {
    let sm = ExecutionStateMachine::new(&StateConfig {
        snapshot_capacity: 5,
        ..Default::default()
    });
    sm.initialize_tasks(&diamond());

    let early = sm.create_snapshot();
    for _ in 0..10 {
        sm.create_snapshot();
    }

    let history = sm.history();
    assert_eq!(history.len(), 5);
    assert!(history.iter().all(|s| s.timestamp > early.timestamp));
    // Oldest first.
    for pair in history.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn update_running_twice_keeps_start_time() {
    let sm = machine();
    sm.initialize_tasks(&diamond());

    let first = sm.mark_running("1").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = sm
        .update_task_state("1", TaskState::Running, TaskUpdate::progress(40))
        .unwrap();

    assert_eq!(first.start_time, second.start_time);
}

#[test]
fn listeners_observe_every_mutation_in_order() {
    let sm = machine();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    sm.add_listener(move |snapshot| {
        sink.lock().push(snapshot.global_state);
    });

    sm.initialize_tasks(&diamond());
    sm.mark_running("1").unwrap();
    sm.mark_completed("1", "done").unwrap();

    let states = seen.lock().clone();
    assert_eq!(
        states,
        vec![GlobalState::Idle, GlobalState::Running, GlobalState::Idle]
    );
}

#[test]
fn panicking_listener_does_not_stop_fanout() {
    let sm = machine();
    let count = Arc::new(AtomicUsize::new(0));

    sm.add_listener(|_| panic!("listener bug"));
    let counter = Arc::clone(&count);
    sm.add_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    sm.add_listener(|_| panic!("another listener bug"));

    sm.initialize_tasks(&diamond());
    sm.mark_running("1").unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn stop_all_scenario() {
    let sm = machine();
    sm.initialize_tasks(&diamond());

    sm.mark_running("1").unwrap();
    sm.mark_completed("1", "done").unwrap();
    sm.mark_running("2").unwrap();

    sm.stop_all();

    assert_eq!(sm.task("1").unwrap().state, TaskState::Completed);
    for id in ["2", "3", "4"] {
        let snapshot = sm.task(id).unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert!(snapshot.error.unwrap().contains("stopped"));
        assert!(snapshot.end_time.is_some());
    }
    assert_eq!(sm.global_state(), GlobalState::Stopped);
}

#[test]
fn ready_tasks_follow_completion_wave() {
    let sm = machine();
    sm.initialize_tasks(&diamond());

    assert_eq!(sm.ready_tasks(), vec!["1"]);

    sm.mark_running("1").unwrap();
    sm.mark_completed("1", "ok").unwrap();
    assert_eq!(sm.ready_tasks(), vec!["2", "3"]);

    sm.mark_running("2").unwrap();
    sm.mark_completed("2", "ok").unwrap();
    // "4" still waits on "3".
    assert_eq!(sm.ready_tasks(), vec!["3"]);

    sm.mark_running("3").unwrap();
    sm.mark_completed("3", "ok").unwrap();
    assert_eq!(sm.ready_tasks(), vec!["4"]);
}

#[tokio::test]
async fn wait_primitive_sees_terminal_transitions() {
    let sm = Arc::new(machine());
    sm.initialize_tasks(&diamond());

    let waiter = Arc::clone(&sm);
    let ok_wait = tokio::spawn(async move { waiter.wait_for_task("1").await });
    let waiter = Arc::clone(&sm);
    let err_wait = tokio::spawn(async move { waiter.wait_for_task("2").await });

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    sm.mark_running("1").unwrap();
    sm.mark_completed("1", "done").unwrap();
    sm.mark_running("2").unwrap();
    sm.mark_failed("2", "left side broke").unwrap();

    let completed = ok_wait.await.unwrap().unwrap();
    assert_eq!(completed.state, TaskState::Completed);

    let err = err_wait.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("left side broke"));
}
