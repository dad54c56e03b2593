use cadence_scheduler::{
    CallError, DoneStatus, ManagerConfig, ManualClock, Task, TaskError, TaskManager, TaskRef,
    TaskState, Value, callable, new_task,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn create_test_manager() -> (TaskManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let manager = TaskManager::with_clock(ManagerConfig::default(), clock.clone());
    (manager, clock)
}

fn counting_upon_death(counter: &Arc<AtomicUsize>) -> Value {
    let counter = counter.clone();
    callable(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::None)
    })
}

#[test]
fn test_task_ids_are_unique() {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                (0..50)
                    .map(|i| Task::from_fn(format!("t{i}"), |_| DoneStatus::Done).id())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(ids.insert(id), "id {id} was handed out twice");
        }
    }
    assert_eq!(ids.len(), 200);
}

#[test]
fn test_continue_three_times_then_finish() {
    let (manager, _clock) = create_test_manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let deaths = Arc::new(AtomicUsize::new(0));

    let task = {
        let calls = calls.clone();
        new_task(
            callable(move |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n <= 3 { Value::Int(1) } else { Value::None })
            }),
            "counter",
        )
        .unwrap()
    };
    task.set_upon_death(counting_upon_death(&deaths)).unwrap();

    manager.add(task.task()).unwrap();
    assert_eq!(task.state(), TaskState::Active);

    for _ in 0..4 {
        manager.poll();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(task.run_count(), 4);
    assert_eq!(task.state(), TaskState::Inactive);
    assert_eq!(task.clean_exit(), Some(true));
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
    assert!(!manager.has_task(task.task()));

    manager.poll();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_callback_is_contained() {
    let (manager, _clock) = create_test_manager();
    let deaths = Arc::new(AtomicUsize::new(0));
    let neighbour_runs = Arc::new(AtomicUsize::new(0));

    let failing = new_task(callable(|_| Err(CallError::new("boom"))), "failing").unwrap();
    failing.set_upon_death(counting_upon_death(&deaths)).unwrap();

    let neighbour = {
        let runs = neighbour_runs.clone();
        Task::from_fn("neighbour", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Cont
        })
    };

    manager.add(failing.task()).unwrap();
    manager.add(&neighbour).unwrap();

    let stats = manager.poll();
    assert_eq!(stats.executed, 2);
    assert_eq!(stats.finished, 1);

    assert_eq!(failing.state(), TaskState::Inactive);
    assert_eq!(failing.clean_exit(), Some(false));
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
    assert_eq!(neighbour_runs.load(Ordering::SeqCst), 1);
    assert_eq!(neighbour.state(), TaskState::Active);
}

#[test]
fn test_panicking_body_counts_as_abort() {
    let (manager, _clock) = create_test_manager();
    let panicking = Task::from_fn("panicking", |_| panic!("native failure"));
    let after = Task::from_fn("after", |_| DoneStatus::Done);

    manager.add(&panicking).unwrap();
    manager.add(&after).unwrap();
    manager.poll();

    assert_eq!(panicking.clean_exit(), Some(false));
    assert_eq!(after.clean_exit(), Some(true));
    assert_eq!(manager.num_tasks(), 0);
}

#[test]
fn test_death_hook_fires_once_per_exit_path() {
    let (manager, _clock) = create_test_manager();

    let outcomes: Vec<(&str, Value)> = vec![
        ("done", Value::None),
        ("abort", Value::from("unexpected")),
        ("removed", Value::Int(1)),
    ];

    for (name, result) in outcomes {
        let deaths = Arc::new(AtomicUsize::new(0));
        let task = new_task(callable(move |_| Ok(result.clone())), name).unwrap();
        task.set_upon_death(counting_upon_death(&deaths)).unwrap();
        manager.add(task.task()).unwrap();

        manager.poll();
        if name == "removed" {
            assert!(task.task().remove());
            assert!(!task.task().remove());
        }
        manager.poll();
        manager.poll();

        assert_eq!(deaths.load(Ordering::SeqCst), 1, "exit path {name}");
        assert_eq!(task.state(), TaskState::Inactive);
    }
}

#[test]
fn test_removed_task_never_entered_active_set() {
    let (manager, _clock) = create_test_manager();
    let deaths = Arc::new(AtomicUsize::new(0));
    let task = new_task(callable(|_| Ok(Value::None)), "detached").unwrap();
    task.set_upon_death(counting_upon_death(&deaths)).unwrap();

    assert!(!manager.remove(task.task()));
    assert_eq!(deaths.load(Ordering::SeqCst), 0);
    assert_eq!(task.clean_exit(), None);
}

#[test]
fn test_explicit_removal_is_synchronous() {
    let (manager, _clock) = create_test_manager();
    let runs = Arc::new(AtomicUsize::new(0));
    let task = {
        let runs = runs.clone();
        Task::from_fn("looping", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Cont
        })
    };

    manager.add(&task).unwrap();
    manager.poll();
    assert!(manager.remove(&task));
    assert_eq!(task.state(), TaskState::Inactive);
    assert_eq!(task.clean_exit(), Some(false));
    assert_eq!(manager.num_tasks(), 0);

    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_add_twice_is_rejected() {
    let (manager, _clock) = create_test_manager();
    let (other, _) = create_test_manager();
    let task = Task::from_fn("once", |_| DoneStatus::Cont);

    manager.add(&task).unwrap();
    assert!(matches!(
        manager.add(&task),
        Err(TaskError::AlreadyScheduled { .. })
    ));
    assert!(matches!(
        other.add(&task),
        Err(TaskError::AlreadyScheduled { .. })
    ));
    assert!(matches!(
        task.set_task_chain("elsewhere"),
        Err(TaskError::TaskBusy { .. })
    ));

    // Another manager cannot remove what it does not run.
    assert!(!other.remove(&task));
    assert!(manager.remove(&task));
}

#[test]
fn test_task_can_be_rescheduled_after_finishing() {
    let (manager, _clock) = create_test_manager();
    let task = Task::from_fn("again", |_| DoneStatus::Done);

    manager.add(&task).unwrap();
    manager.poll();
    assert_eq!(task.clean_exit(), Some(true));

    manager.add(&task).unwrap();
    assert_eq!(task.clean_exit(), None);
    assert!(manager.has_task(&task));
    manager.poll();
    assert_eq!(task.run_count(), 2);
}

#[test]
fn test_remove_all() {
    let (manager, _clock) = create_test_manager();
    let deaths = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..3)
        .map(|i| {
            let task = new_task(callable(|_| Ok(Value::Int(1))), format!("t{i}")).unwrap();
            task.set_upon_death(counting_upon_death(&deaths)).unwrap();
            manager.add(task.task()).unwrap();
            task
        })
        .collect();

    assert_eq!(manager.remove_all(), 3);
    assert_eq!(manager.num_tasks(), 0);
    assert_eq!(deaths.load(Ordering::SeqCst), 3);
    assert!(tasks.iter().all(|t| !t.is_alive()));
}

#[test]
fn test_dropping_manager_retires_its_tasks() {
    let deaths = Arc::new(AtomicUsize::new(0));
    let task = new_task(callable(|_| Ok(Value::Int(1))), "orphan").unwrap();
    task.set_upon_death(counting_upon_death(&deaths)).unwrap();

    let (first, _clock) = create_test_manager();
    first.add(task.task()).unwrap();
    first.poll();
    drop(first);

    assert_eq!(task.state(), TaskState::Inactive);
    assert!(!task.is_alive());
    assert_eq!(task.clean_exit(), Some(false));
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
    assert!(task.manager().is_none());

    let (second, _clock) = create_test_manager();
    second.add(task.task()).unwrap();
    assert!(second.has_task(task.task()));
    assert!(task.task().remove());
    assert_eq!(deaths.load(Ordering::SeqCst), 2);
}

#[test]
fn test_registry_queries() {
    let (manager, _clock) = create_test_manager();
    let names = ["enemy-1", "enemy-2", "player"];
    let tasks: Vec<TaskRef> = names
        .iter()
        .map(|name| Task::from_fn(*name, |_| DoneStatus::Cont))
        .collect();
    for task in &tasks {
        manager.add(task).unwrap();
    }
    tasks[2].set_delay(5.0);
    manager.remove(&tasks[2]);
    manager.add(&tasks[2]).unwrap();

    assert_eq!(manager.num_tasks(), 3);
    assert_eq!(manager.find_task("player").map(|t| t.id()), Some(tasks[2].id()));
    assert!(manager.find_task("boss").is_none());
    assert_eq!(manager.find_tasks_matching("enemy-*").len(), 2);
    assert_eq!(manager.find_tasks_matching("player").len(), 1);
    assert_eq!(manager.get_task(tasks[0].id()).map(|t| t.name()), Some("enemy-1".into()));
    assert_eq!(manager.active_tasks().len(), 2);
    assert_eq!(manager.sleeping_tasks().len(), 1);
    assert_eq!(manager.next_wake_time(), Some(5.0));

    let ids: Vec<_> = manager.tasks().iter().map(|t| t.id()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[test]
fn test_birth_and_death_order_for_native_body() {
    use cadence_scheduler::TaskBody;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl TaskBody for Recorder {
        fn do_task(&self, _task: &TaskRef) -> DoneStatus {
            self.0.lock().unwrap().push("run".into());
            DoneStatus::Done
        }

        fn upon_birth(&self, task: &TaskRef) {
            self.0.lock().unwrap().push(format!("birth {:?}", task.state()));
        }

        fn upon_death(&self, task: &TaskRef, clean_exit: bool) {
            self.0
                .lock()
                .unwrap()
                .push(format!("death {:?} {clean_exit}", task.state()));
        }
    }

    let (manager, _clock) = create_test_manager();
    let log = Arc::new(Mutex::new(Vec::new()));
    let task = Task::new("recorder", Recorder(log.clone()));

    manager.add(&task).unwrap();
    manager.poll();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["birth Active", "run", "death Inactive true"]
    );
}
