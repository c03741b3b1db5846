use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use orchestrator::{
    ActivityGate, AsyncCommand, Command, CommandParameter, CommandSequence, Notifier,
    ObservableCommandQueue,
};
use tokio::sync::mpsc;

/// Test leaf with an externally controlled readiness flag.
struct Toggle {
    name: String,
    ready: AtomicBool,
    runs: AtomicUsize,
    readiness: Notifier,
}

impl Toggle {
    fn new(name: &str, ready: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ready: AtomicBool::new(ready),
            runs: AtomicUsize::new(0),
            readiness: Notifier::new(),
        })
    }

    fn flip(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        self.readiness.notify();
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Command for Toggle {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_run(&self, _parameter: &CommandParameter) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn run(&self, _parameter: &CommandParameter) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn readiness(&self) -> &Notifier {
        &self.readiness
    }
}

#[test]
fn test_shared_slot_mutual_exclusion() {
    let slot = ObservableCommandQueue::new();

    let a1 = Toggle::new("a1", true);
    let a2 = Toggle::new("a2", false);
    let reboot = CommandSequence::named("reboot", slot.clone());
    reboot.register_command(a1.clone()).unwrap();
    reboot.register_command(a2.clone()).unwrap();

    let b1 = Toggle::new("b1", true);
    let rename = CommandSequence::named("rename", slot.clone());
    rename.register_command(b1.clone()).unwrap();

    assert!(reboot.can_run(&CommandParameter::Null));
    assert!(rename.can_run(&CommandParameter::Null));

    reboot.run(&CommandParameter::Null);
    assert_eq!(a1.runs(), 1);
    assert_eq!(slot.count(), 1);

    assert!(!rename.can_run(&CommandParameter::Null));
    assert!(!reboot.can_run(&CommandParameter::Null));
    rename.run(&serde_json::json!("ignored"));
    assert_eq!(slot.count(), 1);
    assert_eq!(b1.runs(), 0);

    a2.flip(true);
    assert_eq!(a2.runs(), 1);
    assert!(slot.is_empty());

    assert!(rename.can_run(&CommandParameter::Null));
    rename.run(&CommandParameter::Null);
    assert_eq!(b1.runs(), 1);
}

#[test]
fn test_readiness_observers_see_slot_changes() {
    let slot = ObservableCommandQueue::new();
    let first = CommandSequence::named("first", slot.clone());
    first.register_command(Toggle::new("x", true)).unwrap();
    first.register_command(Toggle::new("y", false)).unwrap();

    let second = CommandSequence::named("second", slot.clone());
    second.register_command(Toggle::new("z", true)).unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed_clone = observed.clone();
    let watched = second.clone();
    second.readiness().subscribe(move || {
        observed_clone
            .lock()
            .unwrap()
            .push(watched.can_run(&CommandParameter::Null));
    });

    first.run(&CommandParameter::Null);
    assert_eq!(observed.lock().unwrap().last(), Some(&false));

    slot.clear();
    assert_eq!(observed.lock().unwrap().last(), Some(&true));
}

#[test]
fn test_nested_sequence_runs_in_parent_position() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str| {
        let order = order.clone();
        AsyncCommand::from_fn(name, move |_| order.lock().unwrap().push(name))
    };

    let slot = ObservableCommandQueue::new();
    let refresh = CommandSequence::named("refresh", slot.clone());
    refresh.register_command(step("read-name")).unwrap();
    refresh.register_command(step("read-firmware")).unwrap();

    let pipeline = CommandSequence::named("pipeline", slot.clone());
    pipeline.register_command(step("stop")).unwrap();
    pipeline.register_command(refresh.clone()).unwrap();
    pipeline.register_command(step("resume")).unwrap();

    pipeline.run(&CommandParameter::Null);

    assert_eq!(
        *order.lock().unwrap(),
        vec!["stop", "read-name", "read-firmware", "resume"]
    );
    // The nested sequence is still usable on its own.
    assert!(refresh.can_run(&CommandParameter::Null));
}

#[test]
fn test_failing_step_abandons_pipeline() {
    let slot = ObservableCommandQueue::new();
    let tail = Toggle::new("tail", true);
    let abort_slot = slot.clone();

    let pipeline = CommandSequence::named("doomed", slot.clone());
    pipeline
        .register_command(AsyncCommand::from_fn("fails", move |_| abort_slot.clear()))
        .unwrap();
    pipeline.register_command(tail.clone()).unwrap();

    pipeline.run(&CommandParameter::Null);

    assert_eq!(tail.runs(), 0);
    assert!(slot.is_empty());
    assert!(pipeline.can_run(&CommandParameter::Null));
}

#[tokio::test(start_paused = true)]
async fn test_gated_async_steps_do_not_overlap() {
    let gate = ActivityGate::new("transport");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let slot = ObservableCommandQueue::new();
    let pipeline = CommandSequence::named("reboot", slot.clone());

    for (name, millis) in [("stop-telemetry", 30u64), ("reboot", 100), ("resume", 10)] {
        let tx = tx.clone();
        let command = AsyncCommand::builder(name, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(format!("start:{name}"));
                tokio::time::sleep(Duration::from_millis(millis)).await;
                let _ = tx.send(format!("end:{name}"));
            }
        })
        .gated_by(gate.clone())
        .build();
        pipeline.register_command(command).unwrap();
    }

    pipeline.run(&CommandParameter::Null);
    assert_eq!(slot.count(), 2);
    assert!(pipeline.is_blocked());

    let mut log = Vec::new();
    while log.len() < 6 {
        log.push(rx.recv().await.unwrap());
    }

    assert_eq!(
        log,
        vec![
            "start:stop-telemetry",
            "end:stop-telemetry",
            "start:reboot",
            "end:reboot",
            "start:resume",
            "end:resume",
        ]
    );

    for _ in 0..100 {
        if gate.is_idle() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(slot.is_empty());
    assert!(gate.is_idle());
    assert!(pipeline.can_run(&CommandParameter::Null));
}

#[tokio::test]
async fn test_predicate_reevaluated_on_observed_property() {
    let name = Arc::new(Mutex::new(String::new()));
    let name_changed = Notifier::new();
    let renamed = Arc::new(AtomicUsize::new(0));

    let predicate_name = name.clone();
    let renamed_clone = renamed.clone();
    let rename = AsyncCommand::sync_builder("rename", move |_| {
        renamed_clone.fetch_add(1, Ordering::SeqCst);
    })
    .when(move |_| !predicate_name.lock().unwrap().is_empty())
    .build();
    rename.observe(&name_changed);

    let pipeline = CommandSequence::standalone("rename");
    pipeline
        .register_command(AsyncCommand::from_fn("prepare", |_| {}))
        .unwrap();
    pipeline.register_command(rename.clone()).unwrap();

    pipeline.run(&CommandParameter::Null);
    assert_eq!(renamed.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.queue().count(), 1);

    *name.lock().unwrap() = "kitchen".to_string();
    name_changed.notify();

    assert_eq!(renamed.load(Ordering::SeqCst), 1);
    assert!(pipeline.queue().is_empty());
}
