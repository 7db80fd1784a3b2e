use plangraph::action::ActionError;
use plangraph::graph::{ArgValue, Plan, RawTask, TaskError, TaskStatus, TemplatePart};
use plangraph::scheduler::{
    CancelToken, ExecutionScheduler, RetryPolicy, SchedulerConfig, TaskInvoker, Termination,
};
use plangraph::shared::logging::EventLog;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Sleeps per call and tracks how many calls run at once.
struct Workload {
    delay: Duration,
    hang_first: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<(String, Vec<Value>)>>,
}

impl Workload {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            hang_first: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl TaskInvoker for Workload {
    fn invoke(&self, tool: &str, args: &[Value]) -> Result<String, TaskError> {
        self.seen
            .lock()
            .expect("seen lock")
            .push((tool.to_string(), args.to_vec()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let hang = self
            .hang_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        thread::sleep(if hang { self.delay * 10 } else { self.delay });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match tool {
            "echo" => Ok(args
                .iter()
                .map(|arg| arg.as_str().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
                .join("+")),
            "broken" => Err(TaskError::Action(ActionError::Failed("broken".to_string()))),
            other => Err(TaskError::UnknownTool(other.to_string())),
        }
    }
}

fn config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        task_timeout: Duration::from_secs(5),
        plan_timeout: Duration::from_secs(10),
        grace_period: Duration::from_millis(100),
        retry: RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
        },
    }
}

fn echo(id: u32, text: &str) -> RawTask {
    RawTask::new(id, "echo", vec![ArgValue::text(text)])
}

#[test]
fn independent_tasks_fan_out_up_to_the_cap() {
    let mut raw = (1..=6).map(|id| echo(id, "x")).collect::<Vec<_>>();
    raw.push(RawTask::join(7));
    let plan = Plan::build(raw).expect("plan");
    let workload = Arc::new(Workload::new(Duration::from_millis(100)));
    let scheduler = ExecutionScheduler::new(config(3), Arc::new(EventLog::disabled()));

    let outcome = scheduler.execute(plan, workload.clone(), &CancelToken::new());

    assert_eq!(outcome.termination, Termination::Completed);
    assert_eq!(outcome.plan.count_with_status(TaskStatus::Succeeded), 7);
    assert_eq!(outcome.max_in_flight, 3);
    assert!(workload.peak.load(Ordering::SeqCst) <= 3);
    assert!(workload.peak.load(Ordering::SeqCst) >= 2);
    assert!(outcome.elapsed < Duration::from_millis(550));
}

#[test]
fn dependents_receive_substituted_outputs() {
    let plan = Plan::build(vec![
        echo(1, "a"),
        RawTask::new(2, "echo", vec![ArgValue::Ref(1), ArgValue::text("b")]),
        RawTask::new(
            3,
            "echo",
            vec![ArgValue::Template(vec![
                TemplatePart::Text("got ".to_string()),
                TemplatePart::Ref(2),
            ])],
        ),
        RawTask::join(4),
    ])
    .expect("plan");
    let workload = Arc::new(Workload::new(Duration::from_millis(5)));
    let scheduler = ExecutionScheduler::new(config(4), Arc::new(EventLog::disabled()));

    let outcome = scheduler.execute(plan, workload.clone(), &CancelToken::new());

    assert_eq!(outcome.plan.task(3).and_then(|task| task.output()), Some("got a+b"));
    assert_eq!(
        outcome.plan.task(2).and_then(|task| task.resolved_args.clone()),
        Some(vec![json!("a"), json!("b")])
    );
    let seen = workload.seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].1, vec![json!("got a+b")]);
}

#[test]
fn hung_attempt_times_out_and_is_retried() {
    let plan = Plan::build(vec![echo(1, "a"), RawTask::join(2)]).expect("plan");
    let workload = Arc::new(Workload::new(Duration::from_millis(50)));
    workload.hang_first.store(1, Ordering::SeqCst);
    let mut config = config(2);
    config.task_timeout = Duration::from_millis(150);
    let scheduler = ExecutionScheduler::new(config, Arc::new(EventLog::disabled()));

    let outcome = scheduler.execute(plan, workload, &CancelToken::new());

    let task = outcome.plan.task(1).expect("task 1");
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.output(), Some("a"));
}

#[test]
fn timed_out_calls_keep_holding_their_slot() {
    let plan = Plan::build(vec![echo(1, "sms"), echo(2, "next"), RawTask::join(3)])
        .expect("plan");
    let workload = Arc::new(Workload::new(Duration::from_millis(20)));
    workload.hang_first.store(3, Ordering::SeqCst);
    let mut config = config(1);
    config.task_timeout = Duration::from_millis(60);
    let scheduler = ExecutionScheduler::new(config, Arc::new(EventLog::disabled()));

    let outcome = scheduler.execute(plan, workload.clone(), &CancelToken::new());

    assert_eq!(outcome.termination, Termination::Completed);
    assert_eq!(workload.peak.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.max_in_flight, 1);
    let first = outcome.plan.task(1).expect("task 1");
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.attempts, 3);
    assert_eq!(first.error(), Some(&TaskError::AttemptTimeout { timeout_ms: 60 }));
    assert_eq!(outcome.plan.task(2).and_then(|task| task.output()), Some("next"));

    let seen = workload.seen.lock().expect("seen lock");
    let calls = seen.iter().map(|(tool, args)| (tool.as_str(), args[0].clone())).collect::<Vec<_>>();
    assert_eq!(
        calls,
        vec![
            ("echo", json!("sms")),
            ("echo", json!("sms")),
            ("echo", json!("sms")),
            ("echo", json!("next")),
        ]
    );
}

#[test]
fn failures_skip_dependents_but_not_siblings() {
    let plan = Plan::build(vec![
        RawTask::new(1, "broken", vec![]),
        echo(2, "ok"),
        RawTask::new(3, "echo", vec![ArgValue::Ref(1)]),
        RawTask::new(4, "echo", vec![ArgValue::Ref(3)]),
        RawTask::new(5, "echo", vec![ArgValue::Ref(2)]),
        RawTask::join(6),
    ])
    .expect("plan");
    let workload = Arc::new(Workload::new(Duration::from_millis(5)));
    let scheduler = ExecutionScheduler::new(config(4), Arc::new(EventLog::disabled()));

    let outcome = scheduler.execute(plan, workload, &CancelToken::new());
    let plan = &outcome.plan;

    assert_eq!(plan.task(1).map(|task| task.attempts), Some(1));
    assert_eq!(
        plan.task(3).and_then(|task| task.error()),
        Some(&TaskError::DependencyFailed { task: 1 })
    );
    assert_eq!(
        plan.task(4).and_then(|task| task.error()),
        Some(&TaskError::DependencyFailed { task: 3 })
    );
    assert_eq!(plan.task(5).and_then(|task| task.output()), Some("ok"));
    assert_eq!(plan.count_with_status(TaskStatus::Skipped), 2);
    assert_eq!(plan.join_task().map(|task| task.status), Some(TaskStatus::Succeeded));
    assert!(plan.all_terminal());
}

#[test]
fn cancellation_marks_open_tasks_cancelled() {
    let plan = Plan::build(vec![
        echo(1, "slow"),
        RawTask::new(2, "echo", vec![ArgValue::Ref(1)]),
        RawTask::join(3),
    ])
    .expect("plan");
    let workload = Arc::new(Workload::new(Duration::from_millis(1000)));
    let scheduler = ExecutionScheduler::new(config(2), Arc::new(EventLog::disabled()));
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = scheduler.execute(plan, workload, &cancel);
    canceller.join().expect("canceller");

    assert_eq!(outcome.termination, Termination::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(800));
    for id in 1..=3 {
        let task = outcome.plan.task(id).expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error(), Some(&TaskError::Cancelled));
    }
}
