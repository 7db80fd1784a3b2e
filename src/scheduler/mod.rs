pub mod worker;

use crate::graph::{Plan, Task, TaskError, TaskId, TaskStatus};
use crate::shared::logging::EventLog;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use worker::{spawn_task, TaskJob, WorkerMessage};

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
/// Poll interval for the scheduler loop and for workers watching the stop flag.
pub const SCHEDULER_POLL_MS: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `backoff_max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1_u32 << shift)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub task_timeout: Duration,
    pub plan_timeout: Duration,
    pub grace_period: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            task_timeout: Duration::from_secs(30),
            plan_timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Invokes one tool with substituted arguments. Implementations route to
/// executors or sub-agents; the scheduler only sees this seam.
pub trait TaskInvoker: Send + Sync {
    fn invoke(&self, tool: &str, args: &[Value]) -> Result<String, TaskError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub plan: Plan,
    pub termination: Termination,
    pub elapsed: Duration,
    pub max_in_flight: usize,
}

pub struct ExecutionScheduler {
    config: SchedulerConfig,
    log: Arc<EventLog>,
}

impl ExecutionScheduler {
    pub fn new(config: SchedulerConfig, log: Arc<EventLog>) -> Self {
        Self { config, log }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Drives `plan` until every task is terminal, the plan deadline passes
    /// or `cancel` fires. All task state changes happen on the calling
    /// thread; workers only report back over a channel.
    pub fn execute(
        &self,
        plan: Plan,
        invoker: Arc<dyn TaskInvoker>,
        cancel: &CancelToken,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let stop = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel::<WorkerMessage>();
        let max_concurrency = self.config.max_concurrency.max(1);
        let poll = Duration::from_millis(SCHEDULER_POLL_MS);
        let mut run = PlanRun::new(plan, &self.log);

        let termination = loop {
            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if started.elapsed() >= self.config.plan_timeout {
                break Termination::TimedOut;
            }

            while run.in_flight < max_concurrency {
                let Some(id) = run.ready.pop_first() else {
                    break;
                };
                run.dispatch(id, &events_tx, &invoker, &self.config, &stop);
            }

            if run.plan.all_terminal() || (run.in_flight == 0 && run.ready.is_empty()) {
                break Termination::Completed;
            }

            let wait = self
                .config
                .plan_timeout
                .saturating_sub(started.elapsed())
                .min(poll);
            if let Ok(message) = events_rx.recv_timeout(wait) {
                run.handle(message);
                while let Ok(message) = events_rx.try_recv() {
                    run.handle(message);
                }
            }
        };
        stop.store(true, Ordering::SeqCst);

        let abandon_with = match termination {
            Termination::Completed => TaskError::Cancelled,
            Termination::TimedOut => {
                self.log.warn(
                    "plan.timeout",
                    "plan deadline passed",
                    json!({
                        "timeout_ms": self.config.plan_timeout.as_millis() as u64,
                        "in_flight": run.in_flight,
                    }),
                );
                TaskError::PlanTimeout {
                    timeout_ms: self.config.plan_timeout.as_millis() as u64,
                }
            }
            Termination::Cancelled => {
                self.log.warn(
                    "plan.cancelled",
                    "plan cancelled",
                    json!({ "in_flight": run.in_flight }),
                );
                TaskError::Cancelled
            }
        };

        if termination != Termination::Completed {
            let grace_started = Instant::now();
            while run.in_flight > 0 {
                let left = self
                    .config
                    .grace_period
                    .saturating_sub(grace_started.elapsed());
                if left.is_zero() {
                    break;
                }
                match events_rx.recv_timeout(left) {
                    Ok(message) => run.handle(message),
                    Err(_) => break,
                }
            }
        }
        run.abandon(abandon_with);

        ExecutionOutcome {
            max_in_flight: run.max_in_flight,
            plan: run.plan,
            termination,
            elapsed: started.elapsed(),
        }
    }
}

struct PlanRun<'a> {
    plan: Plan,
    remaining: BTreeMap<TaskId, usize>,
    ready: BTreeSet<TaskId>,
    outputs: BTreeMap<TaskId, String>,
    in_flight: usize,
    max_in_flight: usize,
    log: &'a EventLog,
}

impl<'a> PlanRun<'a> {
    fn new(mut plan: Plan, log: &'a EventLog) -> Self {
        let remaining = plan
            .tasks()
            .map(|task| (task.id, task.dependencies.len()))
            .collect::<BTreeMap<_, _>>();
        let ready = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect::<BTreeSet<_>>();
        for id in &ready {
            if let Some(task) = plan.task_mut(*id) {
                task.status = TaskStatus::Ready;
            }
        }
        Self {
            plan,
            remaining,
            ready,
            outputs: BTreeMap::new(),
            in_flight: 0,
            max_in_flight: 0,
            log,
        }
    }

    fn dispatch(
        &mut self,
        id: TaskId,
        events: &Sender<WorkerMessage>,
        invoker: &Arc<dyn TaskInvoker>,
        config: &SchedulerConfig,
        stop: &Arc<AtomicBool>,
    ) {
        let Some(task) = self.plan.task_mut(id) else {
            return;
        };
        if task.is_join() {
            let now = Utc::now();
            task.status = TaskStatus::Succeeded;
            task.result = Some(Ok(String::new()));
            task.started_at = Some(now);
            task.finished_at = Some(now);
            self.on_terminal(id, true);
            return;
        }

        let resolved = task
            .args
            .iter()
            .map(|arg| arg.resolve(&self.outputs))
            .collect::<Result<Vec<_>, _>>();
        let args = match resolved {
            Ok(args) => args,
            Err(missing) => {
                self.finish(id, 0, Err(TaskError::DependencyFailed { task: missing }));
                return;
            }
        };

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.resolved_args = Some(args.clone());
        let tool = task.tool.clone();
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        self.log.info(
            "task.dispatched",
            "task dispatched",
            json!({ "task_id": id, "tool": tool, "in_flight": self.in_flight }),
        );

        spawn_task(
            TaskJob {
                id,
                tool,
                args,
                invoker: invoker.clone(),
                task_timeout: config.task_timeout,
                retry: config.retry,
                stop: stop.clone(),
            },
            events.clone(),
        );
    }

    fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Retrying {
                id,
                attempt,
                error,
                delay,
            } => {
                self.log.warn(
                    "task.retry",
                    "retrying transient task failure",
                    json!({
                        "task_id": id,
                        "attempt": attempt,
                        "error": error.to_string(),
                        "delay_ms": delay.as_millis() as u64,
                    }),
                );
            }
            WorkerMessage::Finished {
                id,
                attempts,
                result,
            } => self.finish(id, attempts, result),
            WorkerMessage::Released { .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
    }

    fn finish(&mut self, id: TaskId, attempts: u32, result: Result<String, TaskError>) {
        let Some(task) = self.plan.task_mut(id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.attempts = attempts;
        task.finished_at = Some(Utc::now());
        let elapsed_ms = elapsed_ms(task);
        let succeeded = result.is_ok();
        match &result {
            Ok(output) => {
                task.status = TaskStatus::Succeeded;
                self.outputs.insert(id, output.clone());
                self.log.info(
                    "task.completed",
                    "task succeeded",
                    json!({
                        "task_id": id,
                        "tool": task.tool,
                        "attempts": attempts,
                        "elapsed_ms": elapsed_ms,
                    }),
                );
            }
            Err(error) => {
                task.status = TaskStatus::Failed;
                self.log.error(
                    "task.failed",
                    "task failed",
                    json!({
                        "task_id": id,
                        "tool": task.tool,
                        "attempts": attempts,
                        "error_kind": error.kind(),
                        "error": error.to_string(),
                    }),
                );
            }
        }
        task.result = Some(result);
        self.on_terminal(id, succeeded);
    }

    /// Releases dependents of a terminal task. Failure skips every
    /// transitive dependent except the join, which only waits.
    fn on_terminal(&mut self, id: TaskId, succeeded: bool) {
        let mut worklist = vec![(id, succeeded)];
        while let Some((done, ok)) = worklist.pop() {
            let children = self.plan.dependents(done).collect::<Vec<_>>();
            for child in children {
                let Some(task) = self.plan.task_mut(child) else {
                    continue;
                };
                if task.status.is_terminal() {
                    continue;
                }
                if ok || task.is_join() {
                    if let Some(count) = self.remaining.get_mut(&child) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && task.status == TaskStatus::Pending {
                            task.status = TaskStatus::Ready;
                            self.ready.insert(child);
                        }
                    }
                    continue;
                }

                task.status = TaskStatus::Skipped;
                task.result = Some(Err(TaskError::DependencyFailed { task: done }));
                task.finished_at = Some(Utc::now());
                self.ready.remove(&child);
                self.log.info(
                    "task.skipped",
                    "task skipped after dependency failure",
                    json!({ "task_id": child, "dependency": done }),
                );
                worklist.push((child, false));
            }
        }
    }

    fn abandon(&mut self, error: TaskError) {
        let open = self
            .plan
            .tasks()
            .filter(|task| !task.status.is_terminal())
            .map(|task| task.id)
            .collect::<Vec<_>>();
        let now = Utc::now();
        for id in open {
            if let Some(task) = self.plan.task_mut(id) {
                task.status = TaskStatus::Failed;
                task.result = Some(Err(error.clone()));
                task.finished_at = Some(now);
                self.log.error(
                    "task.failed",
                    "task abandoned",
                    json!({
                        "task_id": id,
                        "tool": task.tool,
                        "error_kind": error.kind(),
                        "error": error.to_string(),
                    }),
                );
            }
        }
        self.ready.clear();
    }
}

fn elapsed_ms(task: &Task) -> i64 {
    match (task.started_at, task.finished_at) {
        (Some(start), Some(end)) => (end - start).num_milliseconds(),
        _ => 0,
    }
}
