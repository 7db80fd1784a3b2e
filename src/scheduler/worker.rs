use super::{RetryPolicy, TaskInvoker, SCHEDULER_POLL_MS};
use crate::action::ActionError;
use crate::graph::{TaskError, TaskId};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type AttemptResult = Result<String, TaskError>;

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Retrying {
        id: TaskId,
        attempt: u32,
        error: TaskError,
        delay: Duration,
    },
    Finished {
        id: TaskId,
        attempts: u32,
        result: AttemptResult,
    },
    /// The worker and any attempt it timed out have exited. The pool slot
    /// is held until this arrives.
    Released { id: TaskId },
}

pub(crate) struct TaskJob {
    pub(crate) id: TaskId,
    pub(crate) tool: String,
    pub(crate) args: Vec<Value>,
    pub(crate) invoker: Arc<dyn TaskInvoker>,
    pub(crate) task_timeout: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) stop: Arc<AtomicBool>,
}

pub(crate) fn spawn_task(job: TaskJob, events: Sender<WorkerMessage>) {
    let id = job.id;
    let fallback = events.clone();
    let spawned = thread::Builder::new()
        .name(format!("plan-task-{id}"))
        .spawn(move || run_task_attempts(job, events));
    if let Err(err) = spawned {
        let _ = fallback.send(WorkerMessage::Finished {
            id,
            attempts: 0,
            result: Err(TaskError::Action(ActionError::Failed(format!(
                "failed to spawn task worker: {err}"
            )))),
        });
        let _ = fallback.send(WorkerMessage::Released { id });
    }
}

fn run_task_attempts(job: TaskJob, events: Sender<WorkerMessage>) {
    let mut attempt = 0u32;
    let mut abandoned: Option<Receiver<AttemptResult>>;
    let result = loop {
        attempt += 1;
        let (outcome, pending) = invoke_with_timeout(&job);
        abandoned = pending;
        match outcome {
            Ok(output) => break Ok(output),
            Err(error) if error.is_transient() && attempt <= job.retry.max_retries => {
                let delay = job.retry.backoff_for(attempt);
                let _ = events.send(WorkerMessage::Retrying {
                    id: job.id,
                    attempt,
                    error: error.clone(),
                    delay,
                });
                // A timed-out call must return before the tool is invoked again.
                if let Some(pending) = abandoned.take() {
                    if !wait_for_abandoned(&job.stop, &pending) {
                        break Err(error);
                    }
                }
                if !sleep_with_stop(&job.stop, delay) {
                    break Err(error);
                }
            }
            Err(error) => break Err(error),
        }
    };
    let _ = events.send(WorkerMessage::Finished {
        id: job.id,
        attempts: attempt,
        result,
    });
    if let Some(pending) = abandoned {
        wait_for_abandoned(&job.stop, &pending);
    }
    let _ = events.send(WorkerMessage::Released { id: job.id });
}

/// Runs one attempt on its own thread so a hung executor cannot hold the
/// worker past the per-attempt timeout. On timeout the attempt's receiver
/// is handed back so the caller can wait for the call to return.
fn invoke_with_timeout(job: &TaskJob) -> (AttemptResult, Option<Receiver<AttemptResult>>) {
    let (tx, rx) = mpsc::sync_channel(1);
    let invoker = job.invoker.clone();
    let tool = job.tool.clone();
    let args = job.args.clone();
    let spawned = thread::Builder::new()
        .name(format!("plan-task-{}-attempt", job.id))
        .spawn(move || {
            let _ = tx.send(invoker.invoke(&tool, &args));
        });
    if let Err(err) = spawned {
        let failed = Err(TaskError::Action(ActionError::Failed(format!(
            "failed to spawn attempt thread: {err}"
        ))));
        return (failed, None);
    }

    match rx.recv_timeout(job.task_timeout) {
        Ok(result) => (result, None),
        Err(RecvTimeoutError::Timeout) => (
            Err(TaskError::AttemptTimeout {
                timeout_ms: job.task_timeout.as_millis() as u64,
            }),
            Some(rx),
        ),
        Err(RecvTimeoutError::Disconnected) => (
            Err(TaskError::Action(ActionError::Failed(format!(
                "tool `{}` panicked",
                job.tool
            )))),
            None,
        ),
    }
}

/// Blocks until a timed-out attempt reports or `stop` is raised. Its late
/// result is discarded. Returns false when stopped first.
fn wait_for_abandoned(stop: &AtomicBool, pending: &Receiver<AttemptResult>) -> bool {
    let poll = Duration::from_millis(SCHEDULER_POLL_MS);
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        match pending.recv_timeout(poll) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(SCHEDULER_POLL_MS));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl TaskInvoker for Flaky {
        fn invoke(&self, _tool: &str, _args: &[Value]) -> Result<String, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(TaskError::Action(ActionError::Transient("busy".to_string())))
            } else {
                Ok(format!("ok after {call}"))
            }
        }
    }

    struct Hangs;

    impl TaskInvoker for Hangs {
        fn invoke(&self, _tool: &str, _args: &[Value]) -> Result<String, TaskError> {
            thread::sleep(Duration::from_millis(500));
            Ok("late".to_string())
        }
    }

    fn job(invoker: Arc<dyn TaskInvoker>, timeout_ms: u64, retries: u32) -> TaskJob {
        TaskJob {
            id: 1,
            tool: "lookup".to_string(),
            args: Vec::new(),
            invoker,
            task_timeout: Duration::from_millis(timeout_ms),
            retry: RetryPolicy {
                max_retries: retries,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(4),
            },
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn collect(rx: mpsc::Receiver<WorkerMessage>) -> (u32, Option<AttemptResult>) {
        let mut retries = 0;
        for message in rx.iter() {
            match message {
                WorkerMessage::Retrying { .. } => retries += 1,
                WorkerMessage::Finished { result, .. } => return (retries, Some(result)),
                WorkerMessage::Released { .. } => break,
            }
        }
        (retries, None)
    }

    #[test]
    fn transient_failures_retry_until_success() {
        let (tx, rx) = mpsc::channel();
        run_task_attempts(
            job(
                Arc::new(Flaky {
                    failures: 2,
                    calls: AtomicU32::new(0),
                }),
                1000,
                2,
            ),
            tx,
        );
        let (retries, result) = collect(rx);
        assert_eq!(retries, 2);
        assert_eq!(result, Some(Ok("ok after 3".to_string())));
    }

    #[test]
    fn retries_stop_at_budget() {
        let (tx, rx) = mpsc::channel();
        run_task_attempts(
            job(
                Arc::new(Flaky {
                    failures: 3,
                    calls: AtomicU32::new(0),
                }),
                1000,
                2,
            ),
            tx,
        );
        let (retries, result) = collect(rx);
        assert_eq!(retries, 2);
        assert!(matches!(result, Some(Err(TaskError::Action(ActionError::Transient(_))))));
    }

    #[test]
    fn hung_attempt_times_out() {
        let started = Instant::now();
        let (result, pending) = invoke_with_timeout(&job(Arc::new(Hangs), 50, 0));
        assert_eq!(result, Err(TaskError::AttemptTimeout { timeout_ms: 50 }));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(pending.is_some());
    }

    #[test]
    fn retry_waits_for_the_timed_out_call_and_releases_after_it() {
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        run_task_attempts(job(Arc::new(Hangs), 50, 1), tx);

        let messages = rx.iter().collect::<Vec<_>>();
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(matches!(
            messages.as_slice(),
            [
                WorkerMessage::Retrying { attempt: 1, .. },
                WorkerMessage::Finished {
                    attempts: 2,
                    result: Err(TaskError::AttemptTimeout { timeout_ms: 50 }),
                    ..
                },
                WorkerMessage::Released { id: 1 },
            ]
        ));
    }

    #[test]
    fn stop_ends_the_wait_for_a_timed_out_call() {
        let stop = AtomicBool::new(true);
        let (_tx, rx) = mpsc::sync_channel::<AttemptResult>(1);
        assert!(!wait_for_abandoned(&stop, &rx));
    }

    #[test]
    fn sleep_with_stop_returns_early_when_stopped() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!sleep_with_stop(&stop, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
