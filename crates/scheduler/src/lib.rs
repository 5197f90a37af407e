//! Single-threaded cooperative task scheduler.
//!
//! Everything here assumes a `tokio` current-thread runtime: one-shot tasks
//! and periodic tasks are ordinary `tokio::spawn`ed futures that cooperate by
//! yielding, not OS threads. The scheduler's only job is lifecycle: turning
//! `stop()` into "no further periodic reschedule, no new one-shot tasks",
//! without reaching into tasks that are already running.
//!
//! Two escape hatches exist for work that must not run inline:
//! [`pool`] for isolating blocking/native-library calls in a child process,
//! and [`subprocess`] for plain external commands.

pub mod pool;
pub mod subprocess;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use pool::{PoolJob, run_pool_worker};
pub use subprocess::{SubprocessOutput, SubprocessSpec};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// `init -> start() -> running -> stop() -> stopped`.
///
/// Cloning a [`Scheduler`] shares the same underlying state; every clone
/// observes the same `start`/`stop` transitions.
#[derive(Clone)]
pub struct Scheduler {
	inner: Arc<Inner>,
}

struct Inner {
	started: AtomicBool,
	stopped: AtomicBool,
	stopped_notify: Notify,
}

impl Default for Scheduler {
	fn default() -> Self {
		Self::new()
	}
}

impl Scheduler {
	/// Create a scheduler in its initial, not-yet-started state.
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				started: AtomicBool::new(false),
				stopped: AtomicBool::new(false),
				stopped_notify: Notify::new(),
			}),
		}
	}

	/// Enter the running state. Idempotent.
	pub fn start(&self) {
		self.inner.started.store(true, Ordering::SeqCst);
	}

	/// Enter the stopped state. Idempotent, and irreversible: a stopped
	/// scheduler never resumes accepting new one-shot tasks or periodic
	/// reschedules. Tasks already spawned keep running to completion.
	pub fn stop(&self) {
		self.inner.stopped.store(true, Ordering::SeqCst);
		self.inner.stopped_notify.notify_waiters();
	}

	/// True once [`Scheduler::stop`] has been called.
	#[must_use]
	pub fn is_stopped(&self) -> bool {
		self.inner.stopped.load(Ordering::SeqCst)
	}

	/// Resolve once [`Scheduler::stop`] has been called. Returns immediately
	/// if already stopped. The orchestrator's main loop awaits this instead
	/// of polling, so the process stays idle until a signal handler calls
	/// `stop()`.
	pub async fn wait_for_stop(&self) {
		loop {
			if self.is_stopped() {
				return;
			}
			let notified = self.inner.stopped_notify.notified();
			if self.is_stopped() {
				return;
			}
			notified.await;
		}
	}

	/// True once [`Scheduler::start`] has been called.
	#[must_use]
	pub fn is_started(&self) -> bool {
		self.inner.started.load(Ordering::SeqCst)
	}

	/// Spawn a one-shot task. Returns `None` without spawning if the
	/// scheduler is already stopped.
	pub fn add_task<F>(&self, fut: F) -> Option<JoinHandle<F::Output>>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		if self.is_stopped() {
			return None;
		}
		Some(tokio::spawn(fut))
	}

	/// Schedule a fixed-delay periodic task: the delay between iteration
	/// `k` finishing and iteration `k + 1` starting is always `interval`,
	/// regardless of how long each iteration took. `body` is re-invoked
	/// fresh every iteration and receives a [`PeriodicCtx`] it can use to
	/// cancel its own future reschedules. An iteration that returns `Err`
	/// is logged and does not stop rescheduling; only [`Scheduler::stop`]
	/// or [`PeriodicCtx::cancel`] does that.
	///
	/// Returns `None` without spawning if the scheduler is already stopped.
	pub fn schedule_periodic<F, Fut>(&self, name: &'static str, interval: Duration, mut body: F) -> Option<JoinHandle<()>>
	where
		F: FnMut(PeriodicCtx) -> Fut + Send + 'static,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		if self.is_stopped() {
			return None;
		}

		let scheduler = self.clone();
		let cancelled = Arc::new(AtomicBool::new(false));

		Some(tokio::spawn(async move {
			loop {
				if scheduler.is_stopped() || cancelled.load(Ordering::SeqCst) {
					return;
				}

				let ctx = PeriodicCtx { cancelled: cancelled.clone() };
				if let Err(err) = body(ctx).await {
					tracing::warn!(task = name, error = %err, "periodic task iteration failed");
				}

				if scheduler.is_stopped() || cancelled.load(Ordering::SeqCst) {
					return;
				}
				tokio::time::sleep(interval).await;
			}
		}))
	}

	/// Run `job` in a freshly spawned child process and return its decoded
	/// result. The child is the current executable re-invoked with
	/// `--pool-worker`; see [`pool::run_pool_worker`] for the other half of
	/// this protocol.
	///
	/// # Errors
	///
	/// Returns an error if the current executable can't be located, the
	/// child can't be spawned, the job can't be encoded, the child exits
	/// without writing a result line, or the result line fails to parse.
	pub async fn add_pool_task(&self, job: &dyn PoolJob) -> anyhow::Result<serde_json::Value> {
		use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

		let exe = std::env::current_exe()?;
		let encoded = serde_json::to_string(job)?;

		let mut child = Command::new(exe)
			.arg("--pool-worker")
			.stdin(std::process::Stdio::piped())
			.stdout(std::process::Stdio::piped())
			.stderr(std::process::Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;

		let mut stdin = child.stdin.take().expect("piped stdin");
		stdin.write_all(encoded.as_bytes()).await?;
		stdin.write_all(b"\n").await?;
		drop(stdin);

		let stdout = child.stdout.take().expect("piped stdout");
		let mut reader = BufReader::new(stdout);
		let mut line = String::new();
		reader.read_line(&mut line).await?;

		let status = child.wait().await?;
		if line.trim().is_empty() {
			anyhow::bail!("pool worker exited ({status}) without producing a result");
		}

		Ok(serde_json::from_str(line.trim())?)
	}

	/// Spawn and await `spec`, capturing its output. See [`subprocess::run`].
	///
	/// # Errors
	///
	/// Returns an error under the same conditions as [`subprocess::run`].
	pub async fn run_subprocess(&self, spec: &SubprocessSpec) -> std::io::Result<SubprocessOutput> {
		subprocess::run(spec).await
	}
}

/// Handed to a periodic task body on each iteration so it can cancel its own
/// future reschedules. Cancellation is per-task: it never affects other
/// periodics or the scheduler as a whole.
#[derive(Clone)]
pub struct PeriodicCtx {
	cancelled: Arc<AtomicBool>,
}

impl PeriodicCtx {
	/// Suppress this task's next reschedule. The current iteration still
	/// runs to completion.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	#[tokio::test(flavor = "multi_thread", start_paused = true)]
	async fn add_task_after_stop_returns_none() {
		let sched = Scheduler::new();
		sched.start();
		sched.stop();
		assert!(sched.add_task(async {}).is_none());
	}

	#[tokio::test(flavor = "multi_thread", start_paused = true)]
	async fn add_task_before_stop_runs() {
		let sched = Scheduler::new();
		sched.start();
		let handle = sched.add_task(async { 7 }).expect("should spawn");
		assert_eq!(handle.await.unwrap(), 7);
	}

	#[tokio::test(flavor = "multi_thread", start_paused = true)]
	async fn periodic_runs_at_fixed_delay_and_stops_on_scheduler_stop() {
		let sched = Scheduler::new();
		sched.start();
		let runs = Arc::new(Mutex::new(0u32));
		let runs_clone = runs.clone();

		sched.schedule_periodic("counter", Duration::from_secs(10), move |_ctx| {
			let runs = runs_clone.clone();
			async move {
				*runs.lock().unwrap() += 1;
				Ok(())
			}
		});

		tokio::time::advance(Duration::from_secs(1)).await;
		assert_eq!(*runs.lock().unwrap(), 1, "first iteration runs immediately");

		tokio::time::advance(Duration::from_secs(10)).await;
		assert_eq!(*runs.lock().unwrap(), 2);

		sched.stop();
		tokio::time::advance(Duration::from_secs(30)).await;
		assert_eq!(*runs.lock().unwrap(), 2, "stopped scheduler must not reschedule");
	}

	#[tokio::test(flavor = "multi_thread", start_paused = true)]
	async fn periodic_self_cancel_stops_only_that_task() {
		let sched = Scheduler::new();
		sched.start();
		let runs = Arc::new(Mutex::new(0u32));
		let runs_clone = runs.clone();

		sched.schedule_periodic("self-cancelling", Duration::from_secs(5), move |ctx| {
			let runs = runs_clone.clone();
			async move {
				let mut n = runs.lock().unwrap();
				*n += 1;
				if *n == 2 {
					ctx.cancel();
				}
				Ok(())
			}
		});

		tokio::time::advance(Duration::from_secs(1)).await;
		tokio::time::advance(Duration::from_secs(5)).await;
		assert_eq!(*runs.lock().unwrap(), 2);

		tokio::time::advance(Duration::from_secs(60)).await;
		assert_eq!(*runs.lock().unwrap(), 2, "cancelled task must not run again");
		assert!(!sched.is_stopped(), "per-task cancel must not stop the scheduler");
	}

	#[tokio::test(flavor = "multi_thread", start_paused = true)]
	async fn wait_for_stop_resolves_after_stop_is_called() {
		let sched = Scheduler::new();
		sched.start();
		let waiter = sched.clone();
		let handle = tokio::spawn(async move { waiter.wait_for_stop().await });

		tokio::time::advance(Duration::from_millis(10)).await;
		assert!(!handle.is_finished());

		sched.stop();
		handle.await.unwrap();
	}

	#[tokio::test(flavor = "multi_thread", start_paused = true)]
	async fn wait_for_stop_returns_immediately_if_already_stopped() {
		let sched = Scheduler::new();
		sched.start();
		sched.stop();
		sched.wait_for_stop().await;
	}

	#[tokio::test(flavor = "multi_thread", start_paused = true)]
	async fn periodic_iteration_error_does_not_halt_rescheduling() {
		let sched = Scheduler::new();
		sched.start();
		let runs = Arc::new(Mutex::new(0u32));
		let runs_clone = runs.clone();

		sched.schedule_periodic("flaky", Duration::from_secs(1), move |_ctx| {
			let runs = runs_clone.clone();
			async move {
				let mut n = runs.lock().unwrap();
				*n += 1;
				if *n == 1 { Err(anyhow::anyhow!("transient")) } else { Ok(()) }
			}
		});

		tokio::time::advance(Duration::from_millis(100)).await;
		assert_eq!(*runs.lock().unwrap(), 1);

		tokio::time::advance(Duration::from_secs(2)).await;
		assert_eq!(*runs.lock().unwrap(), 2, "a failed iteration still reschedules");
	}
}
