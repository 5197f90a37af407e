//! Off-process "pool" jobs.
//!
//! A pool job runs in a freshly spawned, single-purpose child process so
//! that blocking native-library calls (GPU vendor diagnostics) never stall
//! the scheduler's single event-loop thread, and so that any signal handlers
//! the library installs stay confined to a process that exits immediately
//! after the job completes. Each submission owns its own worker; there is no
//! persistent pool to contend over.
//!
//! Jobs are serialized with [`typetag`] so a `Box<dyn PoolJob>` round-trips
//! through the child's stdin as one JSON line; the child writes its result
//! back as one JSON line on stdout and exits.

use std::io::{BufRead, Write};

/// Something that can run in an isolated worker process.
///
/// Implementors derive `Serialize`/`Deserialize` (via `#[typetag::serde]`) so
/// the job itself can be shipped across the process boundary; `run` performs
/// the actual blocking work and returns a JSON-encodable result.
#[typetag::serde(tag = "job")]
pub trait PoolJob: Send {
	/// Execute the job, blocking the current (worker) thread as needed.
	fn run(self: Box<Self>) -> serde_json::Value;
}

/// Entry point for the child process spawned by [`crate::Scheduler::add_pool_task`].
///
/// The binary embedding this crate should call this function when invoked
/// with its pool-worker subcommand, then exit with the returned status code.
/// Reads exactly one job from stdin, runs it, writes exactly one result line
/// to stdout.
pub fn run_pool_worker() -> i32 {
	let stdin = std::io::stdin();
	let mut line = String::new();
	if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
		eprintln!("pool worker: failed to read job from stdin");
		return 1;
	}

	let job: Box<dyn PoolJob> = match serde_json::from_str(&line) {
		Ok(job) => job,
		Err(e) => {
			eprintln!("pool worker: failed to decode job: {e}");
			return 1;
		}
	};

	let result = job.run();
	let encoded = match serde_json::to_string(&result) {
		Ok(s) => s,
		Err(e) => {
			eprintln!("pool worker: failed to encode result: {e}");
			return 1;
		}
	};

	let stdout = std::io::stdout();
	let mut handle = stdout.lock();
	if writeln!(handle, "{encoded}").is_err() || handle.flush().is_err() {
		return 1;
	}
	0
}

#[cfg(test)]
mod tests {
	use serde::{Deserialize, Serialize};

	use super::*;

	#[derive(Debug, Serialize, Deserialize)]
	struct EchoJob {
		value: i64,
	}

	#[typetag::serde]
	impl PoolJob for EchoJob {
		fn run(self: Box<Self>) -> serde_json::Value {
			serde_json::json!({ "echoed": self.value })
		}
	}

	#[test]
	fn job_round_trips_through_json() {
		let job: Box<dyn PoolJob> = Box::new(EchoJob { value: 42 });
		let encoded = serde_json::to_string(&job).unwrap();
		let decoded: Box<dyn PoolJob> = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded.run(), serde_json::json!({ "echoed": 42 }));
	}
}
