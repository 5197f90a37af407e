//! GPU health monitor.
//!
//! Three independent health signals feed the same reporter: a foreign-thread
//! policy-violation watcher ([`policy`]), a periodic non-exclusive health
//! poll, and an on-demand exclusive diagnostic pass run as a pool job
//! ([`backend::GpuBackend::run_diagnostics`]).

pub mod backend;
pub mod policy;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use backend::{BackendError, GpuBackend, NvmlBackend, StubGpuBackend};
use healthagent_report::{FieldValue, HealthReport, HealthStatus};
use healthagent_reporter::Reporter;
use healthagent_scheduler::{PoolJob, Scheduler};
use policy::PolicyViolation;
use serde::{Deserialize, Serialize};

const BACKGROUND_CHECK_NAME: &str = "BackgroundGPUHealthChecks";
const EPILOG_REPORT_NAME: &str = "ActiveGPUHealthChecks";

/// True when `DCGM_TEST_MODE` is set to a truthy value, or when no NVIDIA
/// device node is present — either way, the monitor runs against
/// [`StubGpuBackend`] instead of live hardware.
#[must_use]
pub fn test_mode_enabled() -> bool {
	let env_enabled = std::env::var("DCGM_TEST_MODE")
		.map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
		.unwrap_or(false);
	env_enabled || !std::path::Path::new("/dev/nvidia0").exists()
}

/// Owns the GPU backend handle, the reporter it writes to, and the foreign
/// policy-violation handoff.
pub struct GpuMonitor {
	reporter: Arc<Reporter>,
	scheduler: Scheduler,
	backend: Arc<Mutex<Box<dyn GpuBackend>>>,
	test_mode: bool,
}

impl GpuMonitor {
	/// Connect (or fall back to the stub backend) and clear any errors left
	/// over from a previous run, matching the original's
	/// `await self.reporter.clear_all_errors()` on initialization.
	///
	/// # Errors
	///
	/// Returns an error only if a live connection is required and fails;
	/// the stub backend never errors.
	pub fn new(reporter: Arc<Reporter>, scheduler: Scheduler) -> Result<Self, BackendError> {
		let test_mode = test_mode_enabled();
		let backend: Box<dyn GpuBackend> =
			if test_mode { Box::new(StubGpuBackend::default()) } else { Box::new(NvmlBackend::connect()?) };

		reporter.clear_all_errors(None);

		Ok(Self { reporter, scheduler, backend: Arc::new(Mutex::new(backend)), test_mode })
	}

	/// Register the background periodic and, outside test mode, spawn the
	/// foreign event thread feeding policy violations back into the
	/// reporter.
	pub fn create(&self) {
		let (tx, rx) = policy::channel();
		if !self.test_mode {
			spawn_policy_violation_thread(tx);
		}
		let rx = Arc::new(Mutex::new(rx));

		let reporter = self.reporter.clone();
		let backend = self.backend.clone();
		self.scheduler.schedule_periodic(BACKGROUND_CHECK_NAME, Duration::from_secs(60), move |_ctx| {
			let reporter = reporter.clone();
			let backend = backend.clone();
			let rx = rx.clone();
			async move {
				run_background_check(&reporter, &backend);
				policy::drain_into_report(&reporter, &rx.lock().expect("violation receiver lock poisoned"));
				Ok(())
			}
		});
	}

	/// Run the exclusive diagnostic pass in a pool worker and fold the
	/// result into the `ActiveGPUHealthChecks` report.
	///
	/// # Errors
	///
	/// Returns an error if the pool worker can't be spawned or its result
	/// can't be decoded.
	pub async fn run_epilog(&self) -> anyhow::Result<serde_json::Value> {
		let job = GpuEpilogJob { test_mode: self.test_mode };
		let result = self.scheduler.add_pool_task(&job).await?;
		let report: HealthReport = serde_json::from_value(result.clone())?;
		self.reporter.update_report(EPILOG_REPORT_NAME, report.clone())?;
		Ok(serde_json::json!({ EPILOG_REPORT_NAME: serde_json::Value::Object(report.view()) }))
	}

	/// `status` handler: the full reporter summary.
	#[must_use]
	pub fn show_status(&self) -> serde_json::Map<String, serde_json::Value> {
		self.reporter.summarize()
	}
}

fn run_background_check(reporter: &Reporter, backend: &Arc<Mutex<Box<dyn GpuBackend>>>) {
	let outcome = { backend.lock().expect("gpu backend lock poisoned").health_check() };

	let health = match outcome {
		Ok(health) => health,
		Err(BackendError::ConnectionNotValid) => {
			tracing::error!("GPU backend connection not valid, attempting one reconnect");
			let mut guard = backend.lock().expect("gpu backend lock poisoned");
			match guard.reconnect() {
				Ok(()) => match guard.health_check() {
					Ok(health) => health,
					Err(err) => {
						tracing::error!(error = %err, "GPU backend still failing health check after reconnect");
						return;
					}
				},
				Err(err) => {
					tracing::error!(error = %err, "unable to reconnect to GPU backend; restart the GPU driver service to re-instantiate checks");
					return;
				}
			}
		}
		Err(err) => {
			tracing::error!(error = %err, "GPU health check failed");
			return;
		}
	};

	if health.status == HealthStatus::Ok && health.incidents.is_empty() {
		if let Err(err) = reporter.update_report(BACKGROUND_CHECK_NAME, HealthReport::new()) {
			tracing::warn!(error = %err, "failed to record clean GPU background check");
		}
		return;
	}

	let mut report = HealthReport::new();
	report.status = health.status;
	report.description = Some(format!(
		"{BACKGROUND_CHECK_NAME} report {:?} count={} subsystem={}",
		health.status,
		health.incidents.len(),
		health.categories.join(", ")
	));
	report.details = Some(health.incidents.join("\n"));
	report
		.custom_fields
		.insert("error_count".to_string(), FieldValue::Int(health.incidents.len() as i64));
	report.custom_fields.insert(
		"categories".to_string(),
		FieldValue::List(health.categories.into_iter().map(FieldValue::String).collect()),
	);

	if let Err(err) = reporter.update_report(BACKGROUND_CHECK_NAME, report) {
		tracing::warn!(error = %err, "failed to record GPU background check");
	}
}

/// Exclusive diagnostic pass, run inside a pool worker process so its
/// (possibly minutes-long) blocking calls never stall the scheduler.
#[derive(Debug, Serialize, Deserialize)]
struct GpuEpilogJob {
	test_mode: bool,
}

#[typetag::serde]
impl PoolJob for GpuEpilogJob {
	fn run(self: Box<Self>) -> serde_json::Value {
		let backend: Result<Box<dyn GpuBackend>, BackendError> = if self.test_mode {
			Ok(Box::new(StubGpuBackend::default()))
		} else {
			NvmlBackend::connect().map(|b| Box::new(b) as Box<dyn GpuBackend>)
		};

		let report = match backend.and_then(|b| b.run_diagnostics()) {
			Ok(report) => report,
			Err(err) => {
				let mut report = HealthReport::new();
				report.status = HealthStatus::Warning;
				report.description = Some("Test not performed".to_string());
				report.details = Some(format!("Active diagnostics not performed.\nIs the GPU driver service running?\n{err}"));
				report
			}
		};

		serde_json::to_value(&report).unwrap_or(serde_json::Value::Null)
	}
}

fn spawn_policy_violation_thread(tx: std::sync::mpsc::SyncSender<PolicyViolation>) {
	std::thread::Builder::new()
		.name("gpu-policy-watch".to_string())
		.spawn(move || policy_violation_loop(&tx))
		.expect("failed to spawn GPU policy violation watcher thread");
}

/// Blocks on NVML's event set, translating `Xid`/ECC/NVLink events into
/// [`PolicyViolation`]s and handing each off through `tx`. Runs for the
/// lifetime of the process; NVML init failure here just means no violations
/// are ever produced, which the background periodic will independently
/// surface as connection errors.
fn policy_violation_loop(tx: &std::sync::mpsc::SyncSender<PolicyViolation>) {
	use nvml_wrapper::Nvml;
	use nvml_wrapper::bitmasks::event::EventTypes;

	let nvml = match Nvml::init() {
		Ok(nvml) => nvml,
		Err(err) => {
			tracing::warn!(error = %err, "GPU policy watcher could not initialize NVML; no violations will be observed");
			return;
		}
	};

	let device_count = nvml.device_count().unwrap_or(0);
	let mut event_set = match nvml.create_event_set() {
		Ok(set) => set,
		Err(err) => {
			tracing::warn!(error = %err, "failed to create NVML event set");
			return;
		}
	};

	for gpu_id in 0..device_count {
		if let Ok(device) = nvml.device_by_index(gpu_id) {
			event_set = match device.register_events(EventTypes::CRITICAL_XID_ERROR, event_set) {
				Ok(set) => set,
				Err(err) => {
					tracing::warn!(gpu_id, error = %err, "failed to register GPU for policy events");
					return;
				}
			};
		}
	}

	loop {
		match event_set.wait(5_000) {
			Ok(event) => {
				let gpu_id = event.device.index().unwrap_or(0);
				let xid = event.event_data.unwrap_or(0);
				let mut fields = std::collections::BTreeMap::new();
				fields.insert("xid_error".to_string(), FieldValue::Int(i64::try_from(xid).unwrap_or_default()));
				policy::try_notify(tx, PolicyViolation {
					condition: "Xid".to_string(),
					gpu_id,
					details: format!("XID error found: XID {xid} on GPU {gpu_id}"),
					fields,
				});
			}
			Err(nvml_wrapper::error::NvmlError::Timeout) => continue,
			Err(err) => {
				tracing::warn!(error = %err, "GPU policy event wait failed; stopping watcher thread");
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use healthagent_scheduler::Scheduler;

	use super::*;

	#[test]
	fn stub_monitor_starts_clean() {
		// Force the stub path regardless of the host's actual hardware.
		// SAFETY: tests run single-threaded within this process's env block.
		unsafe {
			std::env::set_var("DCGM_TEST_MODE", "true");
		}
		let reporter = Arc::new(Reporter::new(Scheduler::new(), "/nonexistent/notifier"));
		let monitor = GpuMonitor::new(reporter.clone(), Scheduler::new()).unwrap();
		assert!(monitor.test_mode);
		assert!(monitor.show_status().is_empty());
		unsafe {
			std::env::remove_var("DCGM_TEST_MODE");
		}
	}

	#[tokio::test]
	async fn epilog_runs_stub_diagnostics_without_a_child_process() {
		unsafe {
			std::env::set_var("DCGM_TEST_MODE", "true");
		}
		let scheduler = Scheduler::new();
		scheduler.start();
		let reporter = Arc::new(Reporter::new(scheduler.clone(), "/nonexistent/notifier"));
		let monitor = GpuMonitor::new(reporter.clone(), scheduler).unwrap();

		let job = GpuEpilogJob { test_mode: true };
		let value = PoolJob::run(Box::new(job));
		let report: HealthReport = serde_json::from_value(value).unwrap();
		assert_eq!(report.status, HealthStatus::Ok);
		let _ = monitor;
		unsafe {
			std::env::remove_var("DCGM_TEST_MODE");
		}
	}
}
