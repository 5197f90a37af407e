//! Systemd unit monitor.
//!
//! Watches a fixed allowlist of services over DBus and reports only the
//! transitions that matter for node health: anything ending in `failed`,
//! and the specific recovery `failed -> active/running`. Every other
//! transition (`activating`, `deactivating`, ...) is noise and ignored.

mod proxies;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use healthagent_report::{HealthReport, HealthStatus};
use healthagent_reporter::Reporter;
use healthagent_scheduler::Scheduler;
use proxies::{ManagerProxy, UnitProxy};
use zbus::Connection;
use zbus::zvariant::OwnedObjectPath;

/// Services monitored on every node, carried forward from the original
/// agent's hardcoded list.
pub const CORE_ALLOWLIST: &[&str] =
	&["munge.service", "slurmd.service", "slurmctld.service", "slurmdbd.service", "slurmrestd.service"];

/// Additional services monitored only when the GPU monitor initialized
/// successfully.
pub const GPU_ALLOWLIST: &[&str] = &["nvidia-imex.service", "nvidia-dcgm.service", "nvidia-persistenced.service"];

type SharedState = Arc<Mutex<HashMap<String, String>>>;
type SharedPathSet = Arc<Mutex<HashSet<OwnedObjectPath>>>;
type SharedNameSet = Arc<Mutex<HashSet<String>>>;

pub struct SystemdMonitor {
	reporter: Arc<Reporter>,
	scheduler: Scheduler,
	connection: Connection,
	state: SharedState,
	monitored_paths: SharedPathSet,
	services_not_enabled: SharedNameSet,
}

impl SystemdMonitor {
	/// Connect to the system bus and clear any stale error reports.
	///
	/// # Errors
	///
	/// Returns an error if the system bus can't be reached.
	pub async fn connect(reporter: Arc<Reporter>, scheduler: Scheduler) -> zbus::Result<Self> {
		reporter.clear_all_errors(None);
		let connection = Connection::system().await?;
		Ok(Self {
			reporter,
			scheduler,
			connection,
			state: Arc::new(Mutex::new(HashMap::new())),
			monitored_paths: Arc::new(Mutex::new(HashSet::new())),
			services_not_enabled: Arc::new(Mutex::new(HashSet::new())),
		})
	}

	/// Subscribe to systemd's `UnitNew` signal so a service that's currently
	/// unloaded (and therefore unmonitorable) gets picked up retroactively
	/// once it loads.
	///
	/// # Errors
	///
	/// Returns an error if the `Manager` proxy or its signal stream can't be
	/// created.
	pub async fn create(&self) -> zbus::Result<()> {
		let manager = ManagerProxy::new(&self.connection).await?;
		let mut stream = manager.receive_unit_new().await?;
		let connection = self.connection.clone();
		let reporter = self.reporter.clone();
		let scheduler = self.scheduler.clone();
		let services_not_enabled = self.services_not_enabled.clone();
		let monitored_paths = self.monitored_paths.clone();
		let state = self.state.clone();

		self.scheduler.add_task(async move {
			while let Some(signal) = stream.next().await {
				let Ok(args) = signal.args() else { continue };
				let service = args.id.clone();
				let unit_path = args.unit.clone();
				if !services_not_enabled.lock().expect("services lock poisoned").contains(&service) {
					continue;
				}
				if !monitored_paths.lock().expect("monitored paths lock poisoned").insert(unit_path.clone()) {
					continue;
				}
				if let Err(err) = watch_unit(&connection, &reporter, &scheduler, &state, unit_path, service.clone()).await
				{
					tracing::error!(service, error = %err, "failed to attach monitor for newly loaded unit");
				}
			}
		});
		Ok(())
	}

	/// Resolve and start watching every service in `services`. Services
	/// systemd doesn't know about are recorded in `services_not_enabled` so
	/// [`SystemdMonitor::create`]'s `UnitNew` listener can pick them up
	/// later.
	///
	/// # Errors
	///
	/// Returns an error for DBus failures other than "unit not found".
	pub async fn add_monitor(&self, services: &[&str]) -> zbus::Result<()> {
		if services.is_empty() {
			return Ok(());
		}

		let manager = ManagerProxy::new(&self.connection).await?;
		for &service in services {
			match manager.get_unit(service).await {
				Ok(unit_path) => {
					if !self.monitored_paths.lock().expect("monitored paths lock poisoned").insert(unit_path.clone()) {
						continue;
					}
					if let Err(err) =
						watch_unit(&self.connection, &self.reporter, &self.scheduler, &self.state, unit_path, service.to_string())
							.await
					{
						tracing::error!(service, error = %err, "failed to attach systemd unit monitor");
					}
				}
				Err(err) if err.to_string().contains("NoSuchUnit") => {
					tracing::debug!(service, "unit not currently loaded; will retry if it appears later");
					self.services_not_enabled.lock().expect("services lock poisoned").insert(service.to_string());
				}
				Err(err) => return Err(err),
			}
		}
		Ok(())
	}

	/// `status` handler.
	#[must_use]
	pub fn show_status(&self) -> serde_json::Map<String, serde_json::Value> {
		self.reporter.summarize()
	}
}

async fn watch_unit(
	connection: &Connection,
	reporter: &Arc<Reporter>,
	scheduler: &Scheduler,
	state: &SharedState,
	unit_path: OwnedObjectPath,
	service: String,
) -> zbus::Result<()> {
	let unit = UnitProxy::builder(connection).path(unit_path)?.build().await?;

	let active_state = unit.active_state().await?;
	let sub_state = unit.sub_state().await?;
	apply_transition(reporter, state, &unit, &service, &active_state, &sub_state).await;

	let mut changes = unit.receive_active_state_changed().await;
	let reporter = reporter.clone();
	let state = state.clone();
	let service_name = service.clone();
	scheduler.add_task(async move {
		while let Some(change) = changes.next().await {
			let Ok(active_state) = change.get().await else { continue };
			let sub_state = unit.sub_state().await.unwrap_or_default();
			apply_transition(&reporter, &state, &unit, &service_name, &active_state, &sub_state).await;
		}
	});

	Ok(())
}

/// Record `active_state`/`sub_state` and notify on the two transitions the
/// spec cares about: entering `failed`, and recovering `failed -> active
/// (running)`. Everything else updates `state` silently.
async fn apply_transition(
	reporter: &Arc<Reporter>,
	state: &SharedState,
	unit: &UnitProxy<'_>,
	service: &str,
	active_state: &str,
	sub_state: &str,
) {
	let previous = {
		let guard = state.lock().expect("state lock poisoned");
		guard.get(service).cloned()
	};

	if previous.as_deref() != Some(active_state) {
		if active_state == "failed" {
			let mut report = HealthReport::new();
			report.status = HealthStatus::Error;
			report.description = Some(format!("{service} Service unhealthy"));
			report.details = Some(unit_diagnostic_excerpt(unit).await);
			tracing::error!(service, "{}", report.description.clone().unwrap_or_default());
			if let Err(err) = reporter.update_report(service, report) {
				tracing::warn!(service, error = %err, "failed to record systemd failure report");
			}
		} else if active_state == "active" && sub_state == "running" && previous.as_deref() == Some("failed") {
			tracing::info!(service, "service healthy");
			if let Err(err) = reporter.update_report(service, HealthReport::new()) {
				tracing::warn!(service, error = %err, "failed to record systemd recovery report");
			}
		}
		state.lock().expect("state lock poisoned").insert(service.to_string(), active_state.to_string());
	}
}

/// In lieu of a journal excerpt, read the unit's own `Result` and
/// `ExecMainStatus` properties over the same DBus connection — avoids
/// depending on `journalctl`/`libsystemd` for a handful of diagnostic lines.
async fn unit_diagnostic_excerpt(unit: &UnitProxy<'_>) -> String {
	let result = unit.result().await.unwrap_or_else(|_| "unknown".to_string());
	let exec_main_status = unit.exec_main_status().await.unwrap_or(-1);
	format!("systemd result={result} exec_main_status={exec_main_status}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allowlists_carry_original_service_names() {
		assert_eq!(CORE_ALLOWLIST.len(), 5);
		assert!(CORE_ALLOWLIST.contains(&"slurmctld.service"));
		assert!(GPU_ALLOWLIST.contains(&"nvidia-dcgm.service"));
	}
}
