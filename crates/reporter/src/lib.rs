//! Debounced, persisted store of per-module [`HealthReport`]s.
//!
//! One [`Reporter`] is owned by each monitor. Writes go through
//! [`Reporter::update_report`], which only forwards a change to the external
//! notifier when the new report actually differs from the one on file —
//! every other write just refreshes the stored timestamp.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use healthagent_report::{HealthReport, HealthStatus};
use healthagent_scheduler::{Scheduler, SubprocessSpec};
use serde::{Deserialize, Serialize};

/// Name of the environment variable that enables external notification.
pub const PUBLISH_CC_ENV: &str = "PUBLISH_CC";

/// Shared, mutex-guarded map from subsystem name to its latest report, plus
/// the machinery to debounce and externally announce changes.
pub struct Reporter {
	store: Mutex<BTreeMap<String, HealthReport>>,
	scheduler: Scheduler,
	notifier_path: PathBuf,
	publish_external: bool,
}

/// On-disk envelope for a persisted [`Reporter`]. `version` lets a future
/// incompatible encoding be detected instead of silently misparsed.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStore {
	version: u32,
	reports: BTreeMap<String, HealthReport>,
}

const PERSIST_VERSION: u32 = 1;

impl Reporter {
	/// Build a reporter with an empty store. `publish_external` is resolved
	/// once here: the `PUBLISH_CC` environment variable must be truthy *and*
	/// `notifier_path` must exist on disk, mirroring the original agent's
	/// expectation that the notifier binary may be entirely absent on a
	/// non-Cycle host.
	#[must_use]
	pub fn new(scheduler: Scheduler, notifier_path: impl Into<PathBuf>) -> Self {
		let notifier_path = notifier_path.into();
		let publish_env = std::env::var(PUBLISH_CC_ENV)
			.map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
			.unwrap_or(false);
		let publish_external = publish_env && notifier_path.exists();
		if publish_env && !publish_external {
			tracing::warn!(path = %notifier_path.display(), "PUBLISH_CC set but notifier binary missing; external notification disabled");
		}
		Self {
			store: Mutex::new(BTreeMap::new()),
			scheduler,
			notifier_path,
			publish_external,
		}
	}

	/// Load a previously persisted store from `path`, falling back to an
	/// empty one on any I/O or parse failure (logged, never fatal: a missing
	/// or corrupt module file must not prevent the agent from starting).
	#[must_use]
	pub fn load(scheduler: Scheduler, notifier_path: impl Into<PathBuf>, path: &Path) -> Self {
		let mut reporter = Self::new(scheduler, notifier_path);
		match std::fs::read_to_string(path) {
			Ok(contents) => match serde_json::from_str::<PersistedStore>(&contents) {
				Ok(persisted) if persisted.version == PERSIST_VERSION => {
					reporter.store = Mutex::new(persisted.reports);
				}
				Ok(persisted) => {
					tracing::warn!(
						path = %path.display(),
						found = persisted.version,
						expected = PERSIST_VERSION,
						"unsupported reporter store version; starting empty"
					);
				}
				Err(err) => {
					tracing::warn!(path = %path.display(), error = %err, "failed to parse persisted reporter store; starting empty");
				}
			},
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
			Err(err) => {
				tracing::warn!(path = %path.display(), error = %err, "failed to read persisted reporter store; starting empty");
			}
		}
		reporter
	}

	/// Write the current store to `path` as a versioned JSON envelope.
	///
	/// # Errors
	///
	/// Returns an error if the store can't be serialized or `path` can't be
	/// written.
	pub fn save(&self, path: &Path) -> anyhow::Result<()> {
		let reports = self.store.lock().expect("reporter store lock poisoned").clone();
		let envelope = PersistedStore { version: PERSIST_VERSION, reports };
		let encoded = serde_json::to_string_pretty(&envelope)?;
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(path, encoded)?;
		Ok(())
	}

	/// Deep copy of the stored report for `name`, or `None` if never set.
	#[must_use]
	pub fn get_report(&self, name: &str) -> Option<HealthReport> {
		self.store.lock().expect("reporter store lock poisoned").get(name).cloned()
	}

	/// Flattened `name -> view()` map of every stored report.
	#[must_use]
	pub fn summarize(&self) -> serde_json::Map<String, serde_json::Value> {
		let store = self.store.lock().expect("reporter store lock poisoned");
		store
			.iter()
			.map(|(name, report)| (name.clone(), serde_json::Value::Object(report.view())))
			.collect()
	}

	/// Insert or refresh the report stored under `name`.
	///
	/// Assigns a default message when a WARNING/ERROR report omits one,
	/// stamps `last_update`, and — only when the report actually differs
	/// (per [`HealthReport`]'s timestamp-ignoring equality) from what's
	/// already stored — enqueues a best-effort external notification.
	/// A report that compares equal to the stored one just gets its
	/// timestamp refreshed; no notification is sent, satisfying the
	/// debounce invariant.
	///
	/// # Errors
	///
	/// Returns an error if `name` is empty.
	pub fn update_report(&self, name: &str, mut report: HealthReport) -> anyhow::Result<()> {
		if name.is_empty() {
			anyhow::bail!("report name must not be empty");
		}

		if matches!(report.status, HealthStatus::Warning | HealthStatus::Error)
			&& report.message.as_deref().is_none_or(str::is_empty)
		{
			let verb = if report.status == HealthStatus::Warning { "warnings" } else { "errors" };
			report.message = Some(format!("{name} reports {verb}"));
		}
		report.last_update = Utc::now();

		let changed = {
			let mut store = self.store.lock().expect("reporter store lock poisoned");
			match store.get(name) {
				Some(existing) if *existing == report => {
					store.get_mut(name).expect("just matched").last_update = report.last_update;
					false
				}
				_ => {
					store.insert(name.to_string(), report.clone());
					true
				}
			}
		};

		if changed && self.publish_external {
			self.notify_external(name, &report);
		}

		Ok(())
	}

	/// Overwrite every stored report with a fresh OK report, but only when
	/// `age` is `None` or the stored report is older than `age`. Each
	/// overwrite still goes through [`Reporter::update_report`], so it
	/// debounces and notifies exactly like any other write.
	pub fn clear_all_errors(&self, age: Option<Duration>) {
		let names: Vec<String> = {
			let store = self.store.lock().expect("reporter store lock poisoned");
			store
				.iter()
				.filter(|(_, report)| match age {
					None => true,
					Some(age) => {
						Utc::now().signed_duration_since(report.last_update)
							> chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX)
					}
				})
				.map(|(name, _)| name.clone())
				.collect()
		};
		for name in names {
			if let Err(err) = self.update_report(&name, HealthReport::new()) {
				tracing::warn!(name, error = %err, "failed to clear report");
			}
		}
	}

	fn notify_external(&self, name: &str, report: &HealthReport) {
		let mut argv = vec![
			self.notifier_path.display().to_string(),
			"condition".to_string(),
			"set".to_string(),
			"-n".to_string(),
			name.to_string(),
			"-s".to_string(),
			report.status.as_wire_str().to_string(),
		];
		if report.status != HealthStatus::Ok {
			if let Some(message) = &report.message {
				argv.push("-m".to_string());
				argv.push(message.clone());
			}
			if let Some(description) = &report.description {
				argv.push("-d".to_string());
				argv.push(description.clone());
			}
			if let Some(recommendations) = &report.recommendations {
				argv.push("-r".to_string());
				argv.push(recommendations.clone());
			}
			if let Some(details) = &report.details {
				argv.push("--details".to_string());
				argv.push(details.clone());
			}
		}

		let spec = SubprocessSpec { argv };
		let scheduler = self.scheduler.clone();
		let name = name.to_string();
		self.scheduler.add_task(async move {
			match scheduler.run_subprocess(&spec).await {
				Ok(out) if !out.success() => {
					tracing::warn!(name, status = %out.status, stderr = %String::from_utf8_lossy(&out.stderr), "notifier exited non-zero");
				}
				Ok(_) => {}
				Err(err) => tracing::warn!(name, error = %err, "failed to spawn notifier"),
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use healthagent_report::FieldValue;
	use tempfile::tempdir;

	use super::*;

	fn reporter() -> Reporter {
		Reporter::new(Scheduler::new(), PathBuf::from("/nonexistent/notifier"))
	}

	#[test]
	fn update_report_assigns_default_message_for_warning() {
		let r = reporter();
		let mut report = HealthReport::new();
		report.status = HealthStatus::Warning;
		r.update_report("gpu", report).unwrap();
		assert_eq!(r.get_report("gpu").unwrap().message.as_deref(), Some("gpu reports warnings"));
	}

	#[test]
	fn update_report_debounces_identical_reports() {
		let r = reporter();
		let mut report = HealthReport::new();
		report.status = HealthStatus::Error;
		report.message = Some("boom".to_string());
		r.update_report("gpu", report.clone()).unwrap();
		let first_stamp = r.get_report("gpu").unwrap().last_update;

		std::thread::sleep(Duration::from_millis(5));
		r.update_report("gpu", report).unwrap();
		let second_stamp = r.get_report("gpu").unwrap().last_update;

		assert!(second_stamp > first_stamp, "timestamp still refreshes on a debounced write");
	}

	#[test]
	fn update_report_rejects_empty_name() {
		let r = reporter();
		assert!(r.update_report("", HealthReport::new()).is_err());
	}

	#[test]
	fn clear_all_errors_respects_age_threshold() {
		let r = reporter();
		let mut old = HealthReport::new();
		old.status = HealthStatus::Error;
		old.custom_fields.insert("marker".to_string(), FieldValue::Int(1));
		r.update_report("old", old).unwrap();

		let mut fresh = HealthReport::new();
		fresh.status = HealthStatus::Error;
		r.update_report("fresh", fresh.clone()).unwrap();

		// Backdate "old" below the store lock, simulating the passage of time.
		{
			let mut store = r.store.lock().unwrap();
			store.get_mut("old").unwrap().last_update = Utc::now() - chrono::Duration::hours(2);
		}

		r.clear_all_errors(Some(Duration::from_secs(3600)));

		assert_eq!(r.get_report("old").unwrap().status, HealthStatus::Ok, "stale error cleared");
		assert_eq!(r.get_report("fresh").unwrap().status, HealthStatus::Error, "recent error untouched");
		let _ = fresh;
	}

	#[test]
	fn summarize_flattens_every_stored_report() {
		let r = reporter();
		r.update_report("a", HealthReport::new()).unwrap();
		r.update_report("b", HealthReport::new()).unwrap();
		let summary = r.summarize();
		assert_eq!(summary.len(), 2);
		assert!(summary["a"].is_object());
	}

	#[test]
	fn save_and_load_round_trip() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("gpu.json");

		let r = reporter();
		let mut report = HealthReport::new();
		report.status = HealthStatus::Warning;
		r.update_report("gpu", report).unwrap();
		r.save(&path).unwrap();

		let loaded = Reporter::load(Scheduler::new(), PathBuf::from("/nonexistent/notifier"), &path);
		assert_eq!(loaded.get_report("gpu").unwrap().status, HealthStatus::Warning);
	}

	#[test]
	fn load_falls_back_to_empty_on_missing_file() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("missing.json");
		let loaded = Reporter::load(Scheduler::new(), PathBuf::from("/nonexistent/notifier"), &path);
		assert!(loaded.summarize().is_empty());
	}

	#[test]
	fn load_falls_back_to_empty_on_corrupt_file() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("corrupt.json");
		std::fs::write(&path, b"not json").unwrap();
		let loaded = Reporter::load(Scheduler::new(), PathBuf::from("/nonexistent/notifier"), &path);
		assert!(loaded.summarize().is_empty());
	}
}
