//! Abstraction over the GPU vendor library.
//!
//! Mirrors the shape of [`healthagent_scheduler::pool::PoolJob`]'s isolation
//! concern one level up: the monitor never talks to NVML directly, only
//! through this trait, so tests and `DCGM_TEST_MODE` deployments can run
//! without a GPU present.

use healthagent_report::{FieldValue, HealthReport, HealthStatus};

/// One device's aggregate health, as seen by a background check.
#[derive(Debug, Clone)]
pub struct GroupHealth {
	/// Overall status across every watched device.
	pub status: HealthStatus,
	/// Per-incident human-readable messages.
	pub incidents: Vec<String>,
	/// Coarse subsystem tags for the incidents above (`"Thermal"`, `"Clocks"`, ...).
	pub categories: Vec<String>,
}

/// Error returned by a [`GpuBackend`] operation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
	/// The handle to the vendor library is no longer valid and must be
	/// reconnected before retrying.
	#[error("connection to GPU vendor library is no longer valid")]
	ConnectionNotValid,
	/// Any other backend failure, not worth distinguishing further.
	#[error("GPU backend error: {0}")]
	Other(String),
}

/// What the monitor needs from the vendor library: group health polling and
/// an exclusive-access diagnostic pass.
pub trait GpuBackend: Send {
	/// Re-establish the connection to the vendor library.
	///
	/// # Errors
	///
	/// Returns [`BackendError`] if no device can be reached.
	fn reconnect(&mut self) -> Result<(), BackendError>;

	/// Non-exclusive health snapshot, safe to call while jobs are running.
	///
	/// # Errors
	///
	/// Returns [`BackendError::ConnectionNotValid`] if the handle has gone
	/// stale (the caller should reconnect and retry once).
	fn health_check(&self) -> Result<GroupHealth, BackendError>;

	/// Exclusive diagnostic pass, run from inside a pool worker since it may
	/// block for minutes and needs sole access to the devices.
	///
	/// # Errors
	///
	/// Returns [`BackendError`] if the diagnostic pass itself could not run
	/// (distinct from the diagnostic finding problems, which is reported
	/// through the returned [`HealthReport`]).
	fn run_diagnostics(&self) -> Result<HealthReport, BackendError>;
}

/// Deterministic backend used under `DCGM_TEST_MODE=true` or when no NVIDIA
/// device is present, so the monitor can be exercised without a GPU.
#[derive(Debug, Default, Clone)]
pub struct StubGpuBackend {
	/// Canned response for [`GpuBackend::health_check`].
	pub health: GroupHealth,
}

impl Default for GroupHealth {
	fn default() -> Self {
		Self { status: HealthStatus::Ok, incidents: Vec::new(), categories: Vec::new() }
	}
}

impl GpuBackend for StubGpuBackend {
	fn reconnect(&mut self) -> Result<(), BackendError> {
		Ok(())
	}

	fn health_check(&self) -> Result<GroupHealth, BackendError> {
		Ok(self.health.clone())
	}

	fn run_diagnostics(&self) -> Result<HealthReport, BackendError> {
		Ok(HealthReport::new())
	}
}

/// Live backend backed by `nvml-wrapper`.
pub struct NvmlBackend {
	nvml: nvml_wrapper::Nvml,
}

impl NvmlBackend {
	/// Initialize a fresh NVML handle.
	///
	/// # Errors
	///
	/// Returns [`BackendError`] if the driver library can't be loaded or no
	/// device responds.
	pub fn connect() -> Result<Self, BackendError> {
		let nvml = nvml_wrapper::Nvml::init().map_err(|e| BackendError::Other(e.to_string()))?;
		Ok(Self { nvml })
	}

	fn devices(&self) -> Result<Vec<nvml_wrapper::Device<'_>>, BackendError> {
		let count = self.nvml.device_count().map_err(|e| BackendError::Other(e.to_string()))?;
		(0..count)
			.map(|i| self.nvml.device_by_index(i).map_err(|e| BackendError::Other(e.to_string())))
			.collect()
	}
}

impl GpuBackend for NvmlBackend {
	fn reconnect(&mut self) -> Result<(), BackendError> {
		*self = Self::connect()?;
		Ok(())
	}

	fn health_check(&self) -> Result<GroupHealth, BackendError> {
		let devices = self.devices()?;
		let mut incidents = Vec::new();
		let mut categories = Vec::new();

		for (index, device) in devices.iter().enumerate() {
			let temperature = device
				.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu)
				.map_err(|e| BackendError::Other(e.to_string()))?;
			let slowdown_temp = device
				.temperature_threshold(nvml_wrapper::enum_wrappers::device::TemperatureThreshold::Slowdown)
				.unwrap_or(slowdown_temp_fallback());
			if f64::from(temperature) >= 0.95 * f64::from(slowdown_temp) {
				incidents.push(format!(
					"GPU {index} temperature {temperature}C is within 5% of the slowdown threshold {slowdown_temp}C"
				));
				categories.push("Thermal".to_string());
			}

			if let Ok(mode) = device.persistence_mode() {
				if mode != nvml_wrapper::bitmasks::device::PersistenceMode::Enabled {
					incidents.push(format!(
						"Persistence mode not set for GPU {index}; restart nvidia-persistenced or reboot"
					));
					categories.push("System".to_string());
				}
			}
		}

		let status = if incidents.is_empty() { HealthStatus::Ok } else { HealthStatus::Error };
		Ok(GroupHealth { status, incidents, categories })
	}

	fn run_diagnostics(&self) -> Result<HealthReport, BackendError> {
		let devices = self.devices()?;
		let mut failures = Vec::new();

		for (index, device) in devices.iter().enumerate() {
			if let Ok(util) = device.utilization_rates() {
				if util.memory == 100 {
					failures.push(format!("GPU {index} reports saturated memory bandwidth during diagnostic pass"));
				}
			}
			if let Ok(info) = device.memory_info() {
				if info.free == 0 {
					failures.push(format!("GPU {index} has no free device memory"));
				}
			}
		}

		let mut report = HealthReport::new();
		if !failures.is_empty() {
			report.status = HealthStatus::Error;
			report.message = Some("GPU Epilog Errors".to_string());
			report.description = Some(format!("DCGM-equivalent epilog failures on {} device(s)", failures.len()));
			report.details = Some(failures.join("\n"));
			report
				.custom_fields
				.insert("error_count".to_string(), FieldValue::Int(failures.len() as i64));
		}
		Ok(report)
	}
}

fn slowdown_temp_fallback() -> u32 {
	95
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stub_backend_returns_default_ok_health() {
		let backend = StubGpuBackend::default();
		let health = backend.health_check().unwrap();
		assert_eq!(health.status, HealthStatus::Ok);
	}

	#[test]
	fn stub_backend_reflects_configured_health() {
		let backend = StubGpuBackend {
			health: GroupHealth {
				status: HealthStatus::Error,
				incidents: vec!["double-bit ECC error on GPU 0".to_string()],
				categories: vec!["Memory".to_string()],
			},
		};
		let health = backend.health_check().unwrap();
		assert_eq!(health.status, HealthStatus::Error);
		assert_eq!(health.incidents.len(), 1);
	}
}
