//! Foreign-thread policy violation handoff.
//!
//! NVML delivers Xid/ECC events through a blocking `EventSet::wait` call, so
//! the only way to observe them without stalling the scheduler is a
//! dedicated OS thread. That thread is the "foreign thread" the spec worries
//! about: it must never touch the reporter directly, only hand a
//! [`PolicyViolation`] across a bounded channel for the async side to drain.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use healthagent_report::{FieldValue, HealthReport, HealthStatus};
use healthagent_reporter::Reporter;

/// One policy-violation callback's payload, already translated out of NVML's
/// event representation into something `Send` and channel-friendly.
#[derive(Debug, Clone)]
pub struct PolicyViolation {
	/// Condition name, e.g. `"DoubleBitEcc"`, `"PciReplay"`, `"Xid"`.
	pub condition: String,
	/// Index of the offending device.
	pub gpu_id: u32,
	/// One-line, human readable description of this specific occurrence.
	pub details: String,
	/// Condition-specific counters (`numerrors`, `replay_count`, ...).
	pub fields: BTreeMap<String, FieldValue>,
}

/// Capacity of the handoff channel. Matches the "bounded" requirement;
/// a full channel means the foreign thread drops the event rather than
/// blocking NVML's callback path.
const CHANNEL_CAPACITY: usize = 256;

/// Create a fresh bounded handoff channel. The sender is given to the
/// foreign (NVML event) thread; the receiver is polled by a scheduler
/// periodic on the async side.
#[must_use]
pub fn channel() -> (SyncSender<PolicyViolation>, Receiver<PolicyViolation>) {
	sync_channel(CHANNEL_CAPACITY)
}

/// Non-blocking send from the foreign thread. A full channel drops the
/// violation and logs rather than blocking the NVML event loop.
pub fn try_notify(tx: &SyncSender<PolicyViolation>, violation: PolicyViolation) {
	if let Err(TrySendError::Full(_)) = tx.try_send(violation) {
		tracing::warn!("policy violation channel full; dropping event");
	}
}

const REPORT_NAME: &str = "GPUPolicyChecks";

/// Drain every violation currently queued and fold it into the shared
/// `GPUPolicyChecks` report, rebuilding `details` from the full two-level
/// `custom_fields[condition][gpu_id]` accumulator each time, exactly as the
/// original Python implementation regenerates its details string.
pub fn drain_into_report(reporter: &Reporter, rx: &Receiver<PolicyViolation>) {
	let mut drained_any = false;
	let mut report = reporter.get_report(REPORT_NAME).unwrap_or_default();

	while let Ok(violation) = rx.try_recv() {
		drained_any = true;
		apply_violation(&mut report, violation);
	}

	if drained_any {
		if let Err(err) = reporter.update_report(REPORT_NAME, report) {
			tracing::warn!(error = %err, "failed to record GPU policy violation report");
		}
	}
}

fn apply_violation(report: &mut HealthReport, violation: PolicyViolation) {
	tracing::error!(condition = violation.condition, gpu = violation.gpu_id, "GPU policy violation detected");

	let condition_entry =
		report.custom_fields.entry(violation.condition.clone()).or_insert_with(|| FieldValue::Map(BTreeMap::new()));
	if !matches!(condition_entry, FieldValue::Map(_)) {
		*condition_entry = FieldValue::Map(BTreeMap::new());
	}
	if let FieldValue::Map(per_gpu) = condition_entry {
		record_gpu_entry(per_gpu, &violation);
	}

	report.status = HealthStatus::Error;
	report.description = Some("GPU Policy Violations detected".to_string());
	report.details = Some(rebuild_details(&report.custom_fields));
}

fn record_gpu_entry(per_gpu: &mut BTreeMap<String, FieldValue>, violation: &PolicyViolation) {
	let mut entry = violation.fields.clone();
	entry.insert("details".to_string(), FieldValue::String(violation.details.clone()));
	per_gpu.insert(violation.gpu_id.to_string(), FieldValue::Map(entry));
}

fn rebuild_details(custom_fields: &BTreeMap<String, FieldValue>) -> String {
	let mut lines = Vec::new();
	for value in custom_fields.values() {
		let FieldValue::Map(per_gpu) = value else { continue };
		for entry in per_gpu.values() {
			let FieldValue::Map(fields) = entry else { continue };
			if let Some(FieldValue::String(details)) = fields.get("details") {
				lines.push(details.clone());
			}
		}
	}
	lines.join("\n")
}

#[cfg(test)]
mod tests {
	use healthagent_scheduler::Scheduler;

	use super::*;

	fn reporter() -> Reporter {
		Reporter::new(Scheduler::new(), "/nonexistent/notifier")
	}

	#[test]
	fn drain_accumulates_two_level_custom_fields() {
		let (tx, rx) = channel();
		let r = reporter();

		let mut fields = BTreeMap::new();
		fields.insert("numerrors".to_string(), FieldValue::Int(3));
		try_notify(&tx, PolicyViolation {
			condition: "DoubleBitEcc".to_string(),
			gpu_id: 0,
			details: "Double-Bit ECC errors(3) found on GPU: 0".to_string(),
			fields,
		});

		drain_into_report(&r, &rx);

		let report = r.get_report(REPORT_NAME).unwrap();
		assert_eq!(report.status, HealthStatus::Error);
		assert!(report.details.unwrap().contains("Double-Bit ECC"));
		let FieldValue::Map(per_gpu) = report.custom_fields.get("DoubleBitEcc").unwrap() else {
			panic!("expected nested map")
		};
		assert!(per_gpu.contains_key("0"));
	}

	#[test]
	fn drain_with_nothing_queued_is_a_no_op() {
		let (_tx, rx) = channel();
		let r = reporter();
		drain_into_report(&r, &rx);
		assert!(r.get_report(REPORT_NAME).is_none());
	}

	#[test]
	fn details_regenerates_from_every_accumulated_entry() {
		let (tx, rx) = channel();
		let r = reporter();

		try_notify(&tx, PolicyViolation {
			condition: "Xid".to_string(),
			gpu_id: 0,
			details: "XID errors found: XID 79 on GPU 0".to_string(),
			fields: BTreeMap::new(),
		});
		try_notify(&tx, PolicyViolation {
			condition: "PciReplay".to_string(),
			gpu_id: 1,
			details: "PCI replay count(2) on GPU: 1".to_string(),
			fields: BTreeMap::new(),
		});

		drain_into_report(&r, &rx);
		let report = r.get_report(REPORT_NAME).unwrap();
		let details = report.details.unwrap();
		assert!(details.contains("XID 79"));
		assert!(details.contains("PCI replay"));
	}
}
