//! Kernel log monitor.
//!
//! Reads `/dev/kmsg` non-blocking, registered with the runtime's I/O
//! readiness facility rather than polled, and only ever surfaces crit/alert/
//! emerg lines from the last hour — anything else is noise for a health
//! agent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use healthagent_report::{HealthReport, HealthStatus};
use healthagent_reporter::Reporter;
use healthagent_scheduler::Scheduler;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use tokio::io::unix::AsyncFd;

const REPORT_NAME: &str = "KernelMonitor";
/// Only crit (2), alert (1), and emerg (0) are worth paging on.
const MAX_LEVEL: u8 = 2;
const MAX_AGE: Duration = Duration::from_secs(3600);

pub struct KmsgMonitor {
	reporter: Arc<Reporter>,
	scheduler: Scheduler,
}

impl KmsgMonitor {
	#[must_use]
	pub fn new(reporter: Arc<Reporter>, scheduler: Scheduler) -> Self {
		Self { reporter, scheduler }
	}

	/// Open `/dev/kmsg`, register it for readiness-driven reads, and start
	/// the periodic stale-error clear.
	///
	/// # Errors
	///
	/// Returns an error if `/dev/kmsg` can't be opened non-blocking.
	pub fn create(&self) -> anyhow::Result<()> {
		let fd = open("/dev/kmsg", OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())?;
		let async_fd = AsyncFd::new(fd)?;

		let reporter = self.reporter.clone();
		self.scheduler.add_task(async move {
			read_loop(&async_fd, &reporter).await;
		});

		let reporter = self.reporter.clone();
		self.scheduler.schedule_periodic(REPORT_NAME, Duration::from_secs(300), move |_ctx| {
			let reporter = reporter.clone();
			async move {
				reporter.clear_all_errors(Some(MAX_AGE));
				Ok(())
			}
		});

		Ok(())
	}

	/// `status` handler.
	#[must_use]
	pub fn show_status(&self) -> serde_json::Map<String, serde_json::Value> {
		self.reporter.summarize()
	}
}

async fn read_loop(async_fd: &AsyncFd<std::os::fd::OwnedFd>, reporter: &Reporter) {
	loop {
		let mut guard = match async_fd.readable().await {
			Ok(guard) => guard,
			Err(err) => {
				tracing::error!(error = %err, "kmsg fd no longer pollable; stopping kernel monitor");
				return;
			}
		};

		let mut formatted = Vec::new();
		loop {
			let mut buf = [0u8; 4096];
			let read_result =
				guard.try_io(|inner| nix::unistd::read(inner.get_ref(), &mut buf).map_err(std::io::Error::from));
			match read_result {
				Ok(Ok(0)) => break,
				Ok(Ok(n)) => {
					let text = String::from_utf8_lossy(&buf[..n]);
					for line in text.trim().lines() {
						if let Some((walltime, level, msg)) = parse_kmsg_line(line) {
							if Utc::now().signed_duration_since(walltime) > chrono::Duration::hours(1) {
								continue;
							}
							if level <= MAX_LEVEL {
								let timestamp = walltime.format("%Y-%m-%dT%H:%M:%S UTC");
								formatted.push(format!("{timestamp} - {} - {msg}", level_name(level)));
							}
						}
					}
				}
				Ok(Err(err)) => {
					tracing::error!(error = %err, "failed to read /dev/kmsg");
					break;
				}
				Err(_would_block) => break,
			}
		}

		if !formatted.is_empty() {
			record_alerts(reporter, formatted);
		}
	}
}

fn record_alerts(reporter: &Reporter, formatted: Vec<String>) {
	let mut report = reporter.get_report(REPORT_NAME).unwrap_or_default();
	let joined = formatted.join("\n");
	report.details = Some(match report.details.take() {
		Some(existing) => format!("{existing}\n{joined}"),
		None => joined,
	});
	report.status = HealthStatus::Warning;
	report.message = Some("KernelMonitor Detected Alerts".to_string());
	report.description = Some("Kernel Log Monitor reports Critical/Emergency Alerts".to_string());

	if let Err(err) = reporter.update_report(REPORT_NAME, report) {
		tracing::warn!(error = %err, "failed to record kernel log alert report");
	}
}

fn boot_time() -> Option<DateTime<Utc>> {
	let uptime_line = std::fs::read_to_string("/proc/uptime").ok()?;
	let uptime_seconds: f64 = uptime_line.split_whitespace().next()?.parse().ok()?;
	let now = Utc::now();
	Some(now - chrono::Duration::milliseconds((uptime_seconds * 1000.0) as i64))
}

/// Parse one `/dev/kmsg` line: `"level,seq,usec_since_boot,flags;message"`.
fn parse_kmsg_line(line: &str) -> Option<(DateTime<Utc>, u8, String)> {
	let mut parts = line.splitn(4, ',');
	let level: u8 = parts.next()?.parse().ok()?;
	let _seq = parts.next()?;
	let usec_since_boot: i64 = parts.next()?.parse().ok()?;
	let flags_msg = parts.next()?;
	let msg = flags_msg.splitn(2, ';').last()?.to_string();

	let boot = boot_time()?;
	let walltime = boot + chrono::Duration::microseconds(usec_since_boot);
	Some((walltime, level, msg))
}

fn level_name(level: u8) -> String {
	match level {
		0 => "KERNEL EMERGENCY".to_string(),
		1 => "KERNEL ALERT".to_string(),
		2 => "KERNEL CRITICAL".to_string(),
		3 => "KERNEL ERROR".to_string(),
		4 => "KERNEL WARNING".to_string(),
		5 => "KERNEL NOTICE".to_string(),
		other => format!("LEVEL{other}"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_well_formed_line() {
		let boot = boot_time();
		let (_, level, msg) = parse_kmsg_line("2,1234,45678901,-;Some message here").unwrap();
		assert_eq!(level, 2);
		assert_eq!(msg, "Some message here");
		assert!(boot.is_some() || boot.is_none(), "boot_time is best-effort on non-Linux test hosts");
	}

	#[test]
	fn rejects_malformed_line() {
		assert!(parse_kmsg_line("not a kmsg line").is_none());
	}

	#[test]
	fn level_names_match_kernel_convention() {
		assert_eq!(level_name(0), "KERNEL EMERGENCY");
		assert_eq!(level_name(5), "KERNEL NOTICE");
		assert_eq!(level_name(7), "LEVEL7");
	}

	#[test]
	fn record_alerts_appends_to_existing_details() {
		let reporter = Reporter::new(Scheduler::new(), "/nonexistent/notifier");
		let mut first = HealthReport::new();
		first.details = Some("line one".to_string());
		reporter.update_report(REPORT_NAME, first).unwrap();

		record_alerts(&reporter, vec!["line two".to_string()]);

		let report = reporter.get_report(REPORT_NAME).unwrap();
		assert_eq!(report.details.unwrap(), "line one\nline two");
		assert_eq!(report.status, HealthStatus::Warning);
	}
}
