//! Network interface monitor.
//!
//! Polls `/sys/class/net` on a fixed interval, tracking each interface's
//! carrier-down count in a [`SlidingStore`] so a flapping link can be told
//! apart from one that merely isn't up yet.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use healthagent_report::{FieldValue, HealthReport, HealthStatus};
use healthagent_reporter::Reporter;
use healthagent_scheduler::Scheduler;

const REPORT_NAME: &str = "Network";
const SYSFS_NET: &str = "/sys/class/net";

/// Kernel `ARPHRD_*` device type, parsed from sysfs `type`.
///
/// See `include/uapi/linux/if_arp.h` in the kernel sources for the full
/// enumeration; only the two types this agent cares about are named, and an
/// unrecognized value (including a parse failure) falls back to `Unknown`
/// rather than erroring, since this is purely informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetDevType {
	Ethernet,
	Infiniband,
	Unknown,
}

impl NetDevType {
	#[must_use]
	pub fn parse(raw: &str) -> Self {
		match raw.trim().parse::<i64>() {
			Ok(1) => Self::Ethernet,
			Ok(32) => Self::Infiniband,
			_ => Self::Unknown,
		}
	}
}

/// Physical link state, from sysfs `carrier`. `-1`/unreadable means
/// "we don't know", distinct from a confirmed-down link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
	Up,
	Down,
	Unknown,
}

impl Carrier {
	#[must_use]
	pub fn parse(raw: &str) -> Self {
		match raw.trim().parse::<i64>() {
			Ok(1) => Self::Up,
			Ok(0) => Self::Down,
			_ => Self::Unknown,
		}
	}

	#[must_use]
	pub fn as_i64(self) -> i64 {
		match self {
			Self::Up => 1,
			Self::Down => 0,
			Self::Unknown => -1,
		}
	}
}

/// RFC 2863 operational state, from sysfs `operstate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperState {
	Unknown,
	NotPresent,
	Down,
	LowerLayerDown,
	Testing,
	Dormant,
	Up,
}

impl OperState {
	#[must_use]
	pub fn parse(raw: &str) -> Self {
		match raw.trim().to_ascii_lowercase().as_str() {
			"notpresent" => Self::NotPresent,
			"down" => Self::Down,
			"lowerlayerdown" => Self::LowerLayerDown,
			"testing" => Self::Testing,
			"dormant" => Self::Dormant,
			"up" => Self::Up,
			_ => Self::Unknown,
		}
	}

	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Unknown => "unknown",
			Self::NotPresent => "notpresent",
			Self::Down => "down",
			Self::LowerLayerDown => "lowerlayerdown",
			Self::Testing => "testing",
			Self::Dormant => "dormant",
			Self::Up => "up",
		}
	}
}

/// Snapshot of one interface's sysfs attributes.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
	pub name: String,
	pub device: PathBuf,
	pub r#type: NetDevType,
	pub operstate: OperState,
	pub carrier: Carrier,
	/// `-1` when unreadable.
	pub carrier_changes: i64,
	/// `-1` when unreadable.
	pub carrier_down_count: i64,
}

/// Per-key bounded FIFO of the last `window` samples, used to compute a
/// rate of change (last sample minus first) without unbounded memory growth.
pub struct SlidingStore<K, V> {
	window: usize,
	store: HashMap<K, VecDeque<V>>,
}

impl<K: std::hash::Hash + Eq, V: Copy + std::ops::Sub<Output = V> + Default> SlidingStore<K, V> {
	#[must_use]
	pub fn new(window: usize) -> Self {
		Self { window, store: HashMap::new() }
	}

	pub fn put(&mut self, key: K, value: V) {
		let deque = self.store.entry(key).or_insert_with(|| VecDeque::with_capacity(self.window));
		if deque.len() == self.window {
			deque.pop_front();
		}
		deque.push_back(value);
	}

	/// `last - first` over the retained window; `0` (via `V::default()`)
	/// when fewer than two samples have been recorded.
	#[must_use]
	pub fn rate(&self, key: &K) -> V {
		let Some(deque) = self.store.get(key) else { return V::default() };
		if deque.len() < 2 {
			return V::default();
		}
		*deque.back().unwrap() - *deque.front().unwrap()
	}
}

pub struct NetworkMonitor {
	reporter: Arc<Reporter>,
	scheduler: Scheduler,
	sysfs: PathBuf,
	timestore: Mutex<SlidingStore<String, i64>>,
	interval: Duration,
}

impl NetworkMonitor {
	/// `window` bounds how many carrier-down samples are kept per interface;
	/// `interval` is how often the sysfs poll runs. Both are explicit
	/// configuration rather than compiled-in constants.
	#[must_use]
	pub fn new(reporter: Arc<Reporter>, scheduler: Scheduler, window: usize, interval: Duration) -> Self {
		Self {
			reporter,
			scheduler,
			sysfs: PathBuf::from(SYSFS_NET),
			timestore: Mutex::new(SlidingStore::new(window)),
			interval,
		}
	}

	pub fn create(self: &Arc<Self>) {
		self.reporter.clear_all_errors(None);
		let this = self.clone();
		self.scheduler.schedule_periodic(REPORT_NAME, this.interval, move |_ctx| {
			let this = this.clone();
			async move {
				this.run_network_checks();
				Ok(())
			}
		});
	}

	/// `status` handler.
	#[must_use]
	pub fn show_status(&self) -> serde_json::Map<String, serde_json::Value> {
		self.reporter.summarize()
	}

	fn list_interfaces(&self, include_virtual: bool) -> Vec<PathBuf> {
		let Ok(entries) = std::fs::read_dir(&self.sysfs) else { return Vec::new() };
		let mut names = Vec::new();
		for entry in entries.flatten() {
			let path = entry.path();
			if std::fs::symlink_metadata(&path).is_ok_and(|m| !m.file_type().is_symlink()) {
				continue;
			}
			let Ok(resolved) = std::fs::canonicalize(&path) else { continue };
			let is_virtual = resolved.to_string_lossy().contains("/virtual/");
			if !include_virtual && is_virtual {
				continue;
			}
			names.push(resolved);
		}
		names
	}

	/// Uptime in hours, or `None` if `/proc/uptime` is unreadable.
	#[must_use]
	pub fn uptime_hours() -> Option<f64> {
		let contents = std::fs::read_to_string("/proc/uptime").ok()?;
		let seconds: f64 = contents.split_whitespace().next()?.parse().ok()?;
		Some((seconds / 3600.0 * 100.0).round() / 100.0)
	}

	fn get_network_state(&self) -> Vec<NetworkInterface> {
		let mut interfaces = Vec::new();
		let mut timestore = self.timestore.lock().expect("timestore lock poisoned");

		for device in self.list_interfaces(false) {
			let name = device.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

			let operstate = read_attr(&device, "operstate").map(|v| OperState::parse(&v)).unwrap_or(OperState::Unknown);
			let carrier = if operstate == OperState::Down {
				tracing::info!(interface = name, "interface is administratively down");
				Carrier::Unknown
			} else {
				read_attr(&device, "carrier").map(|v| Carrier::parse(&v)).unwrap_or(Carrier::Unknown)
			};

			let r#type = read_attr(&device, "type").map(|v| NetDevType::parse(&v)).unwrap_or(NetDevType::Unknown);
			let carrier_changes = read_attr(&device, "carrier_changes").and_then(|v| v.parse().ok()).unwrap_or(-1);
			let carrier_down_count = read_attr(&device, "carrier_down_count").and_then(|v| v.parse().ok()).unwrap_or(-1);
			if carrier_down_count >= 0 {
				timestore.put(name.clone(), carrier_down_count);
			}

			interfaces.push(NetworkInterface { name, device, r#type, operstate, carrier, carrier_changes, carrier_down_count });
		}
		interfaces
	}

	fn run_network_checks(&self) {
		let interfaces = self.get_network_state();
		let uptime = Self::uptime_hours();
		let timestore = self.timestore.lock().expect("timestore lock poisoned");

		let mut report = HealthReport::new();
		let mut unop = Vec::new();
		let mut msgs = Vec::new();
		let mut custom_fields = BTreeMap::new();

		for iface in &interfaces {
			let mut fields = BTreeMap::new();
			let link_down_rate = timestore.rate(&iface.name);
			fields.insert("link_down_rate_per_hour".to_string(), FieldValue::Int(link_down_rate));
			fields.insert("link_flap_since_uptime".to_string(), FieldValue::Int(iface.carrier_changes));

			if link_down_rate >= 1 {
				msgs.push(format!("Network interface {} went down {link_down_rate} times in the last hour", iface.name));
				if report.status == HealthStatus::Ok {
					report.status = HealthStatus::Warning;
				}
			}

			if iface.operstate != OperState::Up {
				fields.insert("error_count".to_string(), FieldValue::Int(1));
				fields.insert("carrier".to_string(), FieldValue::Int(iface.carrier.as_i64()));
				unop.push(iface.name.clone());
				msgs.push(format!(
					"Network interface {} is not operational and in state {}.",
					iface.name,
					iface.operstate.as_str()
				));
				report.status = HealthStatus::Error;
			}

			custom_fields.insert(iface.name.clone(), FieldValue::Map(fields));
		}

		if let Some(uptime) = uptime {
			custom_fields.insert("uptime_hours".to_string(), FieldValue::Float(uptime));
		}

		if !msgs.is_empty() {
			report.details = Some(msgs.join("\n"));
		}
		report.custom_fields = custom_fields;
		if report.status != HealthStatus::Ok {
			report.description = Some(if unop.is_empty() {
				"Network Warnings".to_string()
			} else {
				format!("Network interfaces {} are not operational", unop.join(","))
			});
		}

		if let Err(err) = self.reporter.update_report(REPORT_NAME, report) {
			tracing::warn!(error = %err, "failed to record network health report");
		}
	}
}

fn read_attr(device: &Path, attr: &str) -> Option<String> {
	std::fs::read_to_string(device.join(attr)).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn net_dev_type_falls_back_to_unknown() {
		assert_eq!(NetDevType::parse("1"), NetDevType::Ethernet);
		assert_eq!(NetDevType::parse("32"), NetDevType::Infiniband);
		assert_eq!(NetDevType::parse("999"), NetDevType::Unknown);
		assert_eq!(NetDevType::parse("garbage"), NetDevType::Unknown);
	}

	#[test]
	fn carrier_falls_back_to_unknown() {
		assert_eq!(Carrier::parse("1"), Carrier::Up);
		assert_eq!(Carrier::parse("0"), Carrier::Down);
		assert_eq!(Carrier::parse("weird"), Carrier::Unknown);
		assert_eq!(Carrier::Unknown.as_i64(), -1);
	}

	#[test]
	fn operstate_falls_back_to_unknown() {
		assert_eq!(OperState::parse("UP"), OperState::Up);
		assert_eq!(OperState::parse("lowerlayerdown"), OperState::LowerLayerDown);
		assert_eq!(OperState::parse("bogus"), OperState::Unknown);
	}

	#[test]
	fn sliding_store_rate_needs_two_samples() {
		let mut store: SlidingStore<String, i64> = SlidingStore::new(3);
		assert_eq!(store.rate(&"eth0".to_string()), 0);
		store.put("eth0".to_string(), 5);
		assert_eq!(store.rate(&"eth0".to_string()), 0, "single sample has no rate yet");
		store.put("eth0".to_string(), 8);
		assert_eq!(store.rate(&"eth0".to_string()), 3);
	}

	#[test]
	fn sliding_store_evicts_beyond_window() {
		let mut store: SlidingStore<String, i64> = SlidingStore::new(2);
		store.put("eth0".to_string(), 1);
		store.put("eth0".to_string(), 2);
		store.put("eth0".to_string(), 10);
		// window of 2 means sample `1` was evicted; rate is 10 - 2.
		assert_eq!(store.rate(&"eth0".to_string()), 8);
	}
}
