//! Per-subsystem health report value type.
//!
//! A [`HealthReport`] is the unit of state every monitor produces and the
//! [`healthagent_reporter`](https://docs.rs/healthagent-reporter) crate
//! stores one per subsystem name.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a subsystem's current health.
///
/// Ordered by severity for display purposes only; the reporter's change
/// detection always compares whole reports by equality, never by ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
	/// Subsystem is healthy.
	#[serde(rename = "OK")]
	Ok,
	/// Subsystem reports a non-fatal degradation.
	#[serde(rename = "Warning")]
	Warning,
	/// Subsystem reports a failure.
	#[serde(rename = "Error")]
	Error,
	/// Subsystem status is unknown/not applicable.
	#[serde(rename = "NA")]
	Na,
}

impl Default for HealthStatus {
	fn default() -> Self {
		Self::Ok
	}
}

impl HealthStatus {
	/// The string the external notifier CLI expects for `-s`.
	#[must_use]
	pub fn as_wire_str(self) -> &'static str {
		match self {
			Self::Ok => "OK",
			Self::Warning => "Warning",
			Self::Error => "Error",
			Self::Na => "NA",
		}
	}
}

/// A JSON-safe value for [`HealthReport::custom_fields`].
///
/// Replaces the dynamically-typed `Any` the original implementation stashes
/// in `custom_fields`; every variant here has one unambiguous JSON rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
	/// Absent value. Dropped by [`HealthReport::view`].
	Null,
	/// Boolean scalar.
	Bool(bool),
	/// Signed integer scalar.
	Int(i64),
	/// Floating-point scalar.
	Float(f64),
	/// String scalar.
	String(String),
	/// UTC timestamp, rendered as ISO-8601 in [`FieldValue::to_json`].
	Timestamp(DateTime<Utc>),
	/// Ordered list. Also used to represent sets (order is not significant).
	List(Vec<FieldValue>),
	/// Nested string-keyed map.
	Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
	/// Convert to a `serde_json::Value`, applying the JSON-safe conversion
	/// rules from the spec: enums/sets/timestamps become plain scalars.
	#[must_use]
	pub fn to_json(&self) -> serde_json::Value {
		match self {
			Self::Null => serde_json::Value::Null,
			Self::Bool(b) => serde_json::Value::Bool(*b),
			Self::Int(i) => serde_json::Value::from(*i),
			Self::Float(f) => serde_json::Number::from_f64(*f)
				.map(serde_json::Value::Number)
				.unwrap_or(serde_json::Value::Null),
			Self::String(s) => serde_json::Value::String(s.clone()),
			Self::Timestamp(ts) => {
				serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
			}
			Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
			Self::Map(map) => {
				let obj = map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
				serde_json::Value::Object(obj)
			}
		}
	}

	/// True if this value is semantically absent (spec: only `null` is
	/// dropped by `view()`; an empty string is kept).
	#[must_use]
	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}
}

impl From<bool> for FieldValue {
	fn from(v: bool) -> Self {
		Self::Bool(v)
	}
}

impl From<i64> for FieldValue {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<u32> for FieldValue {
	fn from(v: u32) -> Self {
		Self::Int(i64::from(v))
	}
}

impl From<u64> for FieldValue {
	fn from(v: u64) -> Self {
		Self::Int(v as i64)
	}
}

impl From<f64> for FieldValue {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

impl From<String> for FieldValue {
	fn from(v: String) -> Self {
		Self::String(v)
	}
}

impl From<&str> for FieldValue {
	fn from(v: &str) -> Self {
		Self::String(v.to_string())
	}
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
	fn from(v: Vec<T>) -> Self {
		Self::List(v.into_iter().map(Into::into).collect())
	}
}

/// Status and detail of one subsystem, as last reported by its monitor.
///
/// Equality (`PartialEq`) ignores `last_update` so that a reporter can detect
/// whether a newly produced report is a genuine change from the stored one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
	/// Current severity.
	pub status: HealthStatus,
	/// Short, human-readable summary. Auto-filled by the reporter for
	/// WARNING/ERROR reports that don't set one.
	pub message: Option<String>,
	/// One-line description of the condition.
	pub description: Option<String>,
	/// Detailed, possibly multi-line, diagnostic text.
	pub details: Option<String>,
	/// Suggested remediation steps.
	pub recommendations: Option<String>,
	/// Module-specific structured data, flattened into [`HealthReport::view`].
	pub custom_fields: BTreeMap<String, FieldValue>,
	/// UTC timestamp of the last store write. Never absent.
	pub last_update: DateTime<Utc>,
}

impl Default for HealthReport {
	fn default() -> Self {
		Self::new()
	}
}

impl HealthReport {
	/// Create a fresh OK report stamped with the current time.
	#[must_use]
	pub fn new() -> Self {
		Self {
			status: HealthStatus::Ok,
			message: None,
			description: None,
			details: None,
			recommendations: None,
			custom_fields: BTreeMap::new(),
			last_update: Utc::now(),
		}
	}

	/// Explicit field accessor, replacing the Python fallback of reading
	/// arbitrary attributes out of `custom_fields`.
	#[must_use]
	pub fn field(&self, name: &str) -> Option<&FieldValue> {
		self.custom_fields.get(name)
	}

	/// Flatten into a JSON-safe view: `custom_fields` are merged into the
	/// top level (shadowing same-named base fields), then every `null`
	/// entry is dropped. Idempotent: calling `view()` again on the result
	/// changes nothing because there is no nested `custom_fields` key left
	/// to flatten.
	#[must_use]
	pub fn view(&self) -> serde_json::Map<String, serde_json::Value> {
		let mut base = serde_json::Map::new();
		base.insert(
			"status".to_string(),
			serde_json::Value::String(self.status.as_wire_str().to_string()),
		);
		base.insert(
			"message".to_string(),
			self.message.clone().map_or(serde_json::Value::Null, serde_json::Value::String),
		);
		base.insert(
			"description".to_string(),
			self.description
				.clone()
				.map_or(serde_json::Value::Null, serde_json::Value::String),
		);
		base.insert(
			"details".to_string(),
			self.details.clone().map_or(serde_json::Value::Null, serde_json::Value::String),
		);
		base.insert(
			"recommendations".to_string(),
			self.recommendations
				.clone()
				.map_or(serde_json::Value::Null, serde_json::Value::String),
		);
		base.insert(
			"last_update".to_string(),
			serde_json::Value::String(self.last_update.to_rfc3339_opts(SecondsFormat::Secs, true)),
		);

		for (key, value) in &self.custom_fields {
			base.insert(key.clone(), value.to_json());
		}

		base.retain(|_, v| !v.is_null());
		base
	}
}

impl PartialEq for HealthReport {
	fn eq(&self, other: &Self) -> bool {
		self.status == other.status
			&& self.message == other.message
			&& self.description == other.description
			&& self.details == other.details
			&& self.recommendations == other.recommendations
			&& self.custom_fields == other.custom_fields
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn equality_ignores_last_update() {
		let a = HealthReport::new();
		let mut b = HealthReport::new();
		b.last_update = a.last_update + chrono::Duration::hours(1);
		assert_eq!(a, b);
	}

	#[test]
	fn view_drops_null_keeps_empty_string() {
		let mut r = HealthReport::new();
		r.message = Some(String::new());
		let view = r.view();
		assert_eq!(view.get("message"), Some(&serde_json::Value::String(String::new())));
		assert!(!view.contains_key("description"));
	}

	#[test]
	fn view_flattens_custom_fields() {
		let mut r = HealthReport::new();
		r.custom_fields.insert("error_count".to_string(), FieldValue::Int(10));
		r.custom_fields.insert(
			"tags".to_string(),
			FieldValue::List(vec![FieldValue::String("gpu".to_string())]),
		);
		let view = r.view();
		assert_eq!(view.get("error_count"), Some(&serde_json::Value::from(10)));
		assert!(view.get("tags").unwrap().is_array());
	}

	#[test]
	fn view_is_idempotent_on_its_own_output_shape() {
		let r = HealthReport::new();
		let view1 = r.view();
		// view() is defined on HealthReport, not on its own output; verify
		// that calling it twice on equivalent reports yields identical maps.
		let view2 = r.view();
		assert_eq!(view1, view2);
	}

	#[test]
	fn default_message_example_from_status() {
		assert_eq!(HealthStatus::Warning.as_wire_str(), "Warning");
		assert_eq!(HealthStatus::Error.as_wire_str(), "Error");
	}
}
