//! Generated DBus proxy traits for the pieces of `systemd1` this monitor needs.

use zbus::proxy;
use zbus::zvariant::OwnedObjectPath;

/// `org.freedesktop.systemd1.Manager` — unit lookup and the `UnitNew` signal.
#[proxy(
	interface = "org.freedesktop.systemd1.Manager",
	default_service = "org.freedesktop.systemd1",
	default_path = "/org/freedesktop/systemd1"
)]
pub trait Manager {
	/// Resolve a service name (e.g. `"munge.service"`) to its unit object path.
	fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

	/// Emitted whenever systemd loads a previously-unloaded unit.
	#[zbus(signal)]
	fn unit_new(&self, id: String, unit: OwnedObjectPath) -> zbus::Result<()>;
}

/// `org.freedesktop.systemd1.Unit` — per-unit state, polled and watched.
#[proxy(interface = "org.freedesktop.systemd1.Unit", default_service = "org.freedesktop.systemd1")]
pub trait Unit {
	/// `"active"`, `"inactive"`, `"failed"`, or a transient state.
	#[zbus(property)]
	fn active_state(&self) -> zbus::Result<String>;

	/// `"running"`, `"dead"`, `"failed"`, etc — finer grained than `ActiveState`.
	#[zbus(property)]
	fn sub_state(&self) -> zbus::Result<String>;

	/// systemd's recorded result for the last run (`"success"`, `"exit-code"`, ...).
	#[zbus(property)]
	fn result(&self) -> zbus::Result<String>;

	/// Exit status of the unit's main process, used in lieu of a journal excerpt.
	#[zbus(property)]
	fn exec_main_status(&self) -> zbus::Result<i32>;
}
