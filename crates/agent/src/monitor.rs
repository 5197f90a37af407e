//! Module registration table.
//!
//! Replaces attribute-scanning dispatch with an explicit trait: every
//! monitor names itself and exposes a synchronous status snapshot, plus an
//! optional asynchronous epilog diagnostic (only the GPU monitor has one;
//! every other module gets the default no-op).

use std::sync::Arc;

/// One registered health-check module, as seen by the request server.
#[async_trait::async_trait]
pub trait Monitor: Send + Sync {
    fn name(&self) -> &'static str;

    fn status(&self) -> serde_json::Map<String, serde_json::Value>;

    async fn epilog(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Object(serde_json::Map::new()))
    }
}

#[async_trait::async_trait]
impl Monitor for healthagent_monitor_gpu::GpuMonitor {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        self.show_status()
    }

    async fn epilog(&self) -> anyhow::Result<serde_json::Value> {
        self.run_epilog().await
    }
}

#[async_trait::async_trait]
impl Monitor for healthagent_monitor_systemd::SystemdMonitor {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        self.show_status()
    }
}

#[async_trait::async_trait]
impl Monitor for healthagent_monitor_kmsg::KmsgMonitor {
    fn name(&self) -> &'static str {
        "kmsg"
    }

    fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        self.show_status()
    }
}

/// [`healthagent_monitor_network::NetworkMonitor::create`] requires an
/// `Arc<Self>` receiver (it reschedules itself into a periodic closure), so
/// the registration table holds the `Arc` directly rather than the bare
/// struct.
pub struct NetworkHandle(pub Arc<healthagent_monitor_network::NetworkMonitor>);

#[async_trait::async_trait]
impl Monitor for NetworkHandle {
    fn name(&self) -> &'static str {
        "network"
    }

    fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0.show_status()
    }
}
