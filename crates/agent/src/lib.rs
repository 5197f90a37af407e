//! Process orchestrator.
//!
//! Owns the scheduler, the module registration table, and the Unix-socket
//! request server. Each monitor gets its own [`Reporter`] loaded from
//! `<rundir>/<module>.json`; on shutdown every reporter is saved back to the
//! same file, so a restart picks up exactly where the agent left off.

mod config;
mod monitor;
mod server;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use config::Config;
use healthagent_reporter::Reporter;
use healthagent_scheduler::Scheduler;
pub use monitor::Monitor;

/// Package version reported over the `version` request, resolved at compile
/// time from this crate's `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) struct Module {
    name: String,
    reporter: Arc<Reporter>,
    monitor: Box<dyn Monitor>,
}

impl Module {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn monitor(&self) -> &dyn Monitor {
        self.monitor.as_ref()
    }
}

/// Owns every monitor, the scheduler driving them, and the socket server
/// that answers `status`/`epilog`/`version` requests.
pub struct Agent {
    config: Config,
    scheduler: Scheduler,
    modules: Arc<Vec<Module>>,
}

impl Agent {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config, scheduler: Scheduler::new(), modules: Arc::new(Vec::new()) }
    }

    fn reporter_for(&self, module: &str) -> Arc<Reporter> {
        let path = self.config.module_state_path(module);
        Arc::new(Reporter::load(self.scheduler.clone(), &self.config.notifier_path, &path))
    }

    /// Run the agent to completion: validate the working directory, install
    /// signal handlers, initialize every module, serve the socket, and block
    /// until a signal (or an internal fault) calls [`Scheduler::stop`].
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory is missing/not writable, or
    /// if the Unix socket can't be bound.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let pid = std::process::id();
        tracing::info!(pid, version = VERSION, "healthagent starting");

        if !self.config.workdir.is_dir() {
            anyhow::bail!("invalid workdir: {}", self.config.workdir.display());
        }
        if std::fs::metadata(&self.config.workdir)?.permissions().readonly() {
            anyhow::bail!("workdir is not writable: {}", self.config.workdir.display());
        }
        std::fs::create_dir_all(self.config.rundir())?;

        self.scheduler.start();
        install_signal_handlers(self.scheduler.clone());

        if self.config.debug_mode {
            tracing::info!("running in debug mode");
            self.scheduler.schedule_periodic("self_observation_rss", Duration::from_secs(120), |_ctx| async {
                self_observation_rss().await;
                Ok(())
            });
            self.scheduler.schedule_periodic("self_observation_smaps", Duration::from_secs(300), |_ctx| async {
                self_observation_smaps().await;
                Ok(())
            });
        }
        self.scheduler.schedule_periodic("reset_systemd_watchdog", Duration::from_secs(60), |_ctx| async {
            reset_systemd_watchdog();
            Ok(())
        });

        self.initialize_modules().await;

        let socket_path = self.config.socket_path();
        let (server_handle, server_task) = server::serve(&socket_path, self.modules.clone()).await?;

        tracing::info!("initialized healthagent");
        self.scheduler.wait_for_stop().await;

        server_handle.shutdown();
        let _ = server_task.await;
        server::remove_socket(&socket_path);

        self.save_reporters();
        tracing::info!("exiting");
        Ok(())
    }

    async fn initialize_modules(&mut self) {
        let mut modules = Vec::new();
        let mut gpu_initialized = false;

        let gpu_reporter = self.reporter_for("gpu");
        match healthagent_monitor_gpu::GpuMonitor::new(gpu_reporter.clone(), self.scheduler.clone()) {
            Ok(gpu) => {
                gpu.create();
                gpu_initialized = true;
                tracing::info!(module = "gpu", "module initialized");
                modules.push(Module { name: "gpu".to_string(), reporter: gpu_reporter, monitor: Box::new(gpu) });
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to initialize GPU health checks; skipping");
            }
        }

        let systemd_reporter = self.reporter_for("systemd");
        match healthagent_monitor_systemd::SystemdMonitor::connect(systemd_reporter.clone(), self.scheduler.clone()).await {
            Ok(systemd) => {
                if let Err(err) = systemd.create().await {
                    tracing::error!(error = %err, "failed to subscribe to systemd UnitNew signal");
                }
                if let Err(err) = systemd.add_monitor(healthagent_monitor_systemd::CORE_ALLOWLIST).await {
                    tracing::error!(error = %err, "failed to attach core systemd service monitors");
                }
                if gpu_initialized {
                    if let Err(err) = systemd.add_monitor(healthagent_monitor_systemd::GPU_ALLOWLIST).await {
                        tracing::error!(error = %err, "failed to attach GPU-related systemd service monitors");
                    }
                }
                tracing::info!(module = "systemd", "module initialized");
                modules.push(Module { name: "systemd".to_string(), reporter: systemd_reporter, monitor: Box::new(systemd) });
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to reach the system bus; systemd module disabled");
            }
        }

        let kmsg_reporter = self.reporter_for("kmsg");
        let kmsg = healthagent_monitor_kmsg::KmsgMonitor::new(kmsg_reporter.clone(), self.scheduler.clone());
        match kmsg.create() {
            Ok(()) => {
                tracing::info!(module = "kmsg", "module initialized");
                modules.push(Module { name: "kmsg".to_string(), reporter: kmsg_reporter, monitor: Box::new(kmsg) });
            }
            Err(err) => {
                tracing::error!(error = %err, "kmsg module disabled");
            }
        }

        let network_reporter = self.reporter_for("network");
        let network = Arc::new(healthagent_monitor_network::NetworkMonitor::new(
            network_reporter.clone(),
            self.scheduler.clone(),
            60,
            Duration::from_secs(60),
        ));
        network.create();
        tracing::info!(module = "network", "module initialized");
        modules.push(Module {
            name: "network".to_string(),
            reporter: network_reporter,
            monitor: Box::new(monitor::NetworkHandle(network)),
        });

        self.modules = Arc::new(modules);
    }

    fn save_reporters(&self) {
        for module in self.modules.iter() {
            let path = self.config.module_state_path(module.name());
            if let Err(err) = module.reporter.save(&path) {
                tracing::error!(module = module.name(), error = %err, "failed to persist reporter state");
            }
        }
    }
}

fn install_signal_handlers(scheduler: Scheduler) {
    let sigint_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received SIGINT");
            sigint_scheduler.stop();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let sigterm_scheduler = scheduler;
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    tracing::warn!("received SIGTERM");
                    sigterm_scheduler.stop();
                }
                Err(err) => tracing::error!(error = %err, "failed to install SIGTERM handler"),
            }
        });
    }
}

fn reset_systemd_watchdog() {
    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
        tracing::debug!(error = %err, "systemd watchdog notify failed (expected outside a systemd unit)");
    }
}

/// Debug-mode self-observation: current RSS from `/proc/self/status`.
async fn self_observation_rss() {
    let Ok(status) = tokio::fs::read_to_string("/proc/self/status").await else {
        return;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) {
                tracing::debug!(rss_mb = kb / 1024.0, "self observation");
            }
            break;
        }
    }
}

/// Debug-mode self-observation: top shared libraries by anonymous memory
/// from `/proc/self/smaps`.
async fn self_observation_smaps() {
    let Ok(smaps) = tokio::fs::read_to_string("/proc/self/smaps").await else {
        return;
    };
    let mut libraries: std::collections::HashMap<String, (u64, u64)> = std::collections::HashMap::new();
    let mut current: Option<String> = None;
    for line in smaps.lines() {
        if let Some(first) = line.split_whitespace().next() {
            if first.contains('-') && first.chars().next().is_some_and(|c| c.is_ascii_hexdigit()) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                current = parts.get(5).filter(|p| p.ends_with(".so") || p.contains(".so.")).map(|p| (*p).to_string());
                continue;
            }
        }
        let Some(name) = &current else { continue };
        if let Some(rest) = line.strip_prefix("Rss:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                libraries.entry(name.clone()).or_default().0 += kb;
            }
        } else if let Some(rest) = line.strip_prefix("Anonymous:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                libraries.entry(name.clone()).or_default().1 += kb;
            }
        }
    }

    let mut top: Vec<_> = libraries.into_iter().collect();
    top.sort_by(|a, b| b.1.1.cmp(&a.1.1));
    for (name, (rss_kb, anon_kb)) in top.into_iter().take(10) {
        tracing::debug!(library = %name, rss_mb = rss_kb as f64 / 1024.0, anon_mb = anon_kb as f64 / 1024.0, "shared library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_for_never_panics_on_a_missing_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            workdir: dir.path().to_path_buf(),
            debug_mode: false,
            notifier_path: Path::new("/nonexistent/notifier").to_path_buf(),
        };
        let agent = Agent::new(config);
        let reporter = agent.reporter_for("gpu");
        assert!(reporter.summarize().is_empty());
    }
}
