use crate::client_log::ClientLog;
use crate::config::{build_command_line_args, load_config, redacted_args, AppPaths, REDACTED};
use crate::download::log_progress;
use crate::install::ClientInstaller;
use crate::self_update::{InstallMode, SelfUpdater};
use crate::supervisor::{format_command_line, ProcessSupervisor, SupervisorEvent};
use crate::types::ServiceConfig;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound for flushing the last output lines after shutdown.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

/// Keeps the Newt client alive until cancelled.
pub struct SupervisionLoop {
    paths: AppPaths,
    installer: ClientInstaller,
    app_updater: Option<SelfUpdater>,
    supervisor: ProcessSupervisor,
    events: Option<mpsc::UnboundedReceiver<SupervisorEvent>>,
    client_log: Arc<ClientLog>,
    cancel: CancellationToken,
    check_interval: Option<Duration>,
    update_interval: Option<Duration>,
}

impl SupervisionLoop {
    pub fn new(
        paths: AppPaths,
        installer: ClientInstaller,
        client_log: ClientLog,
        cancel: CancellationToken,
    ) -> Self {
        let (supervisor, events) =
            ProcessSupervisor::new(&paths.client_executable, &paths.data_dir);
        Self {
            paths,
            installer,
            app_updater: None,
            supervisor,
            events: Some(events),
            client_log: Arc::new(client_log),
            cancel,
            check_interval: None,
            update_interval: None,
        }
    }

    pub fn with_app_updater(mut self, updater: SelfUpdater) -> Self {
        self.app_updater = Some(updater);
        self
    }

    /// Overrides the configured liveness check interval.
    #[cfg(test)]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    /// Overrides `update_check_hours`.
    #[cfg(test)]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    pub async fn run(mut self) -> Result<()> {
        let pump = self
            .events
            .take()
            .map(|events| tokio::spawn(pump_events(events, Arc::clone(&self.client_log))));

        let mut config = load_config(&self.paths.config_file);
        log_config(&config);
        tracing::info!("Newt output is logged to {}", self.client_log.path().display());
        self.client_log.info("Service starting");

        if self.ensure_client(&config).await {
            self.start_client(&config).await;
        }

        let interval = self.check_interval.unwrap_or_else(|| {
            Duration::from_secs(config.settings.check_interval_secs.max(1))
        });
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_update_check = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.supervisor.is_running() {
                tracing::warn!(
                    "Newt process not running ({}), restarting...",
                    self.supervisor.state()
                );
                config = load_config(&self.paths.config_file);
                if self.ensure_client(&config).await {
                    self.restart_client(&config).await;
                }
            }

            let update_every = self
                .update_interval
                .unwrap_or_else(|| update_check_interval(&config));
            if !update_every.is_zero() && last_update_check.elapsed() >= update_every {
                last_update_check = Instant::now();
                self.check_for_updates(&config).await;
            }
        }

        tracing::info!("Shutting down, stopping newt");
        self.supervisor.stop(stop_timeout(&config)).await;
        self.client_log.info("Service stopped");

        // The pump finishes once every event sender, the supervisor's included, is gone
        let Self { supervisor, .. } = self;
        drop(supervisor);
        if let Some(pump) = pump {
            let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
        }
        Ok(())
    }

    async fn ensure_client(&self, config: &ServiceConfig) -> bool {
        self.installer
            .ensure_installed(config.settings.include_prerelease, log_progress("Newt"))
            .await
    }

    async fn start_client(&self, config: &ServiceConfig) {
        let args = build_command_line_args(config);
        tracing::info!(
            "Starting newt: {}",
            format_command_line(&redacted_args(&args))
        );
        if self.supervisor.start(&args).await {
            self.log_started();
        }
    }

    /// Clears whatever is left of a dead client before starting a new one.
    async fn restart_client(&self, config: &ServiceConfig) {
        let args = build_command_line_args(config);
        tracing::info!(
            "Restarting newt: {}",
            format_command_line(&redacted_args(&args))
        );
        if self.supervisor.restart(&args, stop_timeout(config)).await {
            self.log_started();
        }
    }

    fn log_started(&self) {
        let pid = self.supervisor.pid().unwrap_or_default();
        self.client_log.info(&format!("Process started with pid {}", pid));
    }

    async fn check_for_updates(&self, config: &ServiceConfig) {
        let settings = &config.settings;

        if settings.auto_update_client {
            if let Some(release) = self.installer.check_for_update(settings.include_prerelease).await {
                self.client_log
                    .info(&format!("Updating newt to {}", release.tag_name));
                self.supervisor.stop(stop_timeout(config)).await;
                if let Err(e) = self.installer.install(&release, log_progress("Newt")).await {
                    tracing::error!("Newt update failed: {:#}", e);
                }
                let config = load_config(&self.paths.config_file);
                self.start_client(&config).await;
            }
        }

        if !settings.auto_update_app {
            return;
        }
        let Some(updater) = &self.app_updater else {
            return;
        };
        let Some(release) = updater.check().await else {
            return;
        };
        if updater.install_mode() == InstallMode::Managed {
            tracing::info!(
                "App update {} available; managed install, run the installer to update",
                release.version
            );
            return;
        }

        let cancel = self.cancel.clone();
        match updater
            .install(&release, log_progress("App"), move || cancel.cancel())
            .await
        {
            Ok(outcome) => tracing::info!("App update {} started: {:?}", release.version, outcome),
            Err(e) => tracing::error!("App update failed: {:#}", e),
        }
    }
}

/// Zero disables periodic update checks.
fn update_check_interval(config: &ServiceConfig) -> Duration {
    Duration::from_secs(config.settings.update_check_hours.saturating_mul(3600))
}

fn stop_timeout(config: &ServiceConfig) -> Duration {
    Duration::from_secs(config.settings.stop_timeout_secs)
}

fn log_config(config: &ServiceConfig) {
    tracing::info!(
        endpoint = config.endpoint.as_deref().unwrap_or(""),
        id = config.id.as_deref().unwrap_or(""),
        secret = if config.secret.as_deref().is_some_and(|s| !s.is_empty()) {
            REDACTED
        } else {
            ""
        },
        "Loaded configuration"
    );
}

async fn pump_events(mut events: mpsc::UnboundedReceiver<SupervisorEvent>, log: Arc<ClientLog>) {
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::Output(line) => {
                tracing::info!(target: "newt", "{}", line);
                log.output(&line);
            }
            SupervisorEvent::Error(line) => {
                tracing::warn!(target: "newt", "{}", line);
                log.error(&line);
            }
            SupervisorEvent::Exited(code) => {
                tracing::warn!("Newt exited with code {}", code);
                log.info(&format!("Process exited with code {}", code));
            }
        }
    }
}
