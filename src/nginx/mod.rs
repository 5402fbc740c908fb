//! Supervises the local nginx: keeps its configuration in agreement with
//! the ingress entries, throttles reloads, and scrapes its traffic metrics.

pub mod conf;
mod process;
mod vts;

pub use conf::NginxConfig;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tera::Tera;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::entry::IngressEntry;
use crate::metrics::NGINX_RELOADS;
use crate::updater::{Updater, UpdaterHealth};
use crate::{Error, Result};

use process::NginxProcess;

pub struct NginxSupervisor {
    cfg: NginxConfig,
    tera: Tera,
    process: Mutex<Option<Arc<NginxProcess>>>,
    update_required: Arc<AtomicBool>,
    updated_once: AtomicBool,
    metrics_ok: Arc<AtomicBool>,
    routes: Arc<Mutex<HashSet<(String, String)>>>,
    shutdown: watch::Sender<bool>,
}

impl NginxSupervisor {
    pub fn new(cfg: NginxConfig) -> Result<Self> {
        let tera = cfg.load_template()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            cfg,
            tera,
            process: Mutex::new(None),
            update_required: Arc::new(AtomicBool::new(false)),
            updated_once: AtomicBool::new(false),
            metrics_ok: Arc::new(AtomicBool::new(true)),
            routes: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        })
    }

    fn spawn_background_tasks(&self, process: &Arc<NginxProcess>) {
        self.spawn_reload_throttle(process.clone());
        self.spawn_metrics_scraper(process.done_channel());
    }

    /// Reload at most once per update period: successive updates within one
    /// period coalesce into a single hangup signal.
    fn spawn_reload_throttle(&self, process: Arc<NginxProcess>) {
        let update_required = self.update_required.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.cfg.update_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if update_required.swap(false, Ordering::SeqCst) {
                            match process.reload() {
                                Ok(()) => {
                                    info!("reloading nginx configuration");
                                    NGINX_RELOADS.inc();
                                }
                                Err(e) => {
                                    warn!("failed to signal nginx reload: {e}");
                                    update_required.store(true, Ordering::SeqCst);
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    fn spawn_metrics_scraper(&self, mut done: watch::Receiver<bool>) {
        let url = self.cfg.status_url();
        let routes = self.routes.clone();
        let metrics_ok = self.metrics_ok.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut state = vts::CounterState::default();
            let mut ticker = tokio::time::interval(vts::SCRAPE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let known = routes.lock().clone();
                        match vts::scrape(&client, &url, &known, &mut state).await {
                            Ok(()) => metrics_ok.store(true, Ordering::SeqCst),
                            Err(e) => {
                                warn!("failed to scrape nginx status: {e}");
                                metrics_ok.store(false, Ordering::SeqCst);
                            }
                        }
                    }
                    changed = done.changed() => {
                        if changed.is_err() || *done.borrow() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    #[cfg(test)]
    fn reload_pending(&self) -> bool {
        self.update_required.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Updater for NginxSupervisor {
    fn name(&self) -> &'static str {
        "nginx"
    }

    async fn start(&self) -> Result<()> {
        tokio::fs::metadata(&self.cfg.binary).await.map_err(|e| {
            Error::Config(format!("nginx binary {} not usable: {e}", self.cfg.binary))
        })?;
        tokio::fs::create_dir_all(&self.cfg.workdir).await?;
        Ok(())
    }

    async fn update(&self, entries: &[IngressEntry]) -> Result<()> {
        if entries.is_empty() {
            return Err(Error::Nginx(
                "refusing to update nginx with zero ingress entries".to_string(),
            ));
        }

        let rendered = conf::render(&self.cfg, &self.tera, entries)?;
        let changed = process::apply_config(&self.cfg, &rendered.config).await?;
        *self.routes.lock() = rendered.routes;

        let started = self.process.lock().is_some();
        if !started {
            // Lazy first start; the freshly written file is picked up on
            // spawn, so no reload is needed.
            let process = Arc::new(process::spawn(&self.cfg).await?);
            self.spawn_background_tasks(&process);
            *self.process.lock() = Some(process);
        } else if changed {
            self.update_required.store(true, Ordering::SeqCst);
        }

        self.updated_once.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let process = self.process.lock().take();
        if let Some(process) = process {
            info!("shutting down nginx");
            process.quit_and_wait().await?;
        }
        Ok(())
    }

    fn health(&self) -> UpdaterHealth {
        if !self.updated_once.load(Ordering::SeqCst) {
            return UpdaterHealth::unhealthy("waiting for the first successful update");
        }
        let running = self
            .process
            .lock()
            .as_ref()
            .map(|p| p.is_running())
            .unwrap_or(false);
        if !running {
            return UpdaterHealth::unhealthy("nginx is not running");
        }
        if !self.metrics_ok.load(Ordering::SeqCst) {
            return UpdaterHealth::unhealthy("nginx metrics are failing to update");
        }
        UpdaterHealth::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::conf::tests::{entry, test_config};
    use super::*;

    fn supervisor() -> NginxSupervisor {
        let mut cfg = test_config();
        cfg.workdir = tempfile::tempdir().unwrap().into_path();
        NginxSupervisor::new(cfg).unwrap()
    }

    #[tokio::test]
    async fn refuses_empty_entry_list() {
        let supervisor = supervisor();
        let result = supervisor.update(&[]).await;
        assert!(matches!(result, Err(Error::Nginx(_))));
        assert!(!supervisor.reload_pending());
        assert!(supervisor.process.lock().is_none());
    }

    #[tokio::test]
    async fn unhealthy_until_first_update() {
        let supervisor = supervisor();
        assert_eq!(
            supervisor.health(),
            UpdaterHealth::unhealthy("waiting for the first successful update")
        );
    }

    #[tokio::test]
    async fn stop_is_safe_without_a_started_process() {
        let supervisor = supervisor();
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_config_check_does_not_mark_updated() {
        let mut cfg = test_config();
        cfg.workdir = tempfile::tempdir().unwrap().into_path();
        // A config check that always fails leaves the supervisor unupdated.
        cfg.binary = "/bin/false".into();
        let supervisor = NginxSupervisor::new(cfg).unwrap();

        let entries = vec![entry("default", "ing", "foo.com", "/api", "svc", 8080)];
        let result = supervisor.update(&entries).await;
        assert!(matches!(result, Err(Error::NginxConfInvalid(_))));
        assert!(!supervisor.updated_once.load(Ordering::SeqCst));
        assert_eq!(
            supervisor.health(),
            UpdaterHealth::unhealthy("waiting for the first successful update")
        );
    }
}
