use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::conf::NginxConfig;
use crate::{Error, Result};

/// How long a freshly spawned master gets to fall over before we call the
/// start successful.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Bound on waiting for the master to exit after SIGQUIT.
const QUIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to a running nginx master process.
///
/// The reaper task spawned alongside the child is the sole owner of the exit
/// status: it clears `running` and closes the done channel, which the metrics
/// scraper and `quit_and_wait` observe.
pub struct NginxProcess {
    pid: Pid,
    running: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl NginxProcess {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Channel that flips to true once the master has exited.
    pub fn done_channel(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        kill(self.pid, signal)
            .map_err(|e| Error::Nginx(format!("failed to send {signal} to nginx: {e}")))
    }

    /// Ask the master to re-read its configuration.
    pub fn reload(&self) -> Result<()> {
        self.signal(Signal::SIGHUP)
    }

    /// Graceful shutdown: SIGQUIT lets in-flight requests complete, then the
    /// reaper reports the exit.
    pub async fn quit_and_wait(&self) -> Result<()> {
        self.signal(Signal::SIGQUIT)?;
        let mut done = self.done.clone();
        let wait = async {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(QUIT_TIMEOUT, wait)
            .await
            .map_err(|_| Error::Nginx("timed out waiting for nginx to exit".to_string()))
    }
}

/// Spawn the nginx master against the current on-disk configuration.
pub async fn spawn(cfg: &NginxConfig) -> Result<NginxProcess> {
    let conf_path = cfg.conf_path();
    info!("starting {} -c {}", cfg.binary, conf_path.display());
    let mut child = Command::new(&cfg.binary)
        .arg("-c")
        .arg(&conf_path)
        .current_dir(&cfg.workdir)
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::Nginx(format!("failed to start {}: {e}", cfg.binary)))?;

    tokio::time::sleep(STARTUP_GRACE).await;
    if let Some(status) = child
        .try_wait()
        .map_err(|e| Error::Nginx(format!("failed to check nginx: {e}")))?
    {
        return Err(Error::Nginx(format!("nginx exited during startup: {status}")));
    }

    let pid = child
        .id()
        .map(|id| Pid::from_raw(id as i32))
        .ok_or_else(|| Error::Nginx("nginx exited during startup".to_string()))?;

    let running = Arc::new(AtomicBool::new(true));
    let (done_tx, done_rx) = watch::channel(false);

    let reaper_running = running.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => info!("nginx exited cleanly"),
            Ok(status) => error!("nginx exited with {status}"),
            Err(e) => error!("failed to reap nginx: {e}"),
        }
        reaper_running.store(false, Ordering::SeqCst);
        let _ = done_tx.send(true);
    });

    Ok(NginxProcess {
        pid,
        running,
        done: done_rx,
    })
}

/// Bring the on-disk configuration in agreement with `candidate`.
///
/// Returns false when the file already matches. Otherwise the candidate is
/// written to a temporary file, validated with the binary's config-check
/// mode and atomically renamed over nginx.conf. A rejected candidate leaves
/// the previous file untouched.
pub async fn apply_config(cfg: &NginxConfig, candidate: &str) -> Result<bool> {
    let conf_path = cfg.conf_path();
    let current = tokio::fs::read_to_string(&conf_path).await.unwrap_or_default();
    if current == candidate {
        return Ok(false);
    }

    let tmp_path = cfg.workdir.join(".nginx.conf.tmp");
    tokio::fs::write(&tmp_path, candidate).await?;

    let check = Command::new(&cfg.binary)
        .arg("-t")
        .arg("-c")
        .arg(&tmp_path)
        .current_dir(&cfg.workdir)
        .output()
        .await;

    match check {
        Ok(output) if output.status.success() => {
            tokio::fs::rename(&tmp_path, &conf_path).await?;
            info!("wrote updated configuration to {}", conf_path.display());
            Ok(true)
        }
        Ok(output) => {
            remove_quietly(&tmp_path).await;
            Err(Error::NginxConfInvalid(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
        Err(e) => {
            remove_quietly(&tmp_path).await;
            Err(Error::Nginx(format!("failed to run config check: {e}")))
        }
    }
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("failed to remove {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nginx::conf::tests::test_config;

    fn config_in(dir: &std::path::Path) -> NginxConfig {
        let mut cfg = test_config();
        cfg.workdir = dir.to_path_buf();
        // `true` accepts any arguments, standing in for a binary whose
        // config check always passes.
        cfg.binary = "/bin/true".into();
        cfg
    }

    #[tokio::test]
    async fn writes_candidate_when_changed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());

        assert!(apply_config(&cfg, "server {}\n").await.unwrap());
        let on_disk = std::fs::read_to_string(cfg.conf_path()).unwrap();
        assert_eq!(on_disk, "server {}\n");
    }

    #[tokio::test]
    async fn unchanged_candidate_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());

        assert!(apply_config(&cfg, "server {}\n").await.unwrap());
        assert!(!apply_config(&cfg, "server {}\n").await.unwrap());
    }

    #[tokio::test]
    async fn rejected_candidate_preserves_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_in(dir.path());

        assert!(apply_config(&cfg, "good config\n").await.unwrap());

        // A config-check that always fails must leave the old file alone.
        cfg.binary = "/bin/false".into();
        let result = apply_config(&cfg, "bad config\n").await;
        assert!(matches!(result, Err(Error::NginxConfInvalid(_))));

        let on_disk = std::fs::read_to_string(cfg.conf_path()).unwrap();
        assert_eq!(on_disk, "good config\n");
        assert!(!dir.path().join(".nginx.conf.tmp").exists());
    }
}
