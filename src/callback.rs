//! Change reaction: runs an external command when the registry changes.
//!
//! Changes only raise a dirty flag.  A separate loop checks the flag once
//! per cooldown and, when set, clears it and runs the command with the
//! whole registry as JSON on stdin.  Bursts of changes therefore end up as
//! a single run and runs never overlap.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::registry::Registry;
use crate::types::Discovery;

/// Shared dirty flag.
#[derive(Clone, Default)]
pub struct ChangeDetector {
    dirty: Arc<AtomicBool>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Marks a change when `incoming` is new or differs from `previous`.
    pub fn observe(&self, previous: Option<&Discovery>, incoming: &Discovery) {
        if previous.map_or(true, |p| p.differs_from(incoming)) {
            self.mark();
        }
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("wrong number of parts of the callback command")]
    EmptyCommand,
    #[error("encoding discoveries: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("starting {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("waiting for callback: {0}")]
    Wait(std::io::Error),
}

#[derive(Debug)]
pub struct CallbackOutput {
    pub status: ExitStatus,
    /// stdout followed by stderr.
    pub output: String,
}

pub struct CallbackRunner {
    command: String,
    registry: Arc<Registry>,
    detector: ChangeDetector,
}

impl CallbackRunner {
    pub fn new(command: String, registry: Arc<Registry>, detector: ChangeDetector) -> Self {
        Self {
            command,
            registry,
            detector,
        }
    }

    /// Runs the command if something changed since the last run.  The flag
    /// is cleared before the command starts so changes made meanwhile are
    /// picked up by the next cycle.
    pub async fn run_once(&self) -> Option<Result<CallbackOutput, CallbackError>> {
        if !self.detector.take() {
            return None;
        }
        info!("Running callback function");
        let result = self.execute().await;
        match &result {
            Ok(out) if out.status.success() => info!("Callback output: {}", out.output),
            Ok(out) => error!("Callback exited with {}: {}", out.status, out.output),
            Err(e) => error!("Callback error: {}", e),
        }
        Some(result)
    }

    pub async fn execute(&self) -> Result<CallbackOutput, CallbackError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(CallbackError::EmptyCommand)?;

        let payload = serde_json::to_vec(&self.registry.get_all().await)?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CallbackError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Feed stdin while collecting output, a chatty command could
        // otherwise block on a full stdout pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!("stdin writing error: {}", e);
                }
                // stdin is closed here so the command sees EOF.
            }
        };
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(CallbackError::Wait)?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CallbackOutput {
            status: output.status,
            output: combined,
        })
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub async fn run_callback_loop(
    runner: CallbackRunner,
    first_run_delay: Duration,
    cooldown: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Delaying start of discovery change loop ({} seconds)",
        first_run_delay.as_secs()
    );
    tokio::select! {
        _ = sleep(first_run_delay) => {}
        _ = shutdown_signalled(&mut shutdown) => return,
    }
    info!("Starting discovery change loop");

    let mut ticker = interval(cooldown);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_signalled(&mut shutdown) => break,
        }
        // Not part of the select, a running command is allowed to finish.
        runner.run_once().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Label;
    use tempfile::TempDir;

    async fn registry_with(hostname: &str) -> Arc<Registry> {
        let registry = Arc::new(Registry::new(30, None));
        registry
            .add(Discovery::new(hostname, vec![Label::from("service:web")]))
            .await;
        registry
    }

    #[test]
    fn detector_collapses_marks() {
        let detector = ChangeDetector::new();
        let a = Discovery::new("a", vec!["x:1".into()]);
        let mut refreshed = a.clone();
        refreshed.last_check = 999;

        detector.observe(Some(&a), &refreshed);
        assert!(!detector.take());

        detector.observe(None, &a);
        detector.observe(Some(&a), &Discovery::new("a", vec!["x:2".into()]));
        assert!(detector.take());
        assert!(!detector.take());
    }

    #[tokio::test]
    async fn runs_once_per_batch_of_changes() {
        let detector = ChangeDetector::new();
        let runner = CallbackRunner::new("cat".into(), registry_with("node1").await, detector.clone());

        assert!(runner.run_once().await.is_none());

        for _ in 0..5 {
            detector.mark();
        }
        let out = runner.run_once().await.unwrap().unwrap();
        assert!(out.status.success());
        let echoed: Vec<Discovery> = serde_json::from_str(&out.output).unwrap();
        assert_eq!(echoed.len(), 1);
        assert_eq!(echoed[0].hostname, "node1");

        assert!(runner.run_once().await.is_none());
    }

    #[tokio::test]
    async fn bad_commands_are_reported() {
        let detector = ChangeDetector::new();
        let registry = registry_with("node1").await;

        let blank = CallbackRunner::new("   ".into(), registry.clone(), detector.clone());
        detector.mark();
        assert!(matches!(
            blank.run_once().await,
            Some(Err(CallbackError::EmptyCommand))
        ));

        let missing = CallbackRunner::new(
            "/nonexistent/lobby-callback --flag".into(),
            registry.clone(),
            detector.clone(),
        );
        detector.mark();
        assert!(matches!(
            missing.run_once().await,
            Some(Err(CallbackError::Spawn { .. }))
        ));

        let failing = CallbackRunner::new("false".into(), registry, detector.clone());
        detector.mark();
        let out = failing.run_once().await.unwrap().unwrap();
        assert!(!out.status.success());
    }

    #[tokio::test]
    async fn loop_debounces_bursts() {
        let tmp = TempDir::new().unwrap();
        let log_file = tmp.path().join("runs");
        let detector = ChangeDetector::new();
        let runner = CallbackRunner::new(
            format!("tee -a {}", log_file.display()),
            registry_with("node1").await,
            detector.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for _ in 0..10 {
            detector.mark();
        }
        let handle = tokio::spawn(run_callback_loop(
            runner,
            Duration::ZERO,
            Duration::from_millis(100),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let runs = std::fs::read_to_string(&log_file).unwrap();
        assert_eq!(runs.matches("\"hostname\":\"node1\"").count(), 1);
    }

    #[tokio::test]
    async fn loop_stops_during_first_run_delay() {
        let detector = ChangeDetector::new();
        detector.mark();
        let runner = CallbackRunner::new("cat".into(), registry_with("node1").await, detector.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_callback_loop(
            runner,
            Duration::from_secs(3600),
            Duration::from_millis(10),
            shutdown_rx,
        ));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // Never ran, the change is still pending.
        assert!(detector.take());
    }
}
