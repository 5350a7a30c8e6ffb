mod error;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::progress::Stage;

pub use error::{ExtractorError, ExtractorResult};

#[derive(Debug, Clone, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Progress {
        raw_percent: f64,
        stage_hint: Option<Stage>,
    },
    Diagnostic(String),
    Exit(Option<i32>),
}

/// Handle onto a spawned fetch process: kill is forceful and asynchronous,
/// the supervised exit surfaces as a terminal `FetchEvent::Exit`.
pub trait ProcessControl: Send + Sync {
    fn kill(&self);
    fn pid(&self) -> Option<u32>;
}

pub struct FetchHandle {
    pub events: mpsc::Receiver<FetchEvent>,
    pub control: Arc<dyn ProcessControl>,
}

#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub url: String,
    pub output_template: String,
    pub max_height: u32,
    pub container: String,
    pub retries: u32,
    pub fragment_retries: u32,
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn probe(&self) -> ExtractorResult<String>;
    async fn fetch_metadata(&self, url: &str) -> ExtractorResult<MediaMetadata>;
    async fn spawn_fetch(&self, plan: &FetchPlan) -> ExtractorResult<FetchHandle>;
}

pub struct YtDlpExtractor {
    binary: PathBuf,
    metadata_timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(binary: impl AsRef<Path>, metadata_timeout: Duration) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            metadata_timeout,
        }
    }

    fn format_selector(plan: &FetchPlan) -> String {
        format!(
            "bestvideo[height<={height}][ext={container}]+bestaudio/best[height<={height}]/best",
            height = plan.max_height,
            container = plan.container,
        )
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn probe(&self) -> ExtractorResult<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ExtractorError::Unavailable {
                binary: self.binary.clone(),
                detail: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(ExtractorError::Unavailable {
                binary: self.binary.clone(),
                detail: format!("--version exited with {:?}", output.status.code()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn fetch_metadata(&self, url: &str) -> ExtractorResult<MediaMetadata> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--dump-json")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.metadata_timeout, command.output())
            .await
            .map_err(|_| ExtractorError::Timeout(self.metadata_timeout))?
            .map_err(ExtractorError::Spawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractorError::Metadata(
                stderr.lines().last().unwrap_or("unknown failure").to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .next()
            .ok_or_else(|| ExtractorError::Metadata("empty metadata response".to_string()))?;
        Ok(serde_json::from_str(line)?)
    }

    async fn spawn_fetch(&self, plan: &FetchPlan) -> ExtractorResult<FetchHandle> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--output")
            .arg(&plan.output_template)
            .arg("--format")
            .arg(Self::format_selector(plan))
            .arg("--merge-output-format")
            .arg(&plan.container)
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--retries")
            .arg(plan.retries.to_string())
            .arg("--fragment-retries")
            .arg(plan.fragment_retries.to_string())
            .arg(&plan.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(ExtractorError::Spawn)?;

        let pid = child.id();
        let (events_tx, events_rx) = mpsc::channel(64);
        let (kill_tx, kill_rx) = watch::channel(false);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_pump = tokio::spawn(pump_stdout(stdout, events_tx.clone()));
        let stderr_pump = tokio::spawn(pump_stderr(stderr, events_tx.clone()));
        tokio::spawn(supervise(child, kill_rx, events_tx, stdout_pump, stderr_pump));

        Ok(FetchHandle {
            events: events_rx,
            control: Arc::new(KillSwitch { kill: kill_tx, pid }),
        })
    }
}

struct KillSwitch {
    kill: watch::Sender<bool>,
    pid: Option<u32>,
}

impl ProcessControl for KillSwitch {
    fn kill(&self) {
        let _ = self.kill.send(true);
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn pump_stdout(
    stdout: Option<tokio::process::ChildStdout>,
    events: mpsc::Sender<FetchEvent>,
) {
    let Some(stdout) = stdout else { return };
    let progress_line = Regex::new(r"\[download\]\s+([\d.]+)%").expect("static regex");
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event = match progress_line
            .captures(&line)
            .and_then(|caps| caps[1].parse::<f64>().ok())
        {
            Some(raw_percent) => FetchEvent::Progress {
                raw_percent,
                stage_hint: None,
            },
            None => FetchEvent::Diagnostic(line),
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

async fn pump_stderr(
    stderr: Option<tokio::process::ChildStderr>,
    events: mpsc::Sender<FetchEvent>,
) {
    let Some(stderr) = stderr else { return };
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if events.send(FetchEvent::Diagnostic(line)).await.is_err() {
            return;
        }
    }
}

async fn supervise(
    mut child: tokio::process::Child,
    mut kill_rx: watch::Receiver<bool>,
    events: mpsc::Sender<FetchEvent>,
    stdout_pump: tokio::task::JoinHandle<()>,
    stderr_pump: tokio::task::JoinHandle<()>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            changed = kill_rx.changed() => match changed {
                Ok(()) => {
                    if *kill_rx.borrow() {
                        debug!(pid = ?child.id(), "killing fetch process");
                        if let Err(err) = child.start_kill() {
                            warn!(error = %err, "failed to signal fetch process");
                        }
                    }
                }
                // All kill handles dropped; nothing left to wait for but exit.
                Err(_) => break child.wait().await,
            },
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(error = %err, "failed to reap fetch process");
            None
        }
    };
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;
    let _ = events.send(FetchEvent::Exit(code)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_selector_caps_height_and_falls_back() {
        let plan = FetchPlan {
            url: "https://example.test/v".into(),
            output_template: "/tmp/%(title)s.%(ext)s".into(),
            max_height: 720,
            container: "mp4".into(),
            retries: 3,
            fragment_retries: 3,
        };
        let selector = YtDlpExtractor::format_selector(&plan);
        assert_eq!(
            selector,
            "bestvideo[height<=720][ext=mp4]+bestaudio/best[height<=720]/best"
        );
    }
}
