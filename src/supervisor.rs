//! Runs one encode: spawns the process, polls its progress, honours
//! cancellation and reports the terminal outcome.

use crate::cleanup;
use crate::db::StatsStore;
use crate::error::Error;
use crate::process::{EncodeProcess, ProcessExit, ProcessLauncher};
use crate::progress::{eta, percentage, ProgressPoller, ProgressSample, Throttle};
use crate::registry::{self, Artifact, JobHandle, JobOutcome, JobRegistry};
use crate::reporter::{ProgressFeed, ProgressReporter, StatusUpdate};
use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Characters of encoder stderr surfaced in a failure message.
const EXCERPT_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Minimum percentage advance between two progress updates.
    pub progress_step: u8,
    /// Minimum time between updates while the percentage is unknown.
    pub indeterminate_interval: Duration,
    pub job_timeout: Option<Duration>,
    /// Take a preview frame of each finished encode.
    pub thumbnails: bool,
    pub thumbnail_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            kill_grace: Duration::from_secs(5),
            progress_step: 2,
            indeterminate_interval: Duration::from_secs(15),
            job_timeout: None,
            thumbnails: true,
            thumbnail_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct EncoderSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    poller: Arc<dyn ProgressPoller>,
    reporter: ProgressReporter,
    registry: Arc<JobRegistry>,
    stats: Option<Arc<dyn StatsStore>>,
    settings: SupervisorSettings,
}

impl EncoderSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        poller: Arc<dyn ProgressPoller>,
        reporter: ProgressReporter,
        registry: Arc<JobRegistry>,
        stats: Option<Arc<dyn StatsStore>>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            launcher,
            poller,
            reporter,
            registry,
            stats,
            settings,
        }
    }

    /// Drives a job claimed with [`JobHandle::begin`] to its terminal status
    /// and releases it. Only delivery of a finished artifact happens before
    /// the release; other terminal messages follow it.
    #[instrument(skip_all, fields(job_id = %handle.id(), user_id = handle.user_id()))]
    pub async fn run(&self, handle: &Arc<JobHandle>) -> JobOutcome {
        debug!(queued_for = ?(Utc::now() - handle.submitted_at), label = %handle.task.label(), "Encode starting");
        let feed = self.reporter.feed(handle.user_id());
        let proposed = self.supervise(handle, &feed).await;
        feed.close().await;
        let outcome = self.registry.decide(handle, proposed);

        match &outcome {
            JobOutcome::Completed(artifact) => {
                info!(output_size = artifact.output_size, elapsed = ?artifact.elapsed, "Encode completed");
                self.reporter.completed(handle, artifact).await;
                self.record_stats(handle);
            }
            JobOutcome::Failed { message, exit_code } => {
                warn!(message = "Encode failed", reason = %message, exit_code = ?exit_code);
            }
            JobOutcome::Cancelled => info!("Encode cancelled"),
        }

        registry::remove_files(&handle.task).await;
        self.registry.release(handle, outcome.clone());

        match &outcome {
            JobOutcome::Failed { message, .. } => self.reporter.failed(handle, message).await,
            JobOutcome::Cancelled => self.reporter.cancelled(handle).await,
            JobOutcome::Completed(_) => {}
        }
        outcome
    }

    async fn supervise(&self, handle: &JobHandle, feed: &ProgressFeed) -> JobOutcome {
        let task = &handle.task;

        let mut process = match self.launcher.spawn(&task.args()) {
            Ok(process) => process,
            Err(err) => {
                let err = Error::Spawn(err.to_string());
                error!(message = "Could not start encoder", error = %err);
                return JobOutcome::failed(err.to_string(), None);
            }
        };
        debug!(pid = ?process.id(), "Encoder started");

        let mut throttle = Throttle::new(self.settings.progress_step, self.settings.indeterminate_interval);
        let mut ticker = time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing has been written yet.
        ticker.tick().await;

        let deadline = async {
            match self.settings.job_timeout {
                Some(limit) => time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = handle.cancelled() => {
                    debug!("Stopping encoder on request");
                    self.terminate(process.as_mut()).await;
                    return JobOutcome::Cancelled;
                },
                _ = &mut deadline => {
                    warn!(timeout = ?self.settings.job_timeout, "Encode timed out");
                    self.terminate(process.as_mut()).await;
                    return JobOutcome::failed("timed out", None);
                },
                exit = process.wait() => {
                    return match self.judge(handle, exit).await {
                        JobOutcome::Completed(artifact) if self.settings.thumbnails => {
                            let thumbnail = self.thumbnail(handle).await;
                            JobOutcome::Completed(Artifact { thumbnail, ..artifact })
                        }
                        outcome => outcome,
                    };
                },
                _ = ticker.tick() => {
                    let sample = self.poller.poll(&task.progress).await;
                    self.report(handle, &sample, &mut throttle, feed);
                },
            }
        }
    }

    fn report(&self, handle: &JobHandle, sample: &ProgressSample, throttle: &mut Throttle, feed: &ProgressFeed) {
        let total = handle.task.duration;
        let processed = sample.processed_seconds();
        let mut pct = percentage(processed, total);
        if sample.is_end() && pct.is_some() {
            pct = Some(100);
        }

        if !throttle.admit(pct, Instant::now()) {
            return;
        }
        let update = StatusUpdate {
            job_id: handle.id(),
            label: handle.task.label(),
            percentage: pct,
            eta: eta(processed, total, sample.speed),
            elapsed: handle.elapsed(),
            speed: sample.speed,
        };
        debug!(percentage = ?pct, frame = ?sample.frame, "Progress");
        feed.push(update);
    }

    async fn judge(&self, handle: &JobHandle, exit: io::Result<ProcessExit>) -> JobOutcome {
        let exit = match exit {
            Ok(exit) => exit,
            Err(err) => {
                error!(message = "Lost track of encoder", error = ?err);
                return JobOutcome::failed(format!("could not wait for encoder: {}", err), None);
            }
        };

        if !exit.success() {
            if !exit.diagnostics.is_empty() {
                debug!(stderr = %exit.diagnostics, "Encoder stderr");
            }
            let reason = match exit.code {
                Some(code) => format!("ffmpeg exited with code {}", code),
                None => "ffmpeg was killed by a signal".to_string(),
            };
            let detail = excerpt(&exit.diagnostics, EXCERPT_CHARS);
            let message = if detail.is_empty() {
                reason
            } else {
                format!("{}: {}", reason, detail)
            };
            return JobOutcome::failed(message, exit.code);
        }

        let task = &handle.task;
        match cleanup::file_size(&task.output).await {
            Some(output_size) if output_size > 0 => JobOutcome::Completed(Artifact {
                path: task.output.clone(),
                thumbnail: None,
                original_size: task.source_size,
                output_size,
                elapsed: handle.elapsed(),
            }),
            _ => JobOutcome::failed("ffmpeg produced no output", exit.code),
        }
    }

    /// Best effort: any failure leaves the artifact without a thumbnail.
    async fn thumbnail(&self, handle: &JobHandle) -> Option<PathBuf> {
        let task = &handle.task;
        let mut process = match self.launcher.spawn(&task.thumbnail_args()) {
            Ok(process) => process,
            Err(err) => {
                warn!(message = "Could not start thumbnailer", error = ?err);
                return None;
            }
        };

        let exit = tokio::select! {
            biased;

            _ = handle.cancelled() => {
                self.stop_thumbnailer(process.as_mut()).await;
                return None;
            },
            _ = time::sleep(self.settings.thumbnail_timeout) => {
                warn!(timeout = ?self.settings.thumbnail_timeout, "Thumbnail timed out");
                self.stop_thumbnailer(process.as_mut()).await;
                return None;
            },
            exit = process.wait() => exit,
        };

        match exit {
            Ok(exit) if exit.success() => {}
            Ok(exit) => {
                warn!(code = ?exit.code, stderr = %excerpt(&exit.diagnostics, EXCERPT_CHARS), "Thumbnail failed");
                return None;
            }
            Err(err) => {
                warn!(message = "Lost track of thumbnailer", error = ?err);
                return None;
            }
        }

        match cleanup::file_size(&task.thumbnail).await {
            Some(size) if size > 0 => Some(task.thumbnail.clone()),
            _ => {
                warn!("Thumbnailer produced no image");
                None
            }
        }
    }

    async fn stop_thumbnailer(&self, process: &mut dyn EncodeProcess) {
        if let Err(err) = process.kill().await {
            warn!(message = "Could not kill thumbnailer", error = ?err);
        }
    }

    /// SIGTERM, then SIGKILL once the grace period runs out.
    async fn terminate(&self, process: &mut dyn EncodeProcess) {
        if let Err(err) = process.terminate() {
            warn!(message = "Could not signal encoder", error = ?err);
        }
        match time::timeout(self.settings.kill_grace, process.wait()).await {
            Ok(Ok(exit)) => debug!(code = ?exit.code, "Encoder stopped"),
            Ok(Err(err)) => warn!(message = "Could not wait for encoder", error = ?err),
            Err(_) => {
                warn!(grace = ?self.settings.kill_grace, "Encoder ignored SIGTERM, killing");
                if let Err(err) = process.kill().await {
                    error!(message = "Could not kill encoder", error = ?err);
                }
            }
        }
    }

    fn record_stats(&self, handle: &JobHandle) {
        let Some(stats) = self.stats.clone() else {
            return;
        };
        let user_id = handle.user_id();
        let bytes = handle.task.source_size;
        tokio::spawn(
            async move {
                if let Err(err) = stats.increment(user_id, bytes).await {
                    warn!(message = "Could not record stats", error = ?err);
                }
            }
            .in_current_span(),
        );
    }
}

/// Last `limit` characters of `text`, trimmed.
fn excerpt(text: &str, limit: usize) -> String {
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(limit);
    text.chars().skip(skip).collect::<String>().trim_start().to_string()
}
