//! Status rendering and delivery through the transport's [`Renderer`].

use crate::action::Action;
use crate::error::Result;
use crate::registry::{Artifact, JobHandle};
use crate::view::{Button, View};
use crate::{JobId, UserId};
use async_trait::async_trait;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{warn, Instrument};

const BAR_CELLS: usize = 10;
const FINISHED_CELL: char = '▓';
const UNFINISHED_CELL: char = '░';

/// The transport side: edits the caller's status message and hands over files.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn show(&self, user_id: UserId, view: &View) -> Result<()>;

    /// Sends the finished artifact. Called before the file is removed.
    async fn deliver(&self, user_id: UserId, artifact: &Artifact, caption: &str) -> Result<()>;
}

/// One throttled progress sample of a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub job_id: JobId,
    pub label: String,
    /// `None` while the total duration is unknown.
    pub percentage: Option<u8>,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub speed: Option<f64>,
}

/// Pushes job status to the renderer. Rendering failures and stalls are
/// logged and dropped; they never affect the job.
#[derive(Clone)]
pub struct ProgressReporter {
    renderer: Arc<dyn Renderer>,
    show_timeout: Duration,
    deliver_timeout: Duration,
}

impl ProgressReporter {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            show_timeout: Duration::from_secs(10),
            deliver_timeout: Duration::from_secs(600),
        }
    }

    /// Bounds each status edit and each artifact delivery.
    pub fn with_timeouts(mut self, show: Duration, deliver: Duration) -> Self {
        self.show_timeout = show;
        self.deliver_timeout = deliver;
        self
    }

    pub async fn show(&self, user_id: UserId, view: &View) {
        match time::timeout(self.show_timeout, self.renderer.show(user_id, view)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(message = "Could not render status", user_id, error = ?err),
            Err(_) => warn!(user_id, timeout = ?self.show_timeout, "Rendering status timed out"),
        }
    }

    pub async fn progress(&self, user_id: UserId, update: &StatusUpdate) {
        let view = View {
            text: render_status(update),
            keyboard: vec![vec![Button::new("Cancel", Action::CancelJob(update.job_id))]],
        };
        self.show(user_id, &view).await;
    }

    /// Starts a task rendering the progress of one job, so a slow renderer
    /// never stalls the encode it reports on.
    pub fn feed(&self, user_id: UserId) -> ProgressFeed {
        let (updates, mut rx) = watch::channel(None::<StatusUpdate>);
        let reporter = self.clone();
        let task = tokio::spawn(
            async move {
                while rx.changed().await.is_ok() {
                    let update = rx.borrow_and_update().clone();
                    if let Some(update) = update {
                        reporter.progress(user_id, &update).await;
                    }
                }
            }
            .in_current_span(),
        );
        ProgressFeed { updates, task }
    }

    pub async fn completed(&self, handle: &JobHandle, artifact: &Artifact) {
        let user_id = handle.user_id();
        let label = handle.task.label();
        self.show(user_id, &View::message(format!("Encode {} finished, uploading.", label)))
            .await;

        let caption = compression_caption(&label, artifact);
        let delivery = self.renderer.deliver(user_id, artifact, &caption);
        match time::timeout(self.deliver_timeout, delivery).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(message = "Could not deliver artifact", user_id, error = ?err),
            Err(_) => warn!(user_id, timeout = ?self.deliver_timeout, "Delivering artifact timed out"),
        }
    }

    pub async fn failed(&self, handle: &JobHandle, message: &str) {
        let text = format!("Encode {} failed.\n{}", handle.task.label(), message);
        self.show(handle.user_id(), &View::message(text)).await;
    }

    pub async fn cancelled(&self, handle: &JobHandle) {
        let text = format!("Encode {} cancelled.", handle.task.label());
        self.show(handle.user_id(), &View::message(text)).await;
    }
}

/// Latest-value channel into a job's rendering task. Updates that arrive
/// while an earlier one is still being rendered replace each other.
pub struct ProgressFeed {
    updates: watch::Sender<Option<StatusUpdate>>,
    task: JoinHandle<()>,
}

impl ProgressFeed {
    pub fn push(&self, update: StatusUpdate) {
        self.updates.send_replace(Some(update));
    }

    /// Stops the rendering task, abandoning an update still in flight.
    pub async fn close(self) {
        self.task.abort();
        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                warn!(message = "Progress renderer failed", error = ?err);
            }
        }
    }
}

pub fn render_status(update: &StatusUpdate) -> String {
    let mut text = format!("Compressing {}\n\n", update.label);
    let eta = update.eta.map(format_duration).unwrap_or_else(|| "-".to_string());
    let _ = writeln!(text, "ETA: {}", eta);
    let _ = writeln!(text, "Elapsed: {}", format_duration(update.elapsed));
    if let Some(speed) = update.speed {
        let _ = writeln!(text, "Speed: {:.2}x", speed);
    }
    text.push('\n');

    match update.percentage {
        Some(pct) => {
            let _ = write!(text, "Progress: {}%\n[{}]", pct, progress_bar(pct));
        }
        None => text.push_str("Progress: unknown (source duration not available)"),
    }
    text
}

/// Ten cells, one per full ten percent.
pub fn progress_bar(percentage: u8) -> String {
    let done = (usize::from(percentage.min(100)) / 10).min(BAR_CELLS);
    let mut bar = String::with_capacity(BAR_CELLS * 3);
    bar.extend(std::iter::repeat(FINISHED_CELL).take(done));
    bar.extend(std::iter::repeat(UNFINISHED_CELL).take(BAR_CELLS - done));
    bar
}

/// `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

pub fn human_bytes(size: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if size == 0 {
        return "0 B".to_string();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", size)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

pub fn compression_caption(label: &str, artifact: &Artifact) -> String {
    format!(
        "Encode {} complete\nOriginal: {}\nCompressed: {}\nSaved: {:.1}%\nTime: {}",
        label,
        human_bytes(artifact.original_size),
        human_bytes(artifact.output_size),
        artifact.saved_percent(),
        format_duration(artifact.elapsed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn update(percentage: Option<u8>) -> StatusUpdate {
        StatusUpdate {
            job_id: Uuid::nil(),
            label: "720p_CRF20".to_string(),
            percentage,
            eta: Some(Duration::from_secs(62)),
            elapsed: Duration::from_secs(3723),
            speed: Some(1.5),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3)), "3s");
        assert_eq!(format_duration(Duration::from_secs(123)), "2m 3s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
        assert_eq!(format_duration(Duration::from_millis(999)), "0s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h 0m 0s");
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0), "░░░░░░░░░░");
        assert_eq!(progress_bar(42), "▓▓▓▓░░░░░░");
        assert_eq!(progress_bar(100), "▓▓▓▓▓▓▓▓▓▓");
        assert_eq!(progress_bar(250), "▓▓▓▓▓▓▓▓▓▓");
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.50 KB");
        assert_eq!(human_bytes(4 * 1024 * 1024 * 1024), "4.00 GB");
    }

    #[test]
    fn test_render_status() {
        let text = render_status(&update(Some(42)));
        assert!(text.starts_with("Compressing 720p_CRF20"));
        assert!(text.contains("ETA: 1m 2s"));
        assert!(text.contains("Elapsed: 1h 2m 3s"));
        assert!(text.contains("Speed: 1.50x"));
        assert!(text.contains("Progress: 42%\n[▓▓▓▓░░░░░░]"));

        let mut unknown = update(None);
        unknown.eta = None;
        unknown.speed = None;
        let text = render_status(&unknown);
        assert!(text.contains("ETA: -"));
        assert!(text.contains("Progress: unknown"));
        assert!(!text.contains('▓'));
    }

    #[test]
    fn test_caption() {
        let artifact = Artifact {
            path: PathBuf::from("/w/out.mp4"),
            thumbnail: None,
            original_size: 10 * 1024 * 1024,
            output_size: 4 * 1024 * 1024,
            elapsed: Duration::from_secs(65),
        };
        let caption = compression_caption("480p_CRF23", &artifact);
        assert!(caption.contains("Original: 10.00 MB"));
        assert!(caption.contains("Compressed: 4.00 MB"));
        assert!(caption.contains("Saved: 60.0%"));
        assert!(caption.contains("Time: 1m 5s"));
    }

    /// Sleeps on every call, like a transport under flood control.
    struct StallingRenderer {
        stall: Duration,
        shown: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Renderer for StallingRenderer {
        async fn show(&self, _user_id: UserId, view: &View) -> Result<()> {
            self.shown.lock().unwrap().push(view.text.clone());
            tokio::time::sleep(self.stall).await;
            Ok(())
        }

        async fn deliver(&self, _user_id: UserId, _artifact: &Artifact, _caption: &str) -> Result<()> {
            tokio::time::sleep(self.stall).await;
            Ok(())
        }
    }

    fn stalling(stall: Duration) -> Arc<StallingRenderer> {
        Arc::new(StallingRenderer {
            stall,
            shown: std::sync::Mutex::new(vec![]),
        })
    }

    #[tokio::test]
    async fn test_show_gives_up_after_timeout() {
        let renderer = stalling(Duration::from_secs(30));
        let reporter = ProgressReporter::new(renderer.clone())
            .with_timeouts(Duration::from_millis(20), Duration::from_millis(20));

        let started = std::time::Instant::now();
        reporter.show(1, &View::message("hello")).await;
        reporter.progress(1, &update(Some(10))).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(renderer.shown.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_feed_keeps_latest_and_never_blocks() {
        let renderer = stalling(Duration::from_millis(50));
        let reporter = ProgressReporter::new(renderer.clone());
        let feed = reporter.feed(1);

        let started = std::time::Instant::now();
        for pct in [10, 20, 30, 40] {
            feed.push(update(Some(pct)));
        }
        assert!(started.elapsed() < Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(200)).await;
        feed.close().await;

        let shown = renderer.shown.lock().unwrap().clone();
        assert!(!shown.is_empty() && shown.len() < 4, "{:?}", shown);
        assert!(shown.last().unwrap().contains("Progress: 40%"));
    }
}
