//! ffmpeg `-progress` sidecar parsing and the maths derived from it.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Continue,
    End,
}

/// Latest values seen in the sidecar file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub frame: Option<u64>,
    /// Output position in microseconds. ffmpeg names this `out_time_ms`
    /// although the unit has always been microseconds.
    pub out_time_us: Option<u64>,
    /// Encoding speed as a multiple of realtime.
    pub speed: Option<f64>,
    pub state: Option<ProgressState>,
}

impl ProgressSample {
    /// Parses the whole sidecar text. ffmpeg appends a block per report, so
    /// later lines override earlier ones.
    pub fn parse(text: &str) -> Self {
        let mut sample = ProgressSample::default();
        for line in text.lines() {
            sample.apply_line(line);
        }
        sample
    }

    fn apply_line(&mut self, line: &str) {
        let Some((key, value)) = line.trim().split_once('=') else {
            return;
        };
        let value = value.trim();

        match key {
            "out_time_ms" | "out_time_us" => {
                if let Ok(us) = value.parse() {
                    self.out_time_us = Some(us);
                }
            }
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.frame = Some(frame);
                }
            }
            "speed" => {
                // "1.5x", or "N/A" before the first frame
                self.speed = value
                    .strip_suffix('x')
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .filter(|s| s.is_finite());
            }
            "progress" => match value {
                "end" => self.state = Some(ProgressState::End),
                "continue" => self.state = Some(ProgressState::Continue),
                _ => {}
            },
            _ => {}
        }
    }

    pub fn processed_seconds(&self) -> f64 {
        self.out_time_us.map(|us| us as f64 / 1_000_000.0).unwrap_or(0.0)
    }

    pub fn is_end(&self) -> bool {
        self.state == Some(ProgressState::End)
    }
}

/// Whole percent done, or `None` when the total duration is unknown.
pub fn percentage(processed_seconds: f64, total_seconds: Option<f64>) -> Option<u8> {
    let total = total_seconds.filter(|t| t.is_finite() && *t > 0.0)?;
    let processed = processed_seconds.max(0.0);
    let pct = (processed * 100.0 / total).floor().min(100.0);
    Some(pct as u8)
}

/// Remaining encode time, or `None` when speed or total duration is unknown.
pub fn eta(processed_seconds: f64, total_seconds: Option<f64>, speed: Option<f64>) -> Option<Duration> {
    let total = total_seconds.filter(|t| t.is_finite() && *t > 0.0)?;
    let speed = speed.filter(|s| s.is_finite() && *s > 0.0)?;
    let remaining = ((total - processed_seconds) / speed).floor().max(0.0);
    Some(Duration::from_secs(remaining as u64))
}

/// Decides which samples are worth pushing to the caller. Percentages it
/// lets through never go down.
#[derive(Debug)]
pub struct Throttle {
    step: u8,
    indeterminate_interval: Duration,
    last_percentage: u8,
    last_emit: Option<Instant>,
}

impl Throttle {
    pub fn new(step: u8, indeterminate_interval: Duration) -> Self {
        Self {
            step: step.max(1),
            indeterminate_interval,
            last_percentage: 0,
            last_emit: None,
        }
    }

    pub fn admit(&mut self, percentage: Option<u8>, now: Instant) -> bool {
        let emit = match percentage {
            Some(pct) => {
                pct >= self.last_percentage.saturating_add(self.step)
                    || (pct == 100 && self.last_percentage < 100)
            }
            None => self
                .last_emit
                .map(|last| now.duration_since(last) >= self.indeterminate_interval)
                .unwrap_or(true),
        };
        if emit {
            if let Some(pct) = percentage {
                self.last_percentage = pct;
            }
            self.last_emit = Some(now);
        }
        emit
    }

    pub fn last_percentage(&self) -> u8 {
        self.last_percentage
    }
}

/// Reads the current state of a job's progress channel.
#[async_trait]
pub trait ProgressPoller: Send + Sync {
    async fn poll(&self, sidecar: &Path) -> ProgressSample;
}

/// Reads the `-progress` file from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarPoller;

#[async_trait]
impl ProgressPoller for SidecarPoller {
    async fn poll(&self, sidecar: &Path) -> ProgressSample {
        match tokio::fs::read_to_string(sidecar).await {
            Ok(text) => ProgressSample::parse(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => ProgressSample::default(),
            Err(err) => {
                debug!(message = "Could not read progress file", path = %sidecar.display(), error = ?err);
                ProgressSample::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIDECAR: &str = "frame=120\nfps=24.00\nout_time_us=5000000\nout_time_ms=5000000\n\
        out_time=00:00:05.000000\nspeed=2.01x\nprogress=continue\n\
        frame=240\nout_time_ms=10000000\nspeed=N/A\nprogress=end\n";

    #[test]
    fn test_latest_values_win() {
        let sample = ProgressSample::parse(SIDECAR);
        assert_eq!(sample.frame, Some(240));
        assert_eq!(sample.out_time_us, Some(10_000_000));
        assert_eq!(sample.speed, None);
        assert!(sample.is_end());
        assert!((sample.processed_seconds() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_and_garbage_lines() {
        let sample = ProgressSample::parse("frame=1\nspeed=1.5x\nout_time_ms=\nnot a line\nprogress=");
        assert_eq!(sample.frame, Some(1));
        assert_eq!(sample.speed, Some(1.5));
        assert_eq!(sample.out_time_us, None);
        assert_eq!(sample.state, None);
        assert_eq!(ProgressSample::parse(""), ProgressSample::default());
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0.0, Some(100.0)), Some(0));
        assert_eq!(percentage(41.9, Some(100.0)), Some(41));
        assert_eq!(percentage(250.0, Some(100.0)), Some(100));
        assert_eq!(percentage(-3.0, Some(100.0)), Some(0));
        assert_eq!(percentage(0.0, Some(0.0)), None);
        assert_eq!(percentage(10.0, Some(-5.0)), None);
        assert_eq!(percentage(10.0, None), None);
    }

    #[test]
    fn test_percentage_is_monotonic() {
        let total = Some(37.3);
        let mut last = 0;
        for step in 0..500 {
            let pct = percentage(step as f64 * 0.1, total).unwrap();
            assert!(pct >= last);
            last = pct;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta(5.0, Some(10.0), Some(2.0)), Some(Duration::from_secs(2)));
        assert_eq!(eta(12.0, Some(10.0), Some(1.0)), Some(Duration::ZERO));
        assert_eq!(eta(5.0, Some(10.0), Some(0.0)), None);
        assert_eq!(eta(5.0, Some(10.0), None), None);
        assert_eq!(eta(5.0, None, Some(1.0)), None);
    }

    #[test]
    fn test_throttle_steps() {
        let now = Instant::now();
        let mut throttle = Throttle::new(2, Duration::from_secs(15));
        assert!(!throttle.admit(Some(1), now));
        assert!(throttle.admit(Some(2), now));
        assert!(!throttle.admit(Some(3), now));
        assert!(!throttle.admit(Some(1), now));
        assert!(throttle.admit(Some(10), now));
        assert!(throttle.admit(Some(100), now));
        assert!(!throttle.admit(Some(100), now));
        assert_eq!(throttle.last_percentage(), 100);
    }

    #[test]
    fn test_throttle_indeterminate() {
        let start = Instant::now();
        let mut throttle = Throttle::new(2, Duration::from_secs(15));
        assert!(throttle.admit(None, start));
        assert!(!throttle.admit(None, start + Duration::from_secs(14)));
        assert!(throttle.admit(None, start + Duration::from_secs(15)));
        assert_eq!(throttle.last_percentage(), 0);
    }

    #[tokio::test]
    async fn test_sidecar_poller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.progress");

        assert_eq!(SidecarPoller.poll(&path).await, ProgressSample::default());

        tokio::fs::write(&path, SIDECAR).await.unwrap();
        assert!(SidecarPoller.poll(&path).await.is_end());
    }
}
