//! Source media inspection.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeInfo {
    /// Duration in seconds.
    pub duration: Option<f64>,
    /// Bits per second.
    pub bitrate: Option<u64>,
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo>;
}

/// Reads container metadata through `ffprobe`.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    program: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl Ffprobe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MediaProbe for Ffprobe {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::Probe(format!("{} does not exist", path.display())));
        }

        let output = Command::new(&self.program)
            .args(["-v", "error", "-print_format", "json", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| Error::Probe(format!("could not run ffprobe: {}", err)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Probe(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let info = parse_output(&output.stdout)?;
        debug!(path = %path.display(), duration = ?info.duration, bitrate = ?info.bitrate, "Probed source");
        Ok(info)
    }
}

fn parse_output(stdout: &[u8]) -> Result<ProbeInfo> {
    let output: FfprobeOutput = serde_json::from_slice(stdout)
        .map_err(|err| Error::Probe(format!("unreadable ffprobe output: {}", err)))?;

    let Some(format) = output.format else {
        return Ok(ProbeInfo::default());
    };

    let duration = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);
    let bitrate = format.bit_rate.as_deref().and_then(|b| b.parse::<u64>().ok());

    Ok(ProbeInfo { duration, bitrate })
}
