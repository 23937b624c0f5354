//! Immutable encode specification and the ffmpeg invocation built from it.

use crate::session::Session;
use crate::settings::{AudioCodec, EncodeSettings, QualityPreset};
use crate::{JobId, UserId};
use std::path::{Path, PathBuf};

/// Everything the supervisor needs to run one encode. Built once, at start.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeTask {
    pub job_id: JobId,
    pub user_id: UserId,
    pub source: PathBuf,
    pub source_size: u64,
    /// Total duration in seconds. `None` makes progress indeterminate.
    pub duration: Option<f64>,
    pub quality: Option<QualityPreset>,
    pub settings: EncodeSettings,
    pub output: PathBuf,
    /// Sidecar file ffmpeg writes `key=value` progress lines into.
    pub progress: PathBuf,
    pub thumbnail: PathBuf,
}

impl EncodeTask {
    /// Freezes `session` into a task with fresh per-job paths under `work_dir`.
    pub fn from_session(
        session: &Session,
        job_id: JobId,
        work_dir: &Path,
        duration: Option<f64>,
    ) -> Self {
        let stem = job_id.simple().to_string();
        Self {
            job_id,
            user_id: session.user_id,
            source: session.source.path.clone(),
            source_size: session.source.size,
            duration,
            quality: session.quality,
            settings: session.settings,
            output: work_dir.join(format!("{}_{}.mp4", session.user_id, stem)),
            progress: work_dir.join(format!("{}.progress", stem)),
            thumbnail: work_dir.join(format!("{}.jpg", stem)),
        }
    }

    /// Short description, e.g. `720p_CRF20`.
    pub fn label(&self) -> String {
        let quality = self.quality.unwrap_or(QualityPreset::Custom);
        format!("{}_CRF{}", quality, self.settings.crf)
    }

    /// ffmpeg arguments, excluding the program name. Pure: the same task
    /// always yields the same vector.
    pub fn args(&self) -> Vec<String> {
        let settings = &self.settings;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-progress".into(),
            path_arg(&self.progress),
            "-i".into(),
            path_arg(&self.source),
            "-c:v".into(),
            settings.video_codec.to_string(),
            "-preset".into(),
            settings.preset.to_string(),
            "-crf".into(),
            settings.crf.to_string(),
            "-pix_fmt".into(),
            settings.pixel_format.to_string(),
        ];

        if let Some(resolution) = settings.resolution {
            args.push("-vf".into());
            args.push(resolution.scale_filter());
        }

        match settings.audio_codec {
            AudioCodec::Copy => {
                args.push("-c:a".into());
                args.push("copy".into());
            }
            codec => {
                args.push("-c:a".into());
                args.push(codec.to_string());
                args.push("-b:a".into());
                args.push(settings.audio_bitrate.to_string());
            }
        }

        args.push("-movflags".into());
        args.push("+faststart".into());
        args.push(path_arg(&self.output));
        args
    }

    /// Grabs one 320x240 frame from the middle of the finished output.
    pub fn thumbnail_args(&self) -> Vec<String> {
        let at = self.duration.filter(|d| d.is_finite() && *d > 0.0).unwrap_or(0.0) / 2.0;
        vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-ss".into(),
            format!("{:.3}", at),
            "-i".into(),
            path_arg(&self.output),
            "-vframes".into(),
            "1".into(),
            "-q:v".into(),
            "2".into(),
            "-vf".into(),
            THUMBNAIL_FILTER.into(),
            path_arg(&self.thumbnail),
        ]
    }
}

const THUMBNAIL_FILTER: &str = "scale=320:240:force_original_aspect_ratio=increase,crop=320:240";

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MediaSource, SessionLimits, SessionStore};
    use crate::settings::{Resolution, Setting};
    use uuid::Uuid;

    fn task_with(edit: impl FnOnce(&mut EncodeSettings)) -> EncodeTask {
        let store = SessionStore::new(SessionLimits::default());
        store
            .create(7, MediaSource::new("/work/7_in.mkv", 1000, Some(30.0)))
            .unwrap();
        let mut session = store.select_quality(7, QualityPreset::P720).unwrap();
        edit(&mut session.settings);
        EncodeTask::from_session(&session, Uuid::nil(), Path::new("/work"), Some(30.0))
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_args_for_720p() {
        let task = task_with(|_| {});
        let args = task.args();
        assert_eq!(value_after(&args, "-i"), Some("/work/7_in.mkv"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-preset"), Some("medium"));
        assert_eq!(value_after(&args, "-crf"), Some("20"));
        assert_eq!(value_after(&args, "-pix_fmt"), Some("yuv420p"));
        assert_eq!(value_after(&args, "-vf"), Some("scale=1280:720"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-b:a"), Some("128k"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert_eq!(value_after(&args, "-loglevel"), Some("error"));
        assert_eq!(
            value_after(&args, "-progress"),
            Some("/work/00000000000000000000000000000000.progress")
        );
        assert_eq!(
            args.last().map(String::as_str),
            Some("/work/7_00000000000000000000000000000000.mp4")
        );
    }

    #[test]
    fn test_original_resolution_omits_scale() {
        let task = task_with(|s| s.apply(Setting::Resolution(None)));
        assert!(!task.args().iter().any(|a| a == "-vf"));
    }

    #[test]
    fn test_audio_copy_omits_bitrate() {
        let task = task_with(|s| s.apply(Setting::AudioCodec(AudioCodec::Copy)));
        let args = task.args();
        assert_eq!(value_after(&args, "-c:a"), Some("copy"));
        assert!(!args.iter().any(|a| a == "-b:a"));
    }

    #[test]
    fn test_args_are_deterministic() {
        let a = task_with(|s| s.apply(Setting::Resolution(Some(Resolution::UHD))));
        let b = a.clone();
        assert_eq!(a.args(), b.args());
        assert_eq!(a.args(), a.args());
    }

    #[test]
    fn test_paths_are_unique_per_job() {
        let store = SessionStore::new(SessionLimits::default());
        let (session, _) = store
            .create(7, MediaSource::new("/work/in.mp4", 1, None))
            .unwrap();
        let first = EncodeTask::from_session(&session, Uuid::new_v4(), Path::new("/w"), None);
        let second = EncodeTask::from_session(&session, Uuid::new_v4(), Path::new("/w"), None);
        assert_ne!(first.output, second.output);
        assert_ne!(first.progress, second.progress);
        assert_ne!(first.thumbnail, second.thumbnail);
        assert_ne!(first.output, first.source);
    }

    #[test]
    fn test_label() {
        assert_eq!(task_with(|_| {}).label(), "720p_CRF20");
    }

    #[test]
    fn test_thumbnail_args() {
        let task = task_with(|_| {});
        let args = task.thumbnail_args();
        assert_eq!(value_after(&args, "-ss"), Some("15.000"));
        assert_eq!(value_after(&args, "-i"), Some(path_arg(&task.output).as_str()));
        assert_eq!(value_after(&args, "-vframes"), Some("1"));
        assert_eq!(value_after(&args, "-q:v"), Some("2"));
        assert_eq!(value_after(&args, "-vf"), Some(THUMBNAIL_FILTER));
        assert_eq!(args.last(), Some(&path_arg(&task.thumbnail)));

        let unknown = EncodeTask {
            duration: None,
            ..task
        };
        assert_eq!(value_after(&unknown.thumbnail_args(), "-ss"), Some("0.000"));
    }
}
