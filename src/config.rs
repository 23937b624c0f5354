use crate::session::SessionLimits;
use crate::supervisor::SupervisorSettings;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Menu-driven video transcode orchestrator")]
pub struct Config {
    #[arg(
        short = 'w',
        long = "work_dir",
        env = "VIDQ_WORK_DIR",
        help = "Directory for source copies, progress files and outputs",
        default_value = "./vidq-work"
    )]
    pub work_dir: PathBuf,

    #[arg(long, env = "VIDQ_FFMPEG", help = "ffmpeg binary", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    #[arg(long, env = "VIDQ_FFPROBE", help = "ffprobe binary", default_value = "ffprobe")]
    pub ffprobe: PathBuf,

    #[arg(
        short = 'n',
        long = "number_active",
        env = "VIDQ_NUMBER_ACTIVE",
        help = "Number of Active Jobs in Parallel",
        default_value = "3",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub num: u16,

    #[arg(
        short = 'q',
        long = "queue_size",
        env = "VIDQ_QUEUE_SIZE",
        help = "Jobs allowed to wait for a free worker",
        default_value = "10"
    )]
    pub queue_size: usize,

    #[arg(
        long = "poll_interval_ms",
        env = "VIDQ_POLL_INTERVAL_MS",
        help = "Progress file polling interval",
        default_value = "3000"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "kill_grace_secs",
        env = "VIDQ_KILL_GRACE_SECS",
        help = "Seconds between SIGTERM and SIGKILL on cancel",
        default_value = "5"
    )]
    pub kill_grace_secs: u64,

    #[arg(
        long = "progress_step",
        env = "VIDQ_PROGRESS_STEP",
        help = "Minimum percentage advance between progress updates",
        default_value = "2",
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub progress_step: u8,

    #[arg(
        long = "indeterminate_interval_secs",
        env = "VIDQ_INDETERMINATE_INTERVAL_SECS",
        help = "Seconds between updates when the duration is unknown",
        default_value = "15"
    )]
    pub indeterminate_interval_secs: u64,

    #[arg(
        long = "session_ttl_secs",
        env = "VIDQ_SESSION_TTL_SECS",
        help = "Idle seconds before an unsubmitted session expires",
        default_value = "600"
    )]
    pub session_ttl_secs: u64,

    #[arg(
        long = "sweep_interval_secs",
        env = "VIDQ_SWEEP_INTERVAL_SECS",
        help = "Seconds between expiry sweeps",
        default_value = "60"
    )]
    pub sweep_interval_secs: u64,

    #[arg(
        long = "job_timeout_secs",
        env = "VIDQ_JOB_TIMEOUT_SECS",
        help = "Fail encodes running longer than this"
    )]
    pub job_timeout_secs: Option<u64>,

    #[arg(
        long = "no_thumbnails",
        env = "VIDQ_NO_THUMBNAILS",
        help = "Deliver encodes without a preview frame"
    )]
    pub no_thumbnails: bool,

    #[arg(
        long = "thumbnail_timeout_secs",
        env = "VIDQ_THUMBNAIL_TIMEOUT_SECS",
        help = "Give up on a preview frame after this long",
        default_value = "30"
    )]
    pub thumbnail_timeout_secs: u64,

    #[arg(
        long = "render_timeout_secs",
        env = "VIDQ_RENDER_TIMEOUT_SECS",
        help = "Give up on a status edit after this long",
        default_value = "10"
    )]
    pub render_timeout_secs: u64,

    #[arg(
        long = "deliver_timeout_secs",
        env = "VIDQ_DELIVER_TIMEOUT_SECS",
        help = "Give up on delivering a finished encode after this long",
        default_value = "600"
    )]
    pub deliver_timeout_secs: u64,

    #[arg(
        short = 'c',
        long = "connect_url",
        env = "VIDQ_DATABASE_URL",
        help = "PostgreSQL Connection URL for user statistics"
    )]
    pub connect_url: Option<String>,

    #[arg(
        long = "jaeger_endpoint",
        env = "VIDQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,

    #[arg(
        long = "max_file_size",
        env = "VIDQ_MAX_FILE_SIZE",
        help = "Largest accepted source, in bytes",
        default_value = "4294967296"
    )]
    pub max_file_size: u64,

    #[arg(
        long = "allowed_extensions",
        env = "VIDQ_ALLOWED_EXTENSIONS",
        help = "Accepted source file extensions",
        value_delimiter = ',',
        default_value = "mp4,mkv,avi,mov,wmv,flv,webm,m4v,3gp,ts,mts,m2ts"
    )]
    pub allowed_extensions: Vec<String>,

    #[arg(
        short = 'o',
        long = "deliver_dir",
        env = "VIDQ_DELIVER_DIR",
        help = "Where the console transport places finished encodes",
        default_value = "./vidq-out"
    )]
    pub deliver_dir: PathBuf,
}

impl Config {
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            progress_step: self.progress_step,
            indeterminate_interval: Duration::from_secs(self.indeterminate_interval_secs),
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
            thumbnails: !self.no_thumbnails,
            thumbnail_timeout: Duration::from_secs(self.thumbnail_timeout_secs),
        }
    }

    /// Status edit and delivery bounds for the reporter.
    pub fn render_timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.render_timeout_secs.max(1)),
            Duration::from_secs(self.deliver_timeout_secs.max(1)),
        )
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            ttl: Duration::from_secs(self.session_ttl_secs),
            max_file_size: self.max_file_size,
            allowed_extensions: self
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let config = Config::parse_from(["vidq"]);
        assert_eq!(config.num, 3);
        assert_eq!(config.queue_size, 10);
        assert_eq!(config.connect_url, None);

        let settings = config.supervisor_settings();
        let defaults = SupervisorSettings::default();
        assert_eq!(settings.poll_interval, defaults.poll_interval);
        assert_eq!(settings.kill_grace, defaults.kill_grace);
        assert_eq!(settings.progress_step, defaults.progress_step);
        assert_eq!(settings.indeterminate_interval, defaults.indeterminate_interval);
        assert_eq!(settings.job_timeout, None);
        assert_eq!(settings.thumbnails, defaults.thumbnails);
        assert_eq!(settings.thumbnail_timeout, defaults.thumbnail_timeout);
        assert_eq!(
            config.render_timeouts(),
            (Duration::from_secs(10), Duration::from_secs(600))
        );

        let limits = config.session_limits();
        let defaults = SessionLimits::default();
        assert_eq!(limits.ttl, defaults.ttl);
        assert_eq!(limits.max_file_size, defaults.max_file_size);
        assert_eq!(limits.allowed_extensions, defaults.allowed_extensions);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse_from([
            "vidq",
            "-n",
            "5",
            "--job_timeout_secs",
            "3600",
            "--allowed_extensions",
            ".MP4, mkv",
            "--poll_interval_ms",
            "250",
            "--no_thumbnails",
        ]);
        assert!(!config.supervisor_settings().thumbnails);
        assert_eq!(config.num, 5);
        assert_eq!(
            config.supervisor_settings().job_timeout,
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            config.supervisor_settings().poll_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.session_limits().allowed_extensions, vec!["mp4", "mkv"]);
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(Config::try_parse_from(["vidq", "-n", "0"]).is_err());
        assert!(Config::try_parse_from(["vidq", "--progress_step", "0"]).is_err());
    }
}
