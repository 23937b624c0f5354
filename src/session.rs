//! Per-user configuration sessions and the state machine that edits them.

use crate::error::{Error, Result};
use crate::settings::{EncodeSettings, QualityPreset, Setting};
use crate::UserId;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Media handed over by the transport, already stored locally.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
    pub path: PathBuf,
    pub file_name: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared duration in seconds, if the transport knows it.
    pub duration: Option<f64>,
}

impl MediaSource {
    pub fn new(path: impl Into<PathBuf>, size: u64, duration: Option<f64>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            file_name,
            size,
            duration,
        }
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingQuality,
    /// Only reached through the "custom" quality.
    AwaitingResolution,
    AwaitingEncodingSettings,
    /// Frozen while the registry decides whether to accept the job.
    ReadyToStart,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub source: MediaSource,
    pub quality: Option<QualityPreset>,
    pub settings: EncodeSettings,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    touched: Instant,
}

impl Session {
    fn new(user_id: UserId, source: MediaSource) -> Self {
        Self {
            user_id,
            source,
            quality: None,
            settings: EncodeSettings::default(),
            state: SessionState::AwaitingQuality,
            created_at: Utc::now(),
            touched: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.state != SessionState::ReadyToStart && self.touched.elapsed() > ttl
    }

    fn select_quality(&mut self, preset: QualityPreset) -> Result<()> {
        if self.state == SessionState::ReadyToStart {
            return Err(Error::validation("encode is already starting"));
        }
        self.settings.apply_preset(preset);
        self.quality = Some(preset);
        self.state = if preset.is_custom() {
            SessionState::AwaitingResolution
        } else {
            SessionState::AwaitingEncodingSettings
        };
        Ok(())
    }

    fn update_setting(&mut self, setting: Setting) -> Result<()> {
        match (self.state, setting) {
            (SessionState::AwaitingResolution, Setting::Resolution(_)) => {
                self.state = SessionState::AwaitingEncodingSettings;
            }
            (SessionState::AwaitingResolution, _) => {
                return Err(Error::validation("choose a resolution first"));
            }
            (SessionState::AwaitingEncodingSettings, _) => {}
            (SessionState::AwaitingQuality, _) => {
                return Err(Error::validation("choose a quality first"));
            }
            (SessionState::ReadyToStart, _) => {
                return Err(Error::validation("encode is already starting"));
            }
        }
        self.settings.apply(setting);
        Ok(())
    }

    fn back_to_quality(&mut self) -> Result<()> {
        if self.state == SessionState::ReadyToStart {
            return Err(Error::validation("encode is already starting"));
        }
        self.state = SessionState::AwaitingQuality;
        Ok(())
    }

    fn begin_start(&mut self) -> Result<()> {
        match self.state {
            SessionState::AwaitingEncodingSettings => {
                self.state = SessionState::ReadyToStart;
                Ok(())
            }
            SessionState::ReadyToStart => Err(Error::validation("encode is already starting")),
            _ => Err(Error::validation("finish choosing the encode settings first")),
        }
    }
}

/// Limits applied to inbound media and idle sessions.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub ttl: Duration,
    pub max_file_size: u64,
    /// Lowercase extensions without the dot. Empty accepts everything.
    pub allowed_extensions: Vec<String>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_file_size: 4 * 1024 * 1024 * 1024,
            allowed_extensions: [
                "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "3gp", "ts", "mts", "m2ts",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Sessions keyed by user. Every edit runs against a copy and is committed
/// only if it succeeds, so a rejected edit never leaves a partial change.
pub struct SessionStore {
    sessions: DashMap<UserId, Session>,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn validate_media(&self, media: &MediaSource) -> Result<()> {
        if media.size > self.limits.max_file_size {
            return Err(Error::validation(format!(
                "file is {} bytes, the limit is {}",
                media.size, self.limits.max_file_size
            )));
        }
        if !self.limits.allowed_extensions.is_empty() {
            let allowed = media
                .extension()
                .map(|ext| self.limits.allowed_extensions.contains(&ext))
                .unwrap_or(false);
            if !allowed {
                return Err(Error::validation(format!(
                    "unsupported file type '{}'",
                    media.file_name
                )));
            }
        }
        Ok(())
    }

    /// Creates a session in `AwaitingQuality`. An expired session for the same
    /// user is replaced and handed back so its files can be cleaned up.
    pub fn create(&self, user_id: UserId, media: MediaSource) -> Result<(Session, Option<Session>)> {
        self.validate_media(&media)?;

        match self.sessions.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired(self.limits.ttl) {
                    return Err(Error::Conflict {
                        user_id,
                        what: "a session awaiting configuration",
                    });
                }
                let session = Session::new(user_id, media);
                let stale = entry.insert(session.clone());
                debug!(user_id, "Replaced expired session");
                Ok((session, Some(stale)))
            }
            Entry::Vacant(entry) => {
                let session = Session::new(user_id, media);
                entry.insert(session.clone());
                Ok((session, None))
            }
        }
    }

    /// Snapshot of the user's live session.
    pub fn get(&self, user_id: UserId) -> Result<Session> {
        match self.sessions.get(&user_id) {
            Some(session) if !session.is_expired(self.limits.ttl) => Ok(session.clone()),
            _ => Err(Error::NotFound(user_id)),
        }
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.get(user_id).is_ok()
    }

    pub fn select_quality(&self, user_id: UserId, preset: QualityPreset) -> Result<Session> {
        self.modify(user_id, |session| session.select_quality(preset))
    }

    pub fn update_setting(&self, user_id: UserId, setting: Setting) -> Result<Session> {
        self.modify(user_id, |session| session.update_setting(setting))
    }

    pub fn back_to_quality(&self, user_id: UserId) -> Result<Session> {
        self.modify(user_id, Session::back_to_quality)
    }

    /// Snapshot of the live session, restarting its expiry clock.
    pub fn touch(&self, user_id: UserId) -> Result<Session> {
        self.modify(user_id, |_| Ok(()))
    }

    /// Freezes the session for submission.
    pub fn begin_start(&self, user_id: UserId) -> Result<Session> {
        self.modify(user_id, Session::begin_start)
    }

    /// Thaws a session whose submission was rejected.
    pub fn abort_start(&self, user_id: UserId) {
        if let Some(mut session) = self.sessions.get_mut(&user_id) {
            if session.state == SessionState::ReadyToStart {
                session.state = SessionState::AwaitingEncodingSettings;
                session.touched = Instant::now();
            }
        }
    }

    /// Removes the session, expired or not.
    pub fn remove(&self, user_id: UserId) -> Option<Session> {
        self.sessions.remove(&user_id).map(|(_, session)| session)
    }

    /// Drops every expired session and returns them for cleanup.
    pub fn sweep_expired(&self) -> Vec<Session> {
        let ttl = self.limits.ttl;
        let expired: Vec<UserId> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired(ttl))
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|user_id| {
                self.sessions
                    .remove_if(&user_id, |_, session| session.is_expired(ttl))
                    .map(|(_, session)| session)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn modify<F>(&self, user_id: UserId, edit: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let mut entry = match self.sessions.get_mut(&user_id) {
            Some(entry) if !entry.is_expired(self.limits.ttl) => entry,
            _ => return Err(Error::NotFound(user_id)),
        };

        let mut next = entry.clone();
        edit(&mut next)?;
        next.touched = Instant::now();
        *entry = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AudioCodec, EncoderPreset, Resolution, VideoCodec};

    fn store() -> SessionStore {
        SessionStore::new(SessionLimits::default())
    }

    fn media() -> MediaSource {
        MediaSource::new("/tmp/vidq/input.mkv", 10_000, Some(60.0))
    }

    #[test]
    fn test_create_conflicts_on_live_session() {
        let store = store();
        let (session, stale) = store.create(1, media()).unwrap();
        assert_eq!(session.state, SessionState::AwaitingQuality);
        assert!(stale.is_none());
        assert!(matches!(
            store.create(1, media()),
            Err(Error::Conflict { user_id: 1, .. })
        ));
        assert!(store.create(2, media()).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_media_validation() {
        let store = store();
        let too_big = MediaSource::new("/tmp/a.mp4", 5 * 1024 * 1024 * 1024, None);
        assert!(matches!(store.create(1, too_big), Err(Error::Validation(_))));
        let wrong_type = MediaSource::new("/tmp/a.txt", 10, None);
        assert!(matches!(store.create(1, wrong_type), Err(Error::Validation(_))));
        let upper = MediaSource::new("/tmp/CLIP.MP4", 10, None);
        assert!(store.create(1, upper).is_ok());
    }

    #[test]
    fn test_named_preset_flow() {
        let store = store();
        store.create(1, media()).unwrap();

        let session = store.select_quality(1, QualityPreset::P720).unwrap();
        assert_eq!(session.state, SessionState::AwaitingEncodingSettings);
        assert_eq!(session.settings.crf, 20);
        assert_eq!(session.settings.preset, EncoderPreset::Medium);
        assert_eq!(session.settings.resolution, Some(Resolution::HD));
        assert_eq!(session.settings.video_codec, VideoCodec::H264);

        let session = store.select_quality(1, QualityPreset::P720Hevc).unwrap();
        assert_eq!(session.settings.crf, 22);
        assert_eq!(session.settings.video_codec, VideoCodec::Hevc);
        assert_eq!(session.settings.resolution, Some(Resolution::HD));
        assert_eq!(session.settings.preset, EncoderPreset::Medium);

        // Going back to a plain preset must undo the HEVC switch.
        let session = store.select_quality(1, QualityPreset::P1080).unwrap();
        assert_eq!(session.settings.video_codec, VideoCodec::H264);
    }

    #[test]
    fn test_every_preset_sets_its_bundle() {
        let store = store();
        store.create(1, media()).unwrap();
        for preset in QualityPreset::ALL {
            let expected = preset.defaults();
            let session = store.select_quality(1, *preset).unwrap();
            assert_eq!(session.quality, Some(*preset));
            assert_eq!(session.settings.resolution, expected.resolution);
            assert_eq!(session.settings.crf, expected.crf);
            assert_eq!(session.settings.preset, expected.preset);
            assert_eq!(session.settings.video_codec, expected.codec);
        }
    }

    #[test]
    fn test_custom_requires_resolution() {
        let store = store();
        store.create(1, media()).unwrap();

        let session = store.select_quality(1, QualityPreset::Custom).unwrap();
        assert_eq!(session.state, SessionState::AwaitingResolution);

        let err = store.update_setting(1, Setting::Crf(30)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.get(1).unwrap().settings.crf, 23);

        let session = store
            .update_setting(1, Setting::Resolution(Some(Resolution::QHD)))
            .unwrap();
        assert_eq!(session.state, SessionState::AwaitingEncodingSettings);
        assert_eq!(session.settings.resolution, Some(Resolution::QHD));
    }

    #[test]
    fn test_original_resolution_clears_field() {
        let store = store();
        store.create(1, media()).unwrap();
        store.select_quality(1, QualityPreset::P480).unwrap();
        let session = store.update_setting(1, Setting::Resolution(None)).unwrap();
        assert_eq!(session.settings.resolution, None);
        assert_eq!(session.state, SessionState::AwaitingEncodingSettings);
    }

    #[test]
    fn test_settings_need_quality_first() {
        let store = store();
        store.create(1, media()).unwrap();
        assert!(store
            .update_setting(1, Setting::AudioCodec(AudioCodec::Copy))
            .is_err());
        assert!(store.begin_start(1).is_err());
        assert!(matches!(
            store.select_quality(9, QualityPreset::P720),
            Err(Error::NotFound(9))
        ));
    }

    #[test]
    fn test_start_freezes_and_thaws() {
        let store = store();
        store.create(1, media()).unwrap();
        store.select_quality(1, QualityPreset::P720).unwrap();

        let frozen = store.begin_start(1).unwrap();
        assert_eq!(frozen.state, SessionState::ReadyToStart);
        assert!(store.update_setting(1, Setting::Crf(18)).is_err());
        assert!(store.select_quality(1, QualityPreset::P480).is_err());

        store.abort_start(1);
        assert_eq!(
            store.get(1).unwrap().state,
            SessionState::AwaitingEncodingSettings
        );
        assert!(store.update_setting(1, Setting::Crf(18)).is_ok());
    }

    #[test]
    fn test_back_to_quality_keeps_fields() {
        let store = store();
        store.create(1, media()).unwrap();
        store.select_quality(1, QualityPreset::P720).unwrap();
        store.update_setting(1, Setting::Crf(28)).unwrap();
        let session = store.back_to_quality(1).unwrap();
        assert_eq!(session.state, SessionState::AwaitingQuality);
        assert_eq!(session.settings.crf, 28);
    }

    #[test]
    fn test_expiry() {
        let store = SessionStore::new(SessionLimits {
            ttl: Duration::from_millis(5),
            ..SessionLimits::default()
        });
        store.create(1, media()).unwrap();
        store.create(2, media()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // Expired sessions are invisible before the sweep runs.
        assert!(matches!(store.get(1), Err(Error::NotFound(1))));
        assert!(store.select_quality(1, QualityPreset::P720).is_err());

        let (_, stale) = store.create(1, media()).unwrap();
        assert!(stale.is_some());

        let swept = store.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].user_id, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_browsing_menus_keeps_session_alive() {
        let store = SessionStore::new(SessionLimits {
            ttl: Duration::from_millis(200),
            ..SessionLimits::default()
        });
        store.create(1, media()).unwrap();
        store.select_quality(1, QualityPreset::P720).unwrap();

        std::thread::sleep(Duration::from_millis(120));
        let touched = store.touch(1).unwrap();
        assert_eq!(touched.state, SessionState::AwaitingEncodingSettings);
        std::thread::sleep(Duration::from_millis(120));

        assert!(store.get(1).is_ok());
        assert!(store.sweep_expired().is_empty());

        std::thread::sleep(Duration::from_millis(250));
        assert!(matches!(store.touch(1), Err(Error::NotFound(1))));
    }
}
