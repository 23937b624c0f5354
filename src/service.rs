//! Per-user serialized entry points: inbound media, button actions, cancel
//! and the expiry sweep.

use crate::action::Action;
use crate::cleanup;
use crate::db::StatsStore;
use crate::error::{Error, Result};
use crate::locks::UserLocks;
use crate::probe::MediaProbe;
use crate::registry::{JobOutcome, JobRegistry};
use crate::reporter::human_bytes;
use crate::session::{MediaSource, SessionState, SessionStore};
use crate::view::{self, Button, View};
use crate::{JobId, UserId};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct Service {
    sessions: SessionStore,
    jobs: Arc<JobRegistry>,
    locks: UserLocks,
    probe: Arc<dyn MediaProbe>,
    stats: Arc<dyn StatsStore>,
}

impl Service {
    pub fn new(
        sessions: SessionStore,
        jobs: Arc<JobRegistry>,
        probe: Arc<dyn MediaProbe>,
        stats: Arc<dyn StatsStore>,
    ) -> Self {
        Self {
            sessions,
            jobs,
            locks: UserLocks::new(),
            probe,
            stats,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Opens a session for freshly stored media. The service owns the file
    /// from here on and removes it whenever the session or job ends.
    #[instrument(skip(self, media), fields(file = %media.file_name))]
    pub async fn media_received(&self, user_id: UserId, media: MediaSource) -> Result<View> {
        let _guard = self.locks.lock(user_id).await;

        let path = media.path.clone();
        let created = if self.jobs.contains(user_id) {
            Err(Error::Conflict {
                user_id,
                what: "an encode in progress",
            })
        } else {
            self.sessions.create(user_id, media)
        };

        match created {
            Ok((session, stale)) => {
                if let Some(stale) = stale {
                    cleanup::remove_quietly(&stale.source.path).await;
                }
                info!(size = session.source.size, "Session created");
                Ok(view::quality_menu(&session))
            }
            Err(err) => {
                cleanup::remove_quietly(&path).await;
                Err(err)
            }
        }
    }

    /// Parses a button token and applies it.
    pub async fn handle_action(&self, user_id: UserId, token: &str) -> Result<View> {
        let action: Action = token.parse()?;
        self.apply(user_id, action).await
    }

    #[instrument(skip(self))]
    pub async fn apply(&self, user_id: UserId, action: Action) -> Result<View> {
        let _guard = self.locks.lock(user_id).await;

        match action {
            Action::SelectQuality(preset) => {
                let session = self.sessions.select_quality(user_id, preset)?;
                Ok(view::for_session(&session))
            }
            Action::OpenSetting(kind) => {
                let session = self.sessions.touch(user_id)?;
                match session.state {
                    SessionState::AwaitingEncodingSettings => Ok(view::setting_picker(&session, kind)),
                    SessionState::AwaitingResolution => Ok(view::resolution_menu(&session)),
                    SessionState::AwaitingQuality => Err(Error::validation("choose a quality first")),
                    SessionState::ReadyToStart => Err(Error::validation("encode is already starting")),
                }
            }
            Action::Set(setting) => {
                let session = self.sessions.update_setting(user_id, setting)?;
                Ok(view::for_session(&session))
            }
            Action::BackToQuality => {
                let session = self.sessions.back_to_quality(user_id)?;
                Ok(view::for_session(&session))
            }
            Action::BackToSettings => {
                let session = self.sessions.touch(user_id)?;
                Ok(view::for_session(&session))
            }
            Action::Start => self.start_locked(user_id).await,
            Action::Cancel => match self.jobs.get(user_id) {
                Some(job) => Ok(view::confirm_cancel(job.id())),
                None => self.cancel_locked(user_id, None).await,
            },
            Action::CancelJob(job_id) => match self.jobs.get(user_id) {
                Some(job) if job.id() == job_id => Ok(view::confirm_cancel(job_id)),
                _ => Err(Error::NotFound(user_id)),
            },
            Action::ConfirmCancel(job_id) => self.cancel_locked(user_id, Some(job_id)).await,
            Action::KeepProcess => match self.jobs.get(user_id) {
                Some(job) => Ok(View {
                    text: format!("Encode {} continues.", job.task.label()),
                    keyboard: vec![vec![Button::new("Cancel", Action::CancelJob(job.id()))]],
                }),
                None => Err(Error::NotFound(user_id)),
            },
        }
    }

    /// Cancels whatever the user has going: the job, awaiting its terminal
    /// status, or else the session.
    pub async fn cancel(&self, user_id: UserId) -> Result<View> {
        let _guard = self.locks.lock(user_id).await;
        self.cancel_locked(user_id, None).await
    }

    pub async fn stats(&self, user_id: UserId) -> Result<View> {
        let totals = self.stats.totals(user_id).await?;
        Ok(View::message(format!(
            "Total compressions: {}\nData processed: {}",
            totals.compressions,
            human_bytes(totals.bytes)
        )))
    }

    /// Reclaims expired sessions and idle per-user locks.
    pub async fn sweep(&self) -> usize {
        let expired = self.sessions.sweep_expired();
        for session in &expired {
            debug!(user_id = session.user_id, "Session expired");
            cleanup::remove_quietly(&session.source.path).await;
        }
        let pruned = self.locks.prune();
        if !expired.is_empty() || pruned > 0 {
            info!(sessions = expired.len(), locks = pruned, "Swept idle state");
        }
        expired.len()
    }

    async fn start_locked(&self, user_id: UserId) -> Result<View> {
        let session = self.sessions.begin_start(user_id)?;

        let started = match self.probe.probe(&session.source.path).await {
            Ok(info) => {
                let duration = info.duration.or(session.source.duration);
                self.jobs.start(&session, duration)
            }
            Err(err) => Err(err),
        };

        match started {
            Ok(handle) => {
                self.sessions.remove(user_id);
                let label = handle.task.label();
                info!(job_id = %handle.id(), %label, duration = ?handle.task.duration, "Encode submitted");
                Ok(view::job_queued(handle.id(), &label, self.jobs.queued()))
            }
            Err(err) => {
                debug!(error = %err, "Start rejected");
                self.sessions.abort_start(user_id);
                Err(err)
            }
        }
    }

    async fn cancel_locked(&self, user_id: UserId, expected: Option<JobId>) -> Result<View> {
        match self.jobs.request_cancel(user_id, expected).await {
            Ok(request) => {
                let outcome = request.handle().wait().await;
                self.discard_session(user_id).await;

                let text = match outcome {
                    JobOutcome::Cancelled => "Encode cancelled.".to_string(),
                    JobOutcome::Completed(_) => "Encode had already finished.".to_string(),
                    JobOutcome::Failed { message, .. } => format!("Encode had already failed: {}", message),
                };
                return Ok(View::message(text));
            }
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        if expected.is_none() && self.discard_session(user_id).await {
            return Ok(View::message("Cancelled."));
        }
        Err(Error::NotFound(user_id))
    }

    async fn discard_session(&self, user_id: UserId) -> bool {
        match self.sessions.remove(user_id) {
            Some(session) => {
                cleanup::remove_quietly(&session.source.path).await;
                true
            }
            None => false,
        }
    }
}
