//! Button actions and their wire tokens.
//!
//! Every button the transport renders carries one of these tokens; inbound
//! tokens are parsed back into an [`Action`] before anything touches a session.

use crate::error::{Error, Result};
use crate::settings::{QualityPreset, Setting, SettingKind};
use crate::JobId;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SelectQuality(QualityPreset),
    OpenSetting(SettingKind),
    Set(Setting),
    BackToQuality,
    BackToSettings,
    Start,
    /// Abandon the session, or ask for confirmation when a job is running.
    Cancel,
    /// Cancel button on a progress view, bound to the job it was rendered for.
    CancelJob(JobId),
    ConfirmCancel(JobId),
    KeepProcess,
}

const QUALITY: &str = "quality_";
const SETTING: &str = "setting_";
const SET: &str = "set_";
const CANCEL_JOB: &str = "cancel_job_";
const CONFIRM_CANCEL: &str = "confirm_cancel_";

impl Action {
    pub fn token(&self) -> String {
        match self {
            Action::SelectQuality(q) => format!("{}{}", QUALITY, q),
            Action::OpenSetting(kind) => format!("{}{}", SETTING, kind),
            Action::Set(setting) => format!("{}{}_{}", SET, setting.kind(), setting.value()),
            Action::BackToQuality => "back_to_quality".to_string(),
            Action::BackToSettings => "back_to_encoding".to_string(),
            Action::Start => "start_encoding".to_string(),
            Action::Cancel => "cancel_compression".to_string(),
            Action::CancelJob(id) => format!("{}{}", CANCEL_JOB, id.simple()),
            Action::ConfirmCancel(id) => format!("{}{}", CONFIRM_CANCEL, id.simple()),
            Action::KeepProcess => "keep_process".to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        let unknown = || Error::validation(format!("unknown action '{}'", token));

        match token {
            "back_to_quality" => return Ok(Action::BackToQuality),
            "back_to_encoding" => return Ok(Action::BackToSettings),
            "start_encoding" => return Ok(Action::Start),
            "cancel_compression" => return Ok(Action::Cancel),
            "keep_process" => return Ok(Action::KeepProcess),
            _ => {}
        }

        if let Some(quality) = token.strip_prefix(QUALITY) {
            return Ok(Action::SelectQuality(quality.parse()?));
        }
        if let Some(kind) = token.strip_prefix(SETTING) {
            return Ok(Action::OpenSetting(kind.parse()?));
        }
        if let Some(id) = token.strip_prefix(CANCEL_JOB) {
            return Ok(Action::CancelJob(id.parse().map_err(|_| unknown())?));
        }
        if let Some(id) = token.strip_prefix(CONFIRM_CANCEL) {
            return Ok(Action::ConfirmCancel(id.parse().map_err(|_| unknown())?));
        }
        if let Some(rest) = token.strip_prefix(SET) {
            // No kind name is a prefix of another, so at most one matches.
            for kind in SettingKind::ALL {
                if let Some(value) = rest
                    .strip_prefix(kind.as_str())
                    .and_then(|r| r.strip_prefix('_'))
                {
                    return Ok(Action::Set(Setting::parse(*kind, value)?));
                }
            }
        }

        Err(unknown())
    }
}
