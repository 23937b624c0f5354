//! Menus shown to the caller. Every button carries an [`Action`] token.

use crate::action::Action;
use crate::reporter::human_bytes;
use crate::session::{Session, SessionState};
use crate::settings::{choices, QualityPreset, Setting, SettingKind};
use crate::JobId;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: Action,
}

impl Button {
    pub fn new(label: impl Into<String>, action: Action) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct View {
    pub text: String,
    /// Rows of buttons.
    pub keyboard: Vec<Vec<Button>>,
}

impl View {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: Vec::new(),
        }
    }

    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.keyboard.iter().flatten()
    }
}

fn rows(buttons: Vec<Button>, per_row: usize) -> Vec<Vec<Button>> {
    buttons.chunks(per_row).map(<[Button]>::to_vec).collect()
}

/// The menu matching the session's current state.
pub fn for_session(session: &Session) -> View {
    match session.state {
        SessionState::AwaitingQuality => quality_menu(session),
        SessionState::AwaitingResolution => resolution_menu(session),
        SessionState::AwaitingEncodingSettings | SessionState::ReadyToStart => settings_menu(session),
    }
}

pub fn quality_menu(session: &Session) -> View {
    let text = format!(
        "File: {}\nSize: {}\n\nSelect compression quality:",
        session.source.file_name,
        human_bytes(session.source.size)
    );
    let presets = QualityPreset::ALL
        .iter()
        .map(|q| Button::new(q.label(), Action::SelectQuality(*q)))
        .collect();

    let mut keyboard = rows(presets, 2);
    keyboard.push(vec![Button::new("Cancel", Action::Cancel)]);
    View { text, keyboard }
}

pub fn resolution_menu(_session: &Session) -> View {
    let buttons = choices(SettingKind::Resolution)
        .into_iter()
        .map(|s| Button::new(setting_label(&s), Action::Set(s)))
        .collect();

    let mut keyboard = rows(buttons, 2);
    keyboard.push(vec![
        Button::new("Back", Action::BackToQuality),
        Button::new("Cancel", Action::Cancel),
    ]);
    View {
        text: "Custom quality: select the output resolution.".to_string(),
        keyboard,
    }
}

pub fn settings_menu(session: &Session) -> View {
    let settings = &session.settings;
    let mut text = String::new();
    let quality = session.quality.map(|q| q.label()).unwrap_or_default();
    let _ = writeln!(text, "Quality: {}", quality);
    for kind in SettingKind::ALL {
        let _ = writeln!(text, "{}: {}", kind_label(*kind), setting_label(&settings.get(*kind)));
    }
    text.push_str("\nAdjust a setting or start the encode.");

    let buttons = SettingKind::ALL
        .iter()
        .map(|kind| Button::new(kind_label(*kind), Action::OpenSetting(*kind)))
        .collect();

    let mut keyboard = rows(buttons, 2);
    keyboard.push(vec![Button::new("Start", Action::Start)]);
    keyboard.push(vec![
        Button::new("Back", Action::BackToQuality),
        Button::new("Cancel", Action::Cancel),
    ]);
    View { text, keyboard }
}

/// Picker for one field, with the current value ticked.
pub fn setting_picker(session: &Session, kind: SettingKind) -> View {
    let current = session.settings.get(kind);
    let buttons = choices(kind)
        .into_iter()
        .map(|s| {
            let label = if s == current {
                format!("✓ {}", setting_label(&s))
            } else {
                setting_label(&s)
            };
            Button::new(label, Action::Set(s))
        })
        .collect();

    let mut keyboard = rows(buttons, 3);
    keyboard.push(vec![Button::new("Back", Action::BackToSettings)]);
    View {
        text: format!("Select {}:", kind_label(kind)),
        keyboard,
    }
}

pub fn confirm_cancel(job_id: JobId) -> View {
    View {
        text: "Cancel the running encode? Progress will be lost.".to_string(),
        keyboard: vec![vec![
            Button::new("Yes, cancel", Action::ConfirmCancel(job_id)),
            Button::new("No, keep going", Action::KeepProcess),
        ]],
    }
}

pub fn job_queued(job_id: JobId, label: &str, position: usize) -> View {
    let text = if position > 1 {
        format!("Encode {} queued ({} waiting).", label, position)
    } else {
        format!("Encode {} starting.", label)
    };
    View {
        text,
        keyboard: vec![vec![Button::new("Cancel", Action::CancelJob(job_id))]],
    }
}

pub fn kind_label(kind: SettingKind) -> &'static str {
    match kind {
        SettingKind::Crf => "CRF",
        SettingKind::AudioBitrate => "Audio bitrate",
        SettingKind::Resolution => "Resolution",
        SettingKind::Preset => "Preset",
        SettingKind::VideoCodec => "Video codec",
        SettingKind::AudioCodec => "Audio codec",
        SettingKind::PixelFormat => "Pixel format",
    }
}

fn setting_label(setting: &Setting) -> String {
    match setting {
        Setting::Resolution(None) => "Original".to_string(),
        other => other.value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MediaSource, SessionLimits, SessionStore};
    use uuid::Uuid;

    fn session() -> (SessionStore, Session) {
        let store = SessionStore::new(SessionLimits::default());
        let (session, _) = store
            .create(3, MediaSource::new("/tmp/clip.mp4", 2048, None))
            .unwrap();
        (store, session)
    }

    #[test]
    fn test_quality_menu_offers_every_preset() {
        let (_, session) = session();
        let view = for_session(&session);
        assert!(view.text.contains("clip.mp4"));
        assert!(view.text.contains("2.00 KB"));
        for preset in QualityPreset::ALL {
            assert!(view.buttons().any(|b| b.action == Action::SelectQuality(*preset)));
        }
        assert!(view.buttons().any(|b| b.action == Action::Cancel));
    }

    #[test]
    fn test_menu_follows_state() {
        let (store, _) = session();
        let custom = store.select_quality(3, QualityPreset::Custom).unwrap();
        let view = for_session(&custom);
        assert!(view
            .buttons()
            .any(|b| b.action == Action::Set(Setting::Resolution(None))));

        let named = store.select_quality(3, QualityPreset::P480).unwrap();
        let view = for_session(&named);
        assert!(view.text.contains("CRF: 23"));
        assert!(view.text.contains("Resolution: 854x480"));
        assert!(view.buttons().any(|b| b.action == Action::Start));
    }

    #[test]
    fn test_picker_ticks_current_value() {
        let (store, _) = session();
        let session = store.select_quality(3, QualityPreset::P720).unwrap();
        let view = setting_picker(&session, SettingKind::Crf);
        let ticked: Vec<_> = view.buttons().filter(|b| b.label.starts_with('✓')).collect();
        assert_eq!(ticked.len(), 1);
        assert_eq!(ticked[0].action, Action::Set(Setting::Crf(20)));
    }

    #[test]
    fn test_cancel_buttons_are_bound_to_job() {
        let job = Uuid::new_v4();
        let view = confirm_cancel(job);
        assert!(view.buttons().any(|b| b.action == Action::ConfirmCancel(job)));
        let view = job_queued(job, "720p_CRF20", 1);
        assert!(view.buttons().any(|b| b.action == Action::CancelJob(job)));
    }
}
