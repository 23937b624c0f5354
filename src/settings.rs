//! Encoding settings, their closed value domains and the quality preset table.

use crate::error::{Error, Result};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Accepted CRF values. libx264 and libx265 both clamp to this range.
pub const CRF_RANGE: RangeInclusive<u8> = 0..=51;

/// CRF values offered in the picker menu.
pub const CRF_CHOICES: [u8; 7] = [15, 18, 20, 23, 25, 28, 30];

pub const DEFAULT_CRF: u8 = 23;

/// Closed string enumerations: wire name, `FromStr`, `Display` and `ALL`.
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

named_enum! {
    pub enum VideoCodec {
        H264 => "libx264",
        Hevc => "libx265",
    }
}

named_enum! {
    pub enum AudioCodec {
        Aac => "aac",
        Mp3 => "libmp3lame",
        Copy => "copy",
    }
}

named_enum! {
    pub enum AudioBitrate {
        K64 => "64k",
        K96 => "96k",
        K128 => "128k",
        K192 => "192k",
        K256 => "256k",
    }
}

named_enum! {
    /// x264/x265 speed versus compression trade-off.
    pub enum EncoderPreset {
        Ultrafast => "ultrafast",
        Superfast => "superfast",
        Veryfast => "veryfast",
        Faster => "faster",
        Fast => "fast",
        Medium => "medium",
        Slow => "slow",
        Slower => "slower",
        Veryslow => "veryslow",
    }
}

named_enum! {
    pub enum PixelFormat {
        Yuv420p => "yuv420p",
        Yuv444p => "yuv444p",
        Yuv420p10le => "yuv420p10le",
    }
}

named_enum! {
    /// Named bundles of {resolution, CRF, encoder preset, codec}.
    pub enum QualityPreset {
        P1080 => "1080p",
        P1080Hevc => "1080p_hevc",
        P720 => "720p",
        P720Hevc => "720p_hevc",
        P480 => "480p",
        P480Hevc => "480p_hevc",
        P360 => "360p",
        Custom => "custom",
    }
}

named_enum! {
    /// Individually editable fields of a session.
    pub enum SettingKind {
        Crf => "crf",
        AudioBitrate => "audio_bitrate",
        Resolution => "resolution",
        Preset => "preset",
        VideoCodec => "video_codec",
        AudioCodec => "audio_codec",
        PixelFormat => "pixel_format",
    }
}

/// Output frame size. `None` wherever a resolution is optional means "keep source".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const UHD: Resolution = Resolution::new(3840, 2160);
    pub const QHD: Resolution = Resolution::new(2560, 1440);
    pub const FHD: Resolution = Resolution::new(1920, 1080);
    pub const HD: Resolution = Resolution::new(1280, 720);
    pub const SD: Resolution = Resolution::new(854, 480);
    pub const LOW: Resolution = Resolution::new(640, 360);

    /// Sizes a caller may pick.
    pub const ALL: &'static [Resolution] = &[
        Resolution::UHD,
        Resolution::QHD,
        Resolution::FHD,
        Resolution::HD,
        Resolution::SD,
        Resolution::LOW,
    ];

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Value of an ffmpeg `scale` filter.
    pub fn scale_filter(&self) -> String {
        format!("scale={}:{}", self.width, self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = s
            .split_once('x')
            .and_then(|(w, h)| Some(Resolution::new(w.parse().ok()?, h.parse().ok()?)));
        match parsed {
            Some(res) if Resolution::ALL.contains(&res) => Ok(res),
            _ => Err(Error::validation(format!("unsupported resolution '{}'", s))),
        }
    }
}

/// Token used on the wire for "keep the source resolution".
pub const ORIGINAL_RESOLUTION: &str = "original";

/// The settings a preset writes in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetDefaults {
    pub resolution: Option<Resolution>,
    pub crf: u8,
    pub preset: EncoderPreset,
    pub codec: VideoCodec,
}

impl QualityPreset {
    pub fn defaults(&self) -> PresetDefaults {
        use EncoderPreset::*;
        use VideoCodec::*;

        let (resolution, crf, preset, codec) = match self {
            QualityPreset::P1080 => (Some(Resolution::FHD), 18, Slow, H264),
            QualityPreset::P1080Hevc => (Some(Resolution::FHD), 20, Medium, Hevc),
            QualityPreset::P720 => (Some(Resolution::HD), 20, Medium, H264),
            QualityPreset::P720Hevc => (Some(Resolution::HD), 22, Medium, Hevc),
            QualityPreset::P480 => (Some(Resolution::SD), 23, Fast, H264),
            QualityPreset::P480Hevc => (Some(Resolution::SD), 25, Fast, Hevc),
            QualityPreset::P360 => (Some(Resolution::LOW), 25, Fast, H264),
            QualityPreset::Custom => (None, DEFAULT_CRF, Medium, H264),
        };

        PresetDefaults {
            resolution,
            crf,
            preset,
            codec,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, QualityPreset::Custom)
    }

    /// Human label, e.g. `720P HEVC`.
    pub fn label(&self) -> String {
        self.as_str().replace('_', " ").to_uppercase()
    }
}

/// A single validated edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    Crf(u8),
    AudioBitrate(AudioBitrate),
    Resolution(Option<Resolution>),
    Preset(EncoderPreset),
    VideoCodec(VideoCodec),
    AudioCodec(AudioCodec),
    PixelFormat(PixelFormat),
}

impl Setting {
    /// Validates `value` against the bounded domain of `kind`.
    pub fn parse(kind: SettingKind, value: &str) -> Result<Setting> {
        Ok(match kind {
            SettingKind::Crf => {
                let crf: u8 = value
                    .parse()
                    .map_err(|_| Error::validation(format!("CRF '{}' is not a number", value)))?;
                if !CRF_RANGE.contains(&crf) {
                    return Err(Error::validation(format!(
                        "CRF {} outside {}..={}",
                        crf,
                        CRF_RANGE.start(),
                        CRF_RANGE.end()
                    )));
                }
                Setting::Crf(crf)
            }
            SettingKind::AudioBitrate => Setting::AudioBitrate(value.parse()?),
            SettingKind::Resolution if value == ORIGINAL_RESOLUTION => Setting::Resolution(None),
            SettingKind::Resolution => Setting::Resolution(Some(value.parse()?)),
            SettingKind::Preset => Setting::Preset(value.parse()?),
            SettingKind::VideoCodec => Setting::VideoCodec(value.parse()?),
            SettingKind::AudioCodec => Setting::AudioCodec(value.parse()?),
            SettingKind::PixelFormat => Setting::PixelFormat(value.parse()?),
        })
    }

    pub fn kind(&self) -> SettingKind {
        match self {
            Setting::Crf(_) => SettingKind::Crf,
            Setting::AudioBitrate(_) => SettingKind::AudioBitrate,
            Setting::Resolution(_) => SettingKind::Resolution,
            Setting::Preset(_) => SettingKind::Preset,
            Setting::VideoCodec(_) => SettingKind::VideoCodec,
            Setting::AudioCodec(_) => SettingKind::AudioCodec,
            Setting::PixelFormat(_) => SettingKind::PixelFormat,
        }
    }

    /// Wire form of the value, the inverse of [`Setting::parse`].
    pub fn value(&self) -> String {
        match self {
            Setting::Crf(crf) => crf.to_string(),
            Setting::AudioBitrate(b) => b.to_string(),
            Setting::Resolution(None) => ORIGINAL_RESOLUTION.to_string(),
            Setting::Resolution(Some(r)) => r.to_string(),
            Setting::Preset(p) => p.to_string(),
            Setting::VideoCodec(c) => c.to_string(),
            Setting::AudioCodec(c) => c.to_string(),
            Setting::PixelFormat(p) => p.to_string(),
        }
    }
}

/// Every field that ends up in the encode invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodeSettings {
    pub resolution: Option<Resolution>,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub preset: EncoderPreset,
    pub crf: u8,
    pub audio_bitrate: AudioBitrate,
    pub pixel_format: PixelFormat,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            resolution: None,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
            preset: EncoderPreset::Medium,
            crf: DEFAULT_CRF,
            audio_bitrate: AudioBitrate::K128,
            pixel_format: PixelFormat::Yuv420p,
        }
    }
}

impl EncodeSettings {
    /// Writes all preset-controlled fields together.
    pub fn apply_preset(&mut self, preset: QualityPreset) {
        let defaults = preset.defaults();
        self.resolution = defaults.resolution;
        self.crf = defaults.crf;
        self.preset = defaults.preset;
        self.video_codec = defaults.codec;
    }

    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::Crf(crf) => self.crf = crf,
            Setting::AudioBitrate(b) => self.audio_bitrate = b,
            Setting::Resolution(r) => self.resolution = r,
            Setting::Preset(p) => self.preset = p,
            Setting::VideoCodec(c) => self.video_codec = c,
            Setting::AudioCodec(c) => self.audio_codec = c,
            Setting::PixelFormat(p) => self.pixel_format = p,
        }
    }

    /// Current value of one field, as a [`Setting`].
    pub fn get(&self, kind: SettingKind) -> Setting {
        match kind {
            SettingKind::Crf => Setting::Crf(self.crf),
            SettingKind::AudioBitrate => Setting::AudioBitrate(self.audio_bitrate),
            SettingKind::Resolution => Setting::Resolution(self.resolution),
            SettingKind::Preset => Setting::Preset(self.preset),
            SettingKind::VideoCodec => Setting::VideoCodec(self.video_codec),
            SettingKind::AudioCodec => Setting::AudioCodec(self.audio_codec),
            SettingKind::PixelFormat => Setting::PixelFormat(self.pixel_format),
        }
    }
}

/// Values offered for `kind` in the picker menu.
pub fn choices(kind: SettingKind) -> Vec<Setting> {
    match kind {
        SettingKind::Crf => CRF_CHOICES.iter().map(|c| Setting::Crf(*c)).collect(),
        SettingKind::AudioBitrate => AudioBitrate::ALL
            .iter()
            .map(|b| Setting::AudioBitrate(*b))
            .collect(),
        SettingKind::Resolution => Resolution::ALL
            .iter()
            .map(|r| Setting::Resolution(Some(*r)))
            .chain(std::iter::once(Setting::Resolution(None)))
            .collect(),
        SettingKind::Preset => EncoderPreset::ALL.iter().map(|p| Setting::Preset(*p)).collect(),
        SettingKind::VideoCodec => VideoCodec::ALL
            .iter()
            .map(|c| Setting::VideoCodec(*c))
            .collect(),
        SettingKind::AudioCodec => AudioCodec::ALL
            .iter()
            .map(|c| Setting::AudioCodec(*c))
            .collect(),
        SettingKind::PixelFormat => PixelFormat::ALL
            .iter()
            .map(|p| Setting::PixelFormat(*p))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_table() {
        let hd = QualityPreset::P720.defaults();
        assert_eq!(hd.resolution, Some(Resolution::HD));
        assert_eq!(hd.crf, 20);
        assert_eq!(hd.preset, EncoderPreset::Medium);
        assert_eq!(hd.codec, VideoCodec::H264);

        let hd_hevc = QualityPreset::P720Hevc.defaults();
        assert_eq!(hd_hevc.crf, 22);
        assert_eq!(hd_hevc.codec, VideoCodec::Hevc);
        assert_eq!(hd_hevc.resolution, hd.resolution);
        assert_eq!(hd_hevc.preset, hd.preset);
    }

    #[test]
    fn test_hevc_suffix_switches_codec() {
        for preset in QualityPreset::ALL {
            let hevc = preset.as_str().ends_with("_hevc");
            assert_eq!(preset.defaults().codec == VideoCodec::Hevc, hevc, "{}", preset);
        }
    }

    #[test]
    fn test_unknown_preset_rejected() {
        assert!(matches!(
            "720p_av1".parse::<QualityPreset>(),
            Err(Error::Validation(_))
        ));
        assert!("".parse::<QualityPreset>().is_err());
    }

    #[test]
    fn test_crf_bounds() {
        assert_eq!(Setting::parse(SettingKind::Crf, "0").unwrap(), Setting::Crf(0));
        assert_eq!(Setting::parse(SettingKind::Crf, "51").unwrap(), Setting::Crf(51));
        assert!(Setting::parse(SettingKind::Crf, "52").is_err());
        assert!(Setting::parse(SettingKind::Crf, "-1").is_err());
        assert!(Setting::parse(SettingKind::Crf, "abc").is_err());
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!(
            Setting::parse(SettingKind::Resolution, "original").unwrap(),
            Setting::Resolution(None)
        );
        assert_eq!(
            Setting::parse(SettingKind::Resolution, "1280x720").unwrap(),
            Setting::Resolution(Some(Resolution::HD))
        );
        assert!(Setting::parse(SettingKind::Resolution, "1000x1000").is_err());
        assert!(Setting::parse(SettingKind::Resolution, "1280").is_err());
    }

    #[test]
    fn test_closed_enumerations() {
        assert!(Setting::parse(SettingKind::AudioBitrate, "320k").is_err());
        assert!(Setting::parse(SettingKind::VideoCodec, "libvpx").is_err());
        assert!(Setting::parse(SettingKind::AudioCodec, "opus").is_err());
        assert!(Setting::parse(SettingKind::Preset, "placebo").is_err());
        assert!(Setting::parse(SettingKind::PixelFormat, "rgb24").is_err());
    }

    #[test]
    fn test_every_choice_parses_back() {
        for kind in SettingKind::ALL {
            for setting in choices(*kind) {
                assert_eq!(Setting::parse(*kind, &setting.value()).unwrap(), setting);
                assert_eq!(setting.kind(), *kind);
            }
        }
    }

    #[test]
    fn test_apply_touches_one_field() {
        let mut settings = EncodeSettings::default();
        settings.apply(Setting::AudioCodec(AudioCodec::Copy));
        assert_eq!(
            settings,
            EncodeSettings {
                audio_codec: AudioCodec::Copy,
                ..EncodeSettings::default()
            }
        );
    }
}
