//! The compact format menu served by `/video-info`.

use std::collections::HashSet;

use serde::Serialize;

use crate::source::{RemoteFormat, VideoInfo};

pub const MAX_VIDEO_HEIGHT: u32 = 720;
pub const CANONICAL_AUDIO_TIER: u32 = 128;
const AUDIO_TIERS: [u32; 5] = [48, 64, 128, 160, 256];

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoOption {
    pub itag: String,
    pub quality: String,
    pub container: String,
    pub has_audio: bool,
    /// Default audio stream to merge with when `has_audio` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_itag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioOption {
    pub itag: String,
    pub quality: String,
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatMenu {
    pub title: String,
    pub thumbnail: String,
    pub video_formats: Vec<VideoOption>,
    pub audio_formats: Vec<AudioOption>,
}

/// Numeric prefix of a quality label: `"720p60"` -> 720.
pub fn quality_value(label: &str) -> Option<u32> {
    let digits: String = label.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Nearest standard bitrate tier.
pub fn audio_tier(kbps: f64) -> u32 {
    AUDIO_TIERS
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = (f64::from(*a) - kbps).abs();
            let db = (f64::from(*b) - kbps).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(CANONICAL_AUDIO_TIER)
}

pub fn build_menu(info: &VideoInfo) -> FormatMenu {
    let audio_formats = audio_options(&info.formats);
    let default_audio = audio_formats.first().map(|a| a.itag.clone());
    let video_formats = video_options(&info.formats, default_audio.as_deref());

    FormatMenu {
        title: info.title.clone(),
        thumbnail: info.thumbnail.clone().unwrap_or_default(),
        video_formats,
        audio_formats,
    }
}

fn video_options(formats: &[RemoteFormat], default_audio: Option<&str>) -> Vec<VideoOption> {
    let mut seen = HashSet::new();
    let mut options: Vec<(u32, VideoOption)> = formats
        .iter()
        .filter(|f| f.is_direct() && f.descriptor.has_video)
        .filter_map(|f| {
            let value = quality_value(&f.descriptor.quality_label)?;
            (value <= MAX_VIDEO_HEIGHT).then_some((value, f))
        })
        // first seen wins
        .filter(|(_, f)| seen.insert(f.descriptor.quality_label.clone()))
        .map(|(value, f)| {
            let d = &f.descriptor;
            let option = VideoOption {
                itag: d.identifier.clone(),
                quality: d.quality_label.clone(),
                container: d.container.clone(),
                has_audio: d.has_embedded_audio,
                audio_itag: if d.has_embedded_audio {
                    None
                } else {
                    default_audio.map(str::to_string)
                },
                bitrate: d.bitrate.map(|b| b.round() as u32),
            };
            (value, option)
        })
        .collect();

    options.sort_by(|(va, a), (vb, b)| vb.cmp(va).then(b.bitrate.cmp(&a.bitrate)));
    options.into_iter().map(|(_, option)| option).collect()
}

fn audio_options(formats: &[RemoteFormat]) -> Vec<AudioOption> {
    let candidates: Vec<(u32, &RemoteFormat)> = formats
        .iter()
        .filter(|f| f.is_direct() && f.descriptor.is_audio_only())
        .filter_map(|f| f.descriptor.bitrate.map(|b| (audio_tier(b), f)))
        .collect();

    let tier = if candidates.iter().any(|(t, _)| *t == CANONICAL_AUDIO_TIER) {
        CANONICAL_AUDIO_TIER
    } else {
        match candidates.iter().map(|(t, _)| *t).max() {
            Some(t) => t,
            None => return Vec::new(),
        }
    };

    // m4a muxes cleanly into mp4, so it goes first within the tier.
    let mut in_tier: Vec<&RemoteFormat> = candidates
        .into_iter()
        .filter(|(t, _)| *t == tier)
        .map(|(_, f)| f)
        .collect();
    in_tier.sort_by(|a, b| {
        let a_m4a = a.descriptor.container == "m4a";
        let b_m4a = b.descriptor.container == "m4a";
        b_m4a.cmp(&a_m4a).then(
            b.descriptor
                .bitrate
                .unwrap_or_default()
                .total_cmp(&a.descriptor.bitrate.unwrap_or_default()),
        )
    });

    let mut seen = HashSet::new();
    in_tier
        .into_iter()
        .map(|f| AudioOption {
            itag: f.descriptor.identifier.clone(),
            quality: format!("{tier}kbps"),
            container: f.descriptor.container.clone(),
            bitrate: f.descriptor.bitrate.map(|b| b.round() as u32),
        })
        .filter(|option| seen.insert(option.quality.clone()))
        .collect()
}
