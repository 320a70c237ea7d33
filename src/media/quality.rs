use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named capture targets offered to broadcasters and requested by viewers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
    Auto,
}

impl QualityPreset {
    pub const fn all() -> [QualityPreset; 4] {
        [
            QualityPreset::Low,
            QualityPreset::Medium,
            QualityPreset::High,
            QualityPreset::Auto,
        ]
    }

    pub const fn width(self) -> u32 {
        match self {
            QualityPreset::Low => 640,
            QualityPreset::Medium | QualityPreset::Auto => 1280,
            QualityPreset::High => 1920,
        }
    }

    pub const fn height(self) -> u32 {
        match self {
            QualityPreset::Low => 480,
            QualityPreset::Medium | QualityPreset::Auto => 720,
            QualityPreset::High => 1080,
        }
    }

    pub const fn frame_rate(self) -> u32 {
        match self {
            QualityPreset::Low => 15,
            QualityPreset::Medium | QualityPreset::Auto => 24,
            QualityPreset::High => 30,
        }
    }

    /// Human-readable picker label.
    pub const fn label(self) -> &'static str {
        match self {
            QualityPreset::Low => "Low Quality (480p)",
            QualityPreset::Medium => "Medium Quality (720p)",
            QualityPreset::High => "High Quality (1080p)",
            QualityPreset::Auto => "Auto Quality",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
            QualityPreset::Auto => "auto",
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualityPreset::all()
            .into_iter()
            .find(|q| q.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown quality preset: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_carry_capture_targets() {
        assert_eq!(
            (QualityPreset::Low.width(), QualityPreset::Low.height(), QualityPreset::Low.frame_rate()),
            (640, 480, 15)
        );
        assert_eq!(QualityPreset::High.height(), 1080);
        assert_eq!(QualityPreset::Auto.frame_rate(), QualityPreset::Medium.frame_rate());
        assert_eq!(QualityPreset::Medium.label(), "Medium Quality (720p)");
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("HIGH".parse::<QualityPreset>().unwrap(), QualityPreset::High);
        assert!("ultra".parse::<QualityPreset>().is_err());
        assert_eq!(serde_json::to_string(&QualityPreset::Auto).unwrap(), "\"auto\"");
    }
}
