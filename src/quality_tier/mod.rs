//! QualityTier - Tier policy table
//!
//! Maps a named tier to the resolution, frame rate and bitrate the
//! transcoder is configured with. Pure lookup, no state.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named quality profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Thumbnail,
    Preview,
    Standard,
    Hd,
}

/// Encoding parameters for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Video bitrate in kbit/s
    pub bitrate_kbps: u32,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Thumbnail, Tier::Preview, Tier::Standard, Tier::Hd];

    pub fn spec(&self) -> TierSpec {
        match self {
            Tier::Thumbnail => TierSpec {
                width: 320,
                height: 180,
                fps: 5,
                bitrate_kbps: 200,
            },
            Tier::Preview => TierSpec {
                width: 640,
                height: 360,
                fps: 15,
                bitrate_kbps: 600,
            },
            Tier::Standard => TierSpec {
                width: 1280,
                height: 720,
                fps: 25,
                bitrate_kbps: 1500,
            },
            Tier::Hd => TierSpec {
                width: 1920,
                height: 1080,
                fps: 30,
                bitrate_kbps: 3000,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Thumbnail => "thumbnail",
            Tier::Preview => "preview",
            Tier::Standard => "standard",
            Tier::Hd => "hd",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thumbnail" => Ok(Tier::Thumbnail),
            "preview" => Ok(Tier::Preview),
            "standard" => Ok(Tier::Standard),
            "hd" => Ok(Tier::Hd),
            _ => Err(Error::UnknownTier(s.to_string())),
        }
    }
}

/// Look up a tier by name
pub fn tier_spec(name: &str) -> Result<TierSpec> {
    name.parse::<Tier>().map(|t| t.spec())
}
