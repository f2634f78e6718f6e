use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
    #[error("Invalid run id '{0}'")]
    RunId(String),

    #[error("Unknown stage '{0}'. Valid values: preflight, research, design_math, art_audio, assembly, recon")]
    Stage(String),
}

/// Unique identifier of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used in terminal output.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(RunId)
            .map_err(|_| ParseIdError::RunId(s.to_string()))
    }
}

/// Stages known to the orchestrator. `Recon` is the single stage of a
/// jurisdiction recon run, the rest make up the game pipeline in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    #[serde(rename = "preflight")]
    PreFlight,
    Research,
    DesignMath,
    ArtAudio,
    Assembly,
    Recon,
}

impl StageId {
    pub const GAME: [StageId; 5] = [
        StageId::PreFlight,
        StageId::Research,
        StageId::DesignMath,
        StageId::ArtAudio,
        StageId::Assembly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::PreFlight => "preflight",
            StageId::Research => "research",
            StageId::DesignMath => "design_math",
            StageId::ArtAudio => "art_audio",
            StageId::Assembly => "assembly",
            StageId::Recon => "recon",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "preflight" | "pre_flight" => Ok(StageId::PreFlight),
            "research" => Ok(StageId::Research),
            "design_math" | "design" => Ok(StageId::DesignMath),
            "art_audio" | "art" => Ok(StageId::ArtAudio),
            "assembly" => Ok(StageId::Assembly),
            "recon" => Ok(StageId::Recon),
            _ => Err(ParseIdError::Stage(s.to_string())),
        }
    }
}

/// Normalize a jurisdiction name into its cache key.
///
/// Trims, lowercases, collapses whitespace runs into a single `-`, and drops
/// anything that is not a letter, digit or `-`. `"  New  Jersey "` and
/// `"new jersey"` both become `new-jersey`; non-Latin names keep their letters.
pub fn normalize_jurisdiction(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
