use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Closed set of artifact kinds a stage may declare as output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    PreflightIntel,
    ResearchPayload,
    DesignDocument,
    MathTables,
    ArtAssetSet,
    AudioAssetSet,
    Package,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::PreflightIntel => "preflight_intel",
            ArtifactKind::ResearchPayload => "research_payload",
            ArtifactKind::DesignDocument => "design_document",
            ArtifactKind::MathTables => "math_tables",
            ArtifactKind::ArtAssetSet => "art_asset_set",
            ArtifactKind::AudioAssetSet => "audio_asset_set",
            ArtifactKind::Package => "package",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file produced by a worker, referenced rather than copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// A stage output. The body of each variant is opaque to the orchestrator;
/// only the kind tag is checked against the stage declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    PreflightIntel {
        #[serde(default)]
        body: Value,
    },
    ResearchPayload {
        subject: String,
        #[serde(default)]
        body: Value,
    },
    DesignDocument {
        #[serde(default)]
        title: String,
        #[serde(default)]
        body: Value,
    },
    MathTables {
        #[serde(default)]
        body: Value,
    },
    ArtAssetSet {
        #[serde(default)]
        assets: Vec<AssetRef>,
    },
    AudioAssetSet {
        #[serde(default)]
        assets: Vec<AssetRef>,
    },
    Package {
        #[serde(default)]
        assets: Vec<AssetRef>,
        #[serde(default)]
        body: Value,
    },
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::PreflightIntel { .. } => ArtifactKind::PreflightIntel,
            Artifact::ResearchPayload { .. } => ArtifactKind::ResearchPayload,
            Artifact::DesignDocument { .. } => ArtifactKind::DesignDocument,
            Artifact::MathTables { .. } => ArtifactKind::MathTables,
            Artifact::ArtAssetSet { .. } => ArtifactKind::ArtAssetSet,
            Artifact::AudioAssetSet { .. } => ArtifactKind::AudioAssetSet,
            Artifact::Package { .. } => ArtifactKind::Package,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_artifact_parses_with_kind_tag() {
        let artifact: Artifact = serde_json::from_value(json!({
            "kind": "research_payload",
            "subject": "texas",
            "body": {"rtp_floor": 0.8}
        }))
        .unwrap();
        assert_eq!(artifact.kind(), ArtifactKind::ResearchPayload);
        match artifact {
            Artifact::ResearchPayload { subject, body } => {
                assert_eq!(subject, "texas");
                assert_eq!(body["rtp_floor"], 0.8);
            }
            _ => panic!("Expected ResearchPayload"),
        }
    }

    #[test]
    fn test_artifact_body_defaults_to_null() {
        let artifact: Artifact = serde_json::from_value(json!({"kind": "math_tables"})).unwrap();
        assert_eq!(artifact, Artifact::MathTables { body: Value::Null });
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result: Result<Artifact, _> = serde_json::from_value(json!({"kind": "mood_board"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_kind_display_matches_serde_tag() {
        let asset_set = Artifact::ArtAssetSet {
            assets: vec![AssetRef {
                path: "symbols/wild.png".into(),
                media_type: Some("image/png".into()),
            }],
        };
        let value = serde_json::to_value(&asset_set).unwrap();
        assert_eq!(value["kind"], asset_set.kind().to_string());
    }
}
