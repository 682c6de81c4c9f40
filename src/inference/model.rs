use serde::{Deserialize, Serialize};

use crate::inference::params::ModelSize;

pub const VOXTRAL_MINI_REPO_ID: &str = "MohamedRashad/Voxtral-Mini-3B-2507-transformers";
pub const VOXTRAL_SMALL_REPO_ID: &str = "MohamedRashad/Voxtral-Small-24B-2507-transformers";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelBase {
    /// The name of the model
    pub name: String,

    /// The license of the model
    pub license: String,

    /// Which selectable size this model answers to
    pub size: ModelSize,

    /// The tasks the model can perform
    pub tasks: Vec<AudioTask>,

    /// The id of the model repository
    pub repo_id: String,

    /// The revision of the model repository
    pub repo_revision: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioTask {
    Transcribe,
    Understand,
}

impl ModelBase {
    pub fn voxtral(size: ModelSize, repo_id: &str, repo_revision: &str) -> Self {
        let name = match size {
            ModelSize::Mini => "Voxtral Mini (3B)",
            ModelSize::Small => "Voxtral Small (24B)",
        };
        Self {
            name: name.into(),
            license: "Apache-2.0".into(),
            size,
            tasks: vec![AudioTask::Transcribe, AudioTask::Understand],
            repo_id: repo_id.into(),
            repo_revision: repo_revision.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voxtral_descriptor() {
        let base = ModelBase::voxtral(ModelSize::Small, VOXTRAL_SMALL_REPO_ID, "main");
        assert_eq!(base.name, "Voxtral Small (24B)");
        assert_eq!(base.repo_id, VOXTRAL_SMALL_REPO_ID);

        let json = serde_json::to_value(&base).unwrap();
        assert_eq!(json["size"], "small");
        assert_eq!(json["tasks"][1], "understand");
    }
}
