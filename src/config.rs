use anyhow::Result;
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

use crate::inference::model::{ModelBase, VOXTRAL_MINI_REPO_ID, VOXTRAL_SMALL_REPO_ID};
use crate::inference::params::ModelSize;

#[derive(ClapSerde, Deserialize, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub address: String,

    /// The port the listener binds to
    #[default(25566)]
    #[arg(short, long, env)]
    pub port: u16,

    /// Directory that holds downloaded models and staged uploads
    #[default("model_cache".to_string())]
    #[arg(long, env)]
    pub cache_dir: String,

    /// Repository of the compact (mini) model
    #[default(VOXTRAL_MINI_REPO_ID.to_string())]
    #[arg(long, env)]
    pub mini_repo_id: String,

    /// Repository of the large (small) model
    #[default(VOXTRAL_SMALL_REPO_ID.to_string())]
    #[arg(long, env)]
    pub small_repo_id: String,

    /// Revision used for both model repositories
    #[default("main".to_string())]
    #[arg(long, env)]
    pub repo_revision: String,

    /// Little endian f32 file holding the 128 bin mel filter bank
    #[default("melfilters128.bytes".to_string())]
    #[arg(long, env)]
    pub mel_filters_path: String,

    /// Largest accepted request body in bytes
    #[default(100_000_000)]
    #[arg(long, env)]
    pub max_body_size: usize,

    /// Run on the CPU even when an accelerator is available
    #[default(false)]
    #[arg(long, env, num_args = 0..=1, default_missing_value = "true")]
    pub cpu: bool,
}

impl Config {
    /// Reads a possibly partial TOML file, unset options keep their defaults.
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    pub fn model_base(&self, size: ModelSize) -> ModelBase {
        let repo_id = match size {
            ModelSize::Mini => &self.mini_repo_id,
            ModelSize::Small => &self.small_repo_id,
        };
        ModelBase::voxtral(size, repo_id, &self.repo_revision)
    }
}
