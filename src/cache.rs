use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use tracing::info;

/// Variables pointed at the model cache so every download lands in one directory.
pub const CACHE_ENV_VARS: [&str; 5] = [
    "HF_HOME",
    "TORCH_HOME",
    "HF_DATASETS_CACHE",
    "TRANSFORMERS_CACHE",
    "HUGGINGFACE_HUB_CACHE",
];

const UPLOAD_DIR: &str = "uploads";

/// Creates the cache directory and exports it through [`CACHE_ENV_VARS`].
///
/// Must run once at process start, before any worker threads read the environment.
pub fn init_cache_env(cache_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("Failed to create cache directory {}", cache_dir.display()))?;
    for var in CACHE_ENV_VARS {
        std::env::set_var(var, cache_dir);
    }
    info!("Model cache: {}", cache_dir.display());
    Ok(())
}

pub fn hub_api(cache_dir: &Path) -> Result<Api> {
    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_progress(false)
        .build()?;
    Ok(api)
}

/// Directory where uploaded audio is staged for the duration of a request.
pub fn upload_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join(UPLOAD_DIR)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn exports_cache_dir() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("model_cache");

        init_cache_env(&cache_dir).unwrap();

        assert!(cache_dir.is_dir());
        for var in CACHE_ENV_VARS {
            assert_eq!(std::env::var_os(var).unwrap(), cache_dir.as_os_str());
        }
        assert_eq!(upload_dir(&cache_dir), cache_dir.join("uploads"));
    }
}
