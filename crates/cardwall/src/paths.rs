use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "CARDWALL_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "CARDWALL_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "Cardwall";
const APPLICATION: &str = "Cardwall";

const CONFIG_FILE: &str = "cardwall.toml";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let config_override = env_override(ENV_CONFIG_DIR);
        let data_override = env_override(ENV_DATA_DIR);
        if let (Some(config_dir), Some(data_dir)) = (&config_override, &data_override) {
            return Ok(Self {
                config_dir: config_dir.clone(),
                data_dir: data_dir.clone(),
            });
        }

        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;

        Ok(Self {
            config_dir: config_override
                .unwrap_or_else(|| project_dirs.config_dir().to_path_buf()),
            data_dir: data_override.unwrap_or_else(|| project_dirs.data_dir().to_path_buf()),
        })
    }

    #[cfg(test)]
    pub fn from_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            config_dir,
            data_dir,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir).with_context(|| {
            format!(
                "failed to create config directory {}",
                self.config_dir.display()
            )
        })
    }
}

fn env_override(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
