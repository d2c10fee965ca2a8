use crate::domain::config::RigConfig;
use crate::domain::error::{RigError, RigResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration manager: global config under the user's home, with an
/// optional project-local override found by walking up from the current
/// directory.
pub struct ConfigManager {
    global_config_path: PathBuf,
    project_config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> RigResult<Self> {
        let global_config_path = Self::get_global_config_path()?;
        let project_config_path = Self::find_project_config_path();

        Ok(Self {
            global_config_path,
            project_config_path,
        })
    }

    /// Load the effective configuration: project config wins over global.
    pub fn load_config(&self) -> RigResult<RigConfig> {
        if let Some(project_path) = &self.project_config_path {
            if project_path.exists() {
                return self.load_config_from_path(project_path);
            }
        }
        if self.global_config_path.exists() {
            return self.load_config_from_path(&self.global_config_path);
        }
        Err(RigError::Config {
            message: format!(
                "no configuration found; run `magrig config init` or create {}",
                self.global_config_path.display()
            ),
        })
    }

    pub fn load_config_from_path(&self, path: &Path) -> RigResult<RigConfig> {
        let content = fs::read_to_string(path).map_err(|e| RigError::Config {
            message: format!("failed to read config file {}: {}", path.display(), e),
        })?;

        let config: RigConfig = toml::from_str(&content).map_err(|e| RigError::Config {
            message: format!("failed to parse config file {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_config_to_path(&self, path: &Path, config: &RigConfig) -> RigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| RigError::Config {
            message: format!("failed to serialize config: {}", e),
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RigError::Config {
                message: format!("failed to create config directory: {}", e),
            })?;
        }

        fs::write(path, content).map_err(|e| RigError::Config {
            message: format!("failed to write config file {}: {}", path.display(), e),
        })
    }

    /// Write an example configuration to the global path.
    pub fn init_global_config(&self) -> RigResult<PathBuf> {
        if self.global_config_path.exists() {
            return Err(RigError::Config {
                message: format!(
                    "configuration already exists at {}",
                    self.global_config_path.display()
                ),
            });
        }
        self.save_config_to_path(&self.global_config_path, &RigConfig::example())?;
        Ok(self.global_config_path.clone())
    }

    fn get_global_config_path() -> RigResult<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| RigError::Config {
            message: "could not determine home directory".to_string(),
        })?;

        Ok(home.join(".config").join("magrig").join("config.toml"))
    }

    /// Find project configuration by walking up the directory tree.
    fn find_project_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut path = current_dir.as_path();

        loop {
            let config_path = path.join(".magrig").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            path = path.parent()?;
        }
    }
}
