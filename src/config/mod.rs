use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration for plugin discovery and registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Environment variable holding extra search roots (OS path separator delimited)
    #[serde(default = "default_commands_path_env")]
    pub commands_path_env: String,

    /// Subfolder of the pipeline configuration that is always searched last
    #[serde(default = "default_commands_dir")]
    pub commands_dir: String,

    /// Per-root folder loaded for every engine
    #[serde(default = "default_shared_dir")]
    pub shared_dir: String,

    /// Source file extensions treated as plugin scripts
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Load shared libraries exporting `_kiln_plugin_create`
    #[serde(default = "default_true")]
    pub native_plugins: bool,

    #[serde(default)]
    pub display_groups: DisplayGroupConfig,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

/// Menu headings used when a command does not declare its own `group`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayGroupConfig {
    /// Heading used when nothing more specific applies
    #[serde(default = "default_app_group")]
    pub app: String,

    /// Heading for plain commands
    #[serde(default)]
    pub command: Option<String>,

    /// Heading for panels
    #[serde(default)]
    pub panel: Option<String>,
}

/// What happens when a second live command claims an existing name
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The later registration replaces the earlier one
    #[default]
    LastWriteWins,
    /// The later registration fails
    Reject,
}

// Default value functions
fn default_commands_path_env() -> String {
    "KILN_COMMANDS_PATH".to_string()
}

fn default_commands_dir() -> String {
    "commands".to_string()
}

fn default_shared_dir() -> String {
    "shared".to_string()
}

fn default_extensions() -> Vec<String> {
    vec!["lua".to_string()]
}

fn default_app_group() -> String {
    "Commands".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            commands_path_env: default_commands_path_env(),
            commands_dir: default_commands_dir(),
            shared_dir: default_shared_dir(),
            extensions: default_extensions(),
            native_plugins: true,
            display_groups: DisplayGroupConfig::default(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl Default for DisplayGroupConfig {
    fn default() -> Self {
        Self {
            app: default_app_group(),
            command: None,
            panel: None,
        }
    }
}

impl Config {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".kiln").join("config.yaml"))
    }

    /// Whether a file name carries one of the configured script extensions
    #[must_use]
    pub fn is_script(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }

    /// Whether a file name looks like a native plugin library for this platform
    #[must_use]
    pub fn is_native_library(&self, path: &Path) -> bool {
        self.native_plugins
            && path.extension().and_then(|ext| ext.to_str())
                == Some(std::env::consts::DLL_EXTENSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.commands_path_env, "KILN_COMMANDS_PATH");
        assert_eq!(config.commands_dir, "commands");
        assert_eq!(config.shared_dir, "shared");
        assert_eq!(config.duplicate_policy, DuplicatePolicy::LastWriteWins);
        assert_eq!(config.display_groups.app, "Commands");
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
commands_path_env: STUDIO_COMMANDS
duplicate_policy: reject
display_groups:
  panel: Panels
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.commands_path_env, "STUDIO_COMMANDS");
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.display_groups.panel.as_deref(), Some("Panels"));
        assert_eq!(config.display_groups.app, "Commands");
        assert_eq!(config.extensions, vec!["lua".to_string()]);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = Config::default();
        config.extensions.push("luau".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_script_extension_filter() {
        let config = Config::default();
        assert!(config.is_script(Path::new("say_hello.lua")));
        assert!(!config.is_script(Path::new("say_hello.py")));
        assert!(!config.is_script(Path::new("README")));
    }
}
