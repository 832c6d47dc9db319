use crate::probe::DEFAULT_PORT;
use crate::repo::{FIXED_PROXY_PREFIX, ProxyRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_REPO_DIR: &str = "ComfyUI";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeMode {
    #[default]
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    None,
    Fixed,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchSection {
    pub compute_mode: ComputeMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_flag: Option<String>,
    pub fast: bool,
    pub listen_all: bool,
    pub port: u16,
    pub cors: bool,
    pub disable_custom_nodes: bool,
    pub disable_api_nodes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attention_flag: Option<String>,
    pub auto_launch_browser: bool,
    pub extra_args: String,
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self {
            compute_mode: ComputeMode::Gpu,
            vram_flag: None,
            fast: false,
            listen_all: false,
            port: DEFAULT_PORT,
            cors: true,
            disable_custom_nodes: false,
            disable_api_nodes: false,
            attention_flag: None,
            auto_launch_browser: false,
            extra_args: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pip_index: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    pub mode: ProxyMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Flags written back in response to events, never by workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateSection {
    pub safe_directory_marked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager_git_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    pub paths: PathsSection,
    pub launch: LaunchSection,
    pub mirrors: MirrorsSection,
    pub proxy: ProxySection,
    pub state: StateSection,
}

impl LauncherConfig {
    /// Configured repository root, or `./ComfyUI` under the working directory.
    pub fn repo_root(&self) -> PathBuf {
        match &self.paths.repo_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(DEFAULT_REPO_DIR),
        }
    }

    pub fn proxy_rule(&self) -> ProxyRule {
        match self.proxy.mode {
            ProxyMode::None => ProxyRule::None,
            ProxyMode::Fixed => ProxyRule::Fixed(FIXED_PROXY_PREFIX.to_string()),
            ProxyMode::Custom => match self.proxy.url.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => ProxyRule::Custom(url.to_string()),
                _ => ProxyRule::None,
            },
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("unknown config key `{0}`")]
    UnknownKey(String),
    #[error("invalid value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },
    #[error("{0}")]
    IoError(String),
}

/// Missing file means defaults.
pub fn load_config(path: &Path) -> Result<LauncherConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LauncherConfig::default()),
        Err(e) => Err(ConfigError::IoError(format!("{}: {}", path.display(), e))),
    }
}

pub fn parse_config(content: &str) -> Result<LauncherConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))
}

pub fn save_config(path: &Path, config: &LauncherConfig) -> Result<(), ConfigError> {
    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::TomlParse(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", parent.display(), e)))?;
    }
    std::fs::write(path, content)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))
}

/// Parse a CLI-supplied value as a TOML literal, treating anything that is
/// not one as a plain string.
fn parse_literal(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Set a dotted `section.key` to `raw`, validating the result against the schema.
pub fn set_value(config: &LauncherConfig, key: &str, raw: &str) -> Result<LauncherConfig, ConfigError> {
    let Some((section, field)) = key.split_once('.') else {
        return Err(ConfigError::UnknownKey(key.to_string()));
    };

    let toml::Value::Table(mut table) =
        toml::Value::try_from(config).map_err(|e| ConfigError::TomlParse(e.to_string()))?
    else {
        return Err(ConfigError::TomlParse("config is not a table".to_string()));
    };
    let Some(toml::Value::Table(section_table)) = table.get_mut(section) else {
        return Err(ConfigError::UnknownKey(key.to_string()));
    };

    let mut value = parse_literal(raw);
    // Strings stay strings for fields that already hold one.
    if let Some(toml::Value::String(_)) = section_table.get(field)
        && !value.is_str()
    {
        value = toml::Value::String(raw.to_string());
    }
    section_table.insert(field.to_string(), value);

    toml::Value::Table(table)
        .try_into::<LauncherConfig>()
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("unknown field") {
                ConfigError::UnknownKey(key.to_string())
            } else {
                ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: message.trim().to_string(),
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_full_config_parses() {
        let input = r#"
[paths]
repo_root = "/opt/ComfyUI"
python = "/opt/python_embeded/python"
git = "/usr/bin/git"

[launch]
compute_mode = "cpu"
vram_flag = "--lowvram"
fast = true
listen_all = true
port = 8190
cors = false
disable_custom_nodes = true
disable_api_nodes = true
attention_flag = "--use-sage-attention"
auto_launch_browser = true
extra_args = "--preview-method auto"

[mirrors]
hf_endpoint = "https://hf-mirror.com"
pip_index = "https://pypi.tuna.tsinghua.edu.cn/simple"

[proxy]
mode = "custom"
url = "https://ghproxy.example/"

[state]
safe_directory_marked = true
manager_git_path = "/opt/tools/PortableGit/bin/git"
"#;
        let config = parse_config(input).unwrap();
        assert_eq!(config.paths.repo_root, Some(PathBuf::from("/opt/ComfyUI")));
        assert_eq!(config.launch.compute_mode, ComputeMode::Cpu);
        assert_eq!(config.launch.port, 8190);
        assert!(!config.launch.cors);
        assert_eq!(config.launch.extra_args, "--preview-method auto");
        assert_eq!(
            config.mirrors.hf_endpoint.as_deref(),
            Some("https://hf-mirror.com")
        );
        assert_eq!(
            config.proxy_rule(),
            ProxyRule::Custom("https://ghproxy.example/".into())
        );
        assert!(config.state.safe_directory_marked);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = parse_config("").unwrap();
        assert_eq!(config, LauncherConfig::default());
        assert_eq!(config.launch.port, 8188);
        assert!(config.launch.cors);
        assert_eq!(config.proxy_rule(), ProxyRule::None);
    }

    #[test]
    fn test_unknown_field_errors() {
        let input = r#"
[launch]
port = 8188
bogus_field = "x"
"#;
        let result = parse_config(input);
        assert!(matches!(result.unwrap_err(), ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_unknown_section_errors() {
        let result = parse_config("[daemon]\nenabled = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_fixed_proxy_rule() {
        let mut config = LauncherConfig::default();
        config.proxy.mode = ProxyMode::Fixed;
        assert_eq!(
            config.proxy_rule(),
            ProxyRule::Fixed(FIXED_PROXY_PREFIX.to_string())
        );
    }

    #[test]
    fn test_custom_proxy_without_url_is_none() {
        let mut config = LauncherConfig::default();
        config.proxy.mode = ProxyMode::Custom;
        config.proxy.url = Some("   ".into());
        assert_eq!(config.proxy_rule(), ProxyRule::None);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, LauncherConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = LauncherConfig::default();
        config.paths.repo_root = Some(PathBuf::from("/srv/ComfyUI"));
        config.launch.fast = true;
        config.state.manager_git_path = Some(PathBuf::from("/g/git"));
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_set_value_typed() {
        let config = LauncherConfig::default();
        let config = set_value(&config, "launch.port", "8190").unwrap();
        assert_eq!(config.launch.port, 8190);
        let config = set_value(&config, "launch.fast", "true").unwrap();
        assert!(config.launch.fast);
        let config = set_value(&config, "proxy.mode", "fixed").unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Fixed);
    }

    #[test]
    fn test_set_value_unset_option_field() {
        let config = LauncherConfig::default();
        let config = set_value(&config, "paths.repo_root", "/data/ComfyUI").unwrap();
        assert_eq!(config.paths.repo_root, Some(PathBuf::from("/data/ComfyUI")));
    }

    #[test]
    fn test_set_value_string_field_keeps_numeric_text() {
        let config = LauncherConfig::default();
        let config = set_value(&config, "launch.extra_args", "123").unwrap();
        assert_eq!(config.launch.extra_args, "123");
    }

    #[test]
    fn test_set_value_rejects_unknown_key() {
        let config = LauncherConfig::default();
        assert_eq!(
            set_value(&config, "launch.bogus", "1").unwrap_err(),
            ConfigError::UnknownKey("launch.bogus".into())
        );
        assert_eq!(
            set_value(&config, "nosection.key", "1").unwrap_err(),
            ConfigError::UnknownKey("nosection.key".into())
        );
        assert_eq!(
            set_value(&config, "port", "1").unwrap_err(),
            ConfigError::UnknownKey("port".into())
        );
    }

    #[test]
    fn test_set_value_rejects_bad_type() {
        let config = LauncherConfig::default();
        let err = set_value(&config, "launch.port", "eighty").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
