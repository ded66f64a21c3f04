//! Load the `[env]` table from `<config dir>/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

fn config_path(app_name: &str) -> Result<Option<PathBuf>, LoadError> {
    let base = dirs::config_dir()
        .ok_or_else(|| LoadError::ConfigPath("no user config directory".to_string()))?;
    let path = base.join(app_name).join("config.toml");
    if path.exists() {
        Ok(Some(path))
    } else {
        Ok(None)
    }
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Returns the `[env]` key-value pairs. Missing file or empty section yields
/// an empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let path = match config_path(app_name)? {
        Some(p) => p,
        None => return Ok(HashMap::new()),
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::ConfigRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_app_dir_yields_empty_map() {
        let m = load_env_map("conclave-no-such-app-dir").unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn parses_env_table() {
        let cfg: ConfigFile = toml::from_str("[env]\nKEY = \"value\"\n").unwrap();
        assert_eq!(cfg.env.get("KEY"), Some(&"value".to_string()));
    }

    #[test]
    fn missing_env_table_defaults_empty() {
        let cfg: ConfigFile = toml::from_str("").unwrap();
        assert!(cfg.env.is_empty());
    }
}
