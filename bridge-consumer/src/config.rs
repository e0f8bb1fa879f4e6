//! Locating and loading the configuration document.

use std::{env, fs};

use bridge_common::config::AppConfig;

use crate::error::BridgeError;

pub const CONFIG_FILE_ENV: &str = "CONSUMER_CONFIG_YAML_FILE";
pub const CONFIG_INLINE_ENV: &str = "CONSUMER_CONFIG_YAML";

/// Read the document from the file named by `CONSUMER_CONFIG_YAML_FILE`,
/// falling back to the inline `CONSUMER_CONFIG_YAML` variable.
pub fn load() -> Result<AppConfig, BridgeError> {
    let raw = match env::var(CONFIG_FILE_ENV) {
        Ok(path) if !path.is_empty() => fs::read_to_string(path)?,
        _ => env::var(CONFIG_INLINE_ENV).unwrap_or_default(),
    };

    Ok(AppConfig::from_yaml(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_inline_and_file_documents() {
        let document = r#"
prefix: "qa"
services:
- name: "a"
  routes: [{name: "x"}]
"#;

        env::remove_var(CONFIG_FILE_ENV);
        env::set_var(CONFIG_INLINE_ENV, document);
        let config = load().unwrap();
        assert_eq!(config.prefix, "qa");

        let dir = env::temp_dir().join("bridge-consumer-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        fs::write(&path, document.replace("qa", "staging")).unwrap();

        env::set_var(CONFIG_FILE_ENV, &path);
        let config = load().unwrap();
        assert_eq!(config.prefix, "staging");

        env::remove_var(CONFIG_FILE_ENV);
        env::remove_var(CONFIG_INLINE_ENV);
    }
}
