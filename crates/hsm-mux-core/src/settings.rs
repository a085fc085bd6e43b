use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, MuxResult};

/// Operator settings consulted by the router at request time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxSettings {
    /// New sessions mark generated signing keys exportable.
    pub enable_exportable_private_keys: bool,
    /// Untrusted sessions may export keys.
    pub enable_key_export: bool,
    /// Devices have a master key; connections are refused until set.
    pub master_key_set: bool,
    /// Address reported to clients asking for the aggregator's IP.
    pub advertised_ip: String,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            enable_exportable_private_keys: false,
            enable_key_export: false,
            master_key_set: true,
            advertised_ip: "0.0.0.0".to_string(),
        }
    }
}

impl MuxSettings {
    /// Loads YAML, or JSON when the file has a `.json` extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> MuxResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(MuxError::config)?;
        if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
        {
            serde_json::from_str(&contents).map_err(MuxError::config)
        } else {
            serde_yaml::from_str(&contents).map_err(MuxError::config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn yaml_overrides_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("mux.yaml");
        std::fs::write(&path, "enable_key_export: true\nadvertised_ip: 10.1.2.3\n")
            .expect("write");

        let settings = MuxSettings::from_path(&path).expect("settings");
        assert!(settings.enable_key_export);
        assert!(!settings.enable_exportable_private_keys);
        assert!(settings.master_key_set);
        assert_eq!(settings.advertised_ip, "10.1.2.3");
    }

    #[test]
    fn json_is_detected_by_extension() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("mux.JSON");
        std::fs::write(&path, r#"{"master_key_set": false}"#).expect("write");

        let settings = MuxSettings::from_path(&path).expect("settings");
        assert!(!settings.master_key_set);
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        let dir = TempDir::new().expect("tempdir");
        let err = MuxSettings::from_path(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, MuxError::Config(_)));
    }
}
