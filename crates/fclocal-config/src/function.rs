//! Function definitions: the declarative service and function properties
//! consumed when assembling containers.
//!
//! Definitions are read from `.toml` or `.json` files:
//!
//! ```toml
//! [service]
//! name = "demo"
//!
//! [function]
//! name = "hello"
//! runtime = "nodejs8"
//! handler = "index.handler"
//! code_uri = "./code"
//! ```

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Service and function properties loaded from a definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    #[serde(default)]
    pub service: ServiceProps,
    pub function: FunctionProps,
}

/// Service-level properties
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceProps {
    pub name: String,
    pub nas_config: Option<NasConfig>,
}

impl Default for ServiceProps {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            nas_config: None,
        }
    }
}

/// Function-level properties
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionProps {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub initializer: Option<String>,
    /// Initializer timeout in seconds
    pub initialization_timeout: Option<u32>,
    pub code_uri: Option<PathBuf>,
    pub environment_variables: BTreeMap<String, String>,
    /// Whether the function is fronted by an HTTP trigger
    pub http_trigger: bool,
}

/// NAS configuration of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NasConfig {
    /// `nas_config = "Auto"`
    Auto(String),
    Explicit(NasSettings),
}

/// Explicit NAS settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NasSettings {
    /// Owner uid inside the container, `-1` keeps the default
    #[serde(default = "unset_id")]
    pub user_id: i64,
    /// Owner gid inside the container, `-1` keeps the default
    #[serde(default = "unset_id")]
    pub group_id: i64,
    #[serde(default)]
    pub mount_points: Vec<NasMountPoint>,
}

fn unset_id() -> i64 {
    -1
}

/// One NAS export mounted into the function container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NasMountPoint {
    /// `host:/remote/path`
    pub server_addr: String,
    /// Absolute directory inside the container
    pub mount_dir: String,
}

impl NasMountPoint {
    /// Split `server_addr` into host and remote path
    pub fn server_parts(&self) -> (&str, &str) {
        match self.server_addr.split_once(':') {
            Some((host, path)) => (host, path),
            None => (self.server_addr.as_str(), "/"),
        }
    }
}

impl NasConfig {
    pub fn is_auto(&self) -> bool {
        matches!(self, NasConfig::Auto(_))
    }

    fn validate(&self) -> Result<()> {
        match self {
            NasConfig::Auto(s) if !s.eq_ignore_ascii_case("auto") => Err(ConfigError::Invalid(
                format!("nas_config must be \"Auto\" or a table, got {:?}", s),
            )),
            NasConfig::Explicit(settings) => {
                for mp in &settings.mount_points {
                    if !mp.mount_dir.starts_with('/') {
                        return Err(ConfigError::Invalid(format!(
                            "NAS mount_dir must be absolute: {}",
                            mp.mount_dir
                        )));
                    }
                }
                Ok(())
            }
            NasConfig::Auto(_) => Ok(()),
        }
    }
}

impl FunctionDefinition {
    /// Load a definition from a `.toml` or `.json` file
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let definition: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseError {
                    path: path.to_path_buf(),
                    source: e,
                })?
            }
            _ => toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
                path: path.to_path_buf(),
                source: e,
            })?,
        };

        definition.validate()?;
        tracing::debug!(
            "Loaded function {}/{} ({})",
            definition.service.name,
            definition.function.name,
            definition.function.runtime
        );
        Ok(definition)
    }

    fn validate(&self) -> Result<()> {
        if self.function.handler.is_empty() {
            return Err(ConfigError::Invalid("function handler is required".into()));
        }
        if self.function.runtime.is_empty() {
            return Err(ConfigError::Invalid("function runtime is required".into()));
        }
        if let Some(nas) = &self.service.nas_config {
            nas.validate()?;
        }
        Ok(())
    }

    /// Code location resolved against the definition's base directory
    pub fn code_uri(&self, base_dir: &Path) -> PathBuf {
        match &self.function.code_uri {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => base_dir.join(p),
            None => base_dir.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_definition() {
        let toml = r#"
[service]
name = "demo"

[service.nas_config]
user_id = 1000
mount_points = [{ server_addr = "abc.nas.aliyuncs.com:/share", mount_dir = "/mnt/nas" }]

[function]
name = "hello"
runtime = "python3"
handler = "index.handler"
initializer = "index.init"
initialization_timeout = 3

[function.environment_variables]
FOO = "bar"
"#;
        let def: FunctionDefinition = toml::from_str(toml).unwrap();
        assert_eq!(def.service.name, "demo");
        assert_eq!(def.function.initialization_timeout, Some(3));
        assert_eq!(def.function.environment_variables["FOO"], "bar");
        match def.service.nas_config.unwrap() {
            NasConfig::Explicit(settings) => {
                assert_eq!(settings.user_id, 1000);
                assert_eq!(settings.group_id, -1);
                assert_eq!(settings.mount_points[0].server_parts(), ("abc.nas.aliyuncs.com", "/share"));
            }
            other => panic!("unexpected nas config {:?}", other),
        }
    }

    #[test]
    fn test_parse_auto_nas_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fn.json");
        std::fs::write(
            &path,
            r#"{"service":{"name":"s","nas_config":"Auto"},"function":{"name":"f","runtime":"nodejs8","handler":"index.handler"}}"#,
        )
        .unwrap();
        let def = FunctionDefinition::load_from(&path).unwrap();
        assert!(def.service.nas_config.unwrap().is_auto());
    }

    #[test]
    fn test_rejects_bad_auto_value() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fn.toml");
        std::fs::write(
            &path,
            "[service]\nnas_config = \"sometimes\"\n[function]\nruntime = \"nodejs8\"\nhandler = \"h\"\n",
        )
        .unwrap();
        assert!(matches!(
            FunctionDefinition::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_handler_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fn.toml");
        std::fs::write(&path, "[function]\nruntime = \"nodejs8\"\n").unwrap();
        assert!(matches!(
            FunctionDefinition::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_code_uri_resolution() {
        let mut def = FunctionDefinition {
            service: ServiceProps::default(),
            function: FunctionProps {
                runtime: "nodejs8".into(),
                handler: "index.handler".into(),
                ..Default::default()
            },
        };
        let base = Path::new("/work/project");
        assert_eq!(def.code_uri(base), PathBuf::from("/work/project"));
        def.function.code_uri = Some(PathBuf::from("src"));
        assert_eq!(def.code_uri(base), PathBuf::from("/work/project/src"));
        def.function.code_uri = Some(PathBuf::from("/abs/code"));
        assert_eq!(def.code_uri(base), PathBuf::from("/abs/code"));
    }

    #[test]
    fn test_not_found() {
        assert!(matches!(
            FunctionDefinition::load_from(Path::new("/definitely/not/here.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }
}
