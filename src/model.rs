//! Data types shared across the generation pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// One component the user asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form, component-specific settings.
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl ComponentConfig {
    pub fn new(component_type: &str, name: &str) -> Self {
        Self {
            component_type: component_type.to_string(),
            name: name.to_string(),
            enabled: true,
            config: Map::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    /// Reads a string setting, ignoring values of any other JSON type.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Reads a list-of-strings setting such as `flags`.
    pub fn setting_list(&self, key: &str) -> Vec<String> {
        self.config
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Outcome of generating one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentResult {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    pub success: bool,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the internal skeleton generator produced this component.
    #[serde(default)]
    pub used_fallback: bool,
}

impl ComponentResult {
    pub fn succeeded(component: &ComponentConfig, path: PathBuf, used_fallback: bool) -> Self {
        Self {
            component_type: component.component_type.clone(),
            name: component.name.clone(),
            success: true,
            path,
            error: None,
            used_fallback,
        }
    }

    pub fn failed(component: &ComponentConfig, path: PathBuf, error: String) -> Self {
        Self {
            component_type: component.component_type.clone(),
            name: component.name.clone(),
            success: false,
            path,
            error: Some(error),
            used_fallback: false,
        }
    }
}

/// Settings handed to the integration collaborator once all components exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub project_name: String,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Stage of a generation run, used for logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Validating,
    BackingUp,
    CheckingTools,
    Generating,
    Integrating,
    ValidatingStructure,
    Committed,
    RolledBack,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::BackingUp => "backing-up",
            Self::CheckingTools => "checking-tools",
            Self::Generating => "generating",
            Self::Integrating => "integrating",
            Self::ValidatingStructure => "validating-structure",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_config_deserialize_defaults_enabled() {
        let json = r#"{"type": "go-backend", "name": "api"}"#;
        let component: ComponentConfig = serde_json::from_str(json).unwrap();

        assert_eq!(component.component_type, "go-backend");
        assert_eq!(component.name, "api");
        assert!(component.enabled);
        assert!(component.config.is_empty());
    }

    #[test]
    fn test_setting_list_skips_non_strings() {
        let component = ComponentConfig::new("nextjs", "web")
            .with_setting("flags", serde_json::json!(["--tailwind", 3, "--src-dir"]));

        assert_eq!(component.setting_list("flags"), vec!["--tailwind", "--src-dir"]);
        assert!(component.setting_list("missing").is_empty());
    }

    #[test]
    fn test_component_result_serializes_type_key() {
        let component = ComponentConfig::new("android", "app");
        let result = ComponentResult::succeeded(&component, PathBuf::from("/tmp/app"), true);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "android");
        assert!(json.get("error").is_none());
        assert_eq!(json["used_fallback"], true);
    }
}
