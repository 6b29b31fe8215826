//! Projection of user-facing settings onto [`ProxyRuntimeConfig`].
//!
//! Each mapping names a setting, the runtime field it writes and a
//! transform from a closed set. Transforms are data, evaluated by
//! [`SettingTransform::evaluate`]; there is no expression language.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::runtime::ProxyRuntimeConfig;

/// Runtime fields a setting can be projected onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuntimeField {
    Host,
    Port,
    EnableSystemProxy,
}

/// How a setting value becomes a runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SettingTransform {
    /// Use the setting value as is.
    Direct,
    /// Select one of two values based on a boolean setting.
    #[serde(rename_all = "camelCase")]
    ConditionalBoolean { true_value: Value, false_value: Value },
    /// Ignore the setting value.
    Constant { value: Value },
}

impl SettingTransform {
    pub fn evaluate(&self, setting: &str, input: &Value) -> DomainResult<Value> {
        match self {
            Self::Direct => Ok(input.clone()),
            Self::ConditionalBoolean {
                true_value,
                false_value,
            } => match input.as_bool() {
                Some(true) => Ok(true_value.clone()),
                Some(false) => Ok(false_value.clone()),
                None => Err(DomainError::invalid(setting, input, "boolean")),
            },
            Self::Constant { value } => Ok(value.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub setting: String,
    pub target: RuntimeField,
    pub transform: SettingTransform,
}

impl FieldMapping {
    pub fn new(setting: &str, target: RuntimeField, transform: SettingTransform) -> Self {
        Self {
            setting: setting.to_string(),
            target,
            transform,
        }
    }
}

/// The mappings used for start overrides: `allowLan`, `systemProxy`, `mixedPort`.
pub fn default_mappings() -> Vec<FieldMapping> {
    vec![
        FieldMapping::new(
            "allowLan",
            RuntimeField::Host,
            SettingTransform::ConditionalBoolean {
                true_value: Value::from("0.0.0.0"),
                false_value: Value::from("127.0.0.1"),
            },
        ),
        FieldMapping::new(
            "systemProxy",
            RuntimeField::EnableSystemProxy,
            SettingTransform::Direct,
        ),
        FieldMapping::new("mixedPort", RuntimeField::Port, SettingTransform::Direct),
    ]
}

fn write_field(
    config: &mut ProxyRuntimeConfig,
    setting: &str,
    target: RuntimeField,
    value: &Value,
) -> DomainResult<()> {
    match target {
        RuntimeField::Host => {
            let host = value
                .as_str()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| DomainError::invalid(setting, value, "host string"))?;
            config.host = host.to_string();
        }
        RuntimeField::Port => {
            let port = match value {
                Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                Value::String(s) => s.trim().parse::<u16>().ok(),
                _ => None,
            }
            .filter(|port| *port != 0)
            .ok_or_else(|| DomainError::invalid(setting, value, "port number"))?;
            config.port = port;
        }
        RuntimeField::EnableSystemProxy => {
            config.enable_system_proxy = value
                .as_bool()
                .ok_or_else(|| DomainError::invalid(setting, value, "boolean"))?;
        }
    }
    Ok(())
}

/// Applies every mapping whose setting is present in `settings`.
///
/// Settings without a mapping are ignored. Validation happens before any
/// field is written, so an error leaves `config` untouched.
pub fn apply_settings(
    config: &mut ProxyRuntimeConfig,
    settings: &HashMap<String, Value>,
    mappings: &[FieldMapping],
) -> DomainResult<Vec<RuntimeField>> {
    let mut staged = config.clone();
    let mut applied = Vec::new();

    for mapping in mappings {
        let Some(input) = settings.get(&mapping.setting) else {
            continue;
        };
        let value = mapping.transform.evaluate(&mapping.setting, input)?;
        write_field(&mut staged, &mapping.setting, mapping.target, &value)?;
        applied.push(mapping.target);
    }

    *config = staged;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_allow_lan_selects_wildcard_host() {
        let mut config = ProxyRuntimeConfig::default();
        let applied =
            apply_settings(&mut config, &settings(json!({"allowLan": true})), &default_mappings())
                .unwrap();
        assert_eq!(applied, vec![RuntimeField::Host]);
        assert_eq!(config.host, "0.0.0.0");

        apply_settings(&mut config, &settings(json!({"allowLan": false})), &default_mappings())
            .unwrap();
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_direct_port_and_system_proxy() {
        let mut config = ProxyRuntimeConfig::default();
        apply_settings(
            &mut config,
            &settings(json!({"mixedPort": "7893", "systemProxy": true, "theme": "dark"})),
            &default_mappings(),
        )
        .unwrap();
        assert_eq!(config.port, 7893);
        assert!(config.enable_system_proxy);
    }

    #[test]
    fn test_invalid_value_leaves_config_untouched() {
        let mut config = ProxyRuntimeConfig::default();
        let err = apply_settings(
            &mut config,
            &settings(json!({"allowLan": true, "mixedPort": 70000})),
            &default_mappings(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidFieldValue { .. }));
        assert_eq!(config, ProxyRuntimeConfig::default());
    }

    #[test]
    fn test_conditional_requires_boolean() {
        let transform = SettingTransform::ConditionalBoolean {
            true_value: json!("a"),
            false_value: json!("b"),
        };
        assert!(transform.evaluate("allowLan", &json!("yes")).is_err());
    }

    #[test]
    fn test_constant_ignores_input() {
        let mappings = vec![FieldMapping::new(
            "lockPort",
            RuntimeField::Port,
            SettingTransform::Constant { value: json!(9000) },
        )];
        let mut config = ProxyRuntimeConfig::default();
        apply_settings(&mut config, &settings(json!({"lockPort": null})), &mappings).unwrap();
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_transform_serde_tagged() {
        let transform: SettingTransform = serde_json::from_value(json!({
            "kind": "conditionalBoolean",
            "trueValue": 1,
            "falseValue": 0
        }))
        .unwrap();
        assert_eq!(
            transform,
            SettingTransform::ConditionalBoolean {
                true_value: json!(1),
                false_value: json!(0)
            }
        );
    }
}
