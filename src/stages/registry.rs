//! Process-wide stage registry: maps stage-type names to constructors and
//! carries the option metadata served by `GET /api/stages`.
//!
//! Populated once on first use and read-only afterwards, so the hot path
//! needs no locks.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;

use crate::stages::{Stage, StageError, StageSpec};

/// One configurable option of a stage, as surfaced to API clients.
pub struct OptionMeta {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: &'static str,
    pub required: bool,
    /// Default rendered as a JSON literal (`"30"`, `"false"`, `"\"$x\""`).
    pub default: Option<&'static str>,
    pub description: &'static str,
    pub placeholder: &'static str,
}

impl OptionMeta {
    pub fn default_value(&self) -> Value {
        self.default
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null)
    }
}

/// Class-level stage metadata plus the constructor used to instantiate the
/// stage from a spec.
pub struct StageDescriptor {
    pub type_name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub is_network_stage: bool,
    pub options: &'static [OptionMeta],
    pub build: fn(&StageSpec) -> Result<Box<dyn Stage>, StageError>,
}

fn registry_map() -> &'static HashMap<&'static str, &'static StageDescriptor> {
    static REGISTRY: OnceLock<HashMap<&'static str, &'static StageDescriptor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let descriptors: [&'static StageDescriptor; 12] = [
            &crate::stages::http::DESCRIPTOR,
            &crate::stages::ssl::DESCRIPTOR,
            &crate::stages::tcp::DESCRIPTOR,
            &crate::stages::dns::DESCRIPTOR,
            &crate::stages::jq::DESCRIPTOR,
            &crate::stages::jsonpath::DESCRIPTOR,
            &crate::stages::regex::DESCRIPTOR,
            &crate::stages::header::DESCRIPTOR,
            &crate::stages::threshold::DESCRIPTOR,
            &crate::stages::contains::DESCRIPTOR,
            &crate::stages::age::DESCRIPTOR,
            &crate::stages::json_schema::DESCRIPTOR,
        ];
        descriptors.iter().map(|d| (d.type_name, *d)).collect()
    })
}

/// All registered stages, in a stable order (sorted by type name).
pub fn registry() -> Vec<&'static StageDescriptor> {
    let mut all: Vec<_> = registry_map().values().copied().collect();
    all.sort_by_key(|d| d.type_name);
    all
}

/// Look up a descriptor by type name.
pub fn get_stage(name: &str) -> Result<&'static StageDescriptor, StageError> {
    registry_map()
        .get(name)
        .copied()
        .ok_or_else(|| StageError::UnknownStage(name.to_string()))
}

/// Instantiate a stage from a pipeline spec entry.
pub fn build_stage(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
    let descriptor = get_stage(&spec.stage_type)?;
    (descriptor.build)(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_builtin_stages_are_registered() {
        let names: Vec<_> = registry().iter().map(|d| d.type_name).collect();
        for expected in [
            "age",
            "contains",
            "dns",
            "header",
            "http",
            "jq",
            "json-schema",
            "jsonpath",
            "regex",
            "ssl",
            "tcp",
            "threshold",
        ] {
            assert!(names.contains(&expected), "missing stage {expected}");
        }
    }

    #[test]
    fn unknown_stage_is_an_error() {
        assert!(matches!(
            get_stage("frobnicate"),
            Err(StageError::UnknownStage(_))
        ));
    }

    #[test]
    fn network_flags_match_stage_kinds() {
        for d in registry() {
            let expected = matches!(d.type_name, "http" | "ssl" | "tcp" | "dns");
            assert_eq!(d.is_network_stage, expected, "stage {}", d.type_name);
        }
    }

    #[test]
    fn option_defaults_parse_as_json() {
        for d in registry() {
            for opt in d.options {
                if opt.default.is_some() {
                    assert_ne!(opt.default_value(), Value::Null, "{}:{}", d.type_name, opt.name);
                }
            }
        }
    }
}
