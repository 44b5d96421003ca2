//! Flag configuration document parsing and validation.
//!
//! Parsing is a pure transform: raw bytes in, [`FlagSet`] or error out. In
//! permissive mode a flag that fails validation is dropped, with the error
//! logged against that flag, so sibling flags keep serving; strict mode fails
//! the whole document instead.
use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};

use super::{Flag, FlagSet, FlagState, Metadata, MetadataValue};
use crate::targeting::TargetingRule;
use crate::{Error, Result};

/// Bound on `$ref` substitution passes. Exceeding it means the `$evaluators`
/// fragments reference each other in a cycle.
const MAX_REF_DEPTH: usize = 10;

/// Wire format of a flag configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentFormat {
    /// JSON document.
    #[default]
    Json,
    /// YAML document.
    Yaml,
}

impl DocumentFormat {
    /// Infer the format from a file extension; anything but `.yaml`/`.yml`
    /// is treated as JSON.
    pub fn from_path(path: &Path) -> DocumentFormat {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => DocumentFormat::Yaml,
            _ => DocumentFormat::Json,
        }
    }
}

/// What to do with a flag definition that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Drop only the offending flag; siblings keep serving. Looking up the
    /// dropped flag misses, reporting flag-not-found.
    #[default]
    Permissive,
    /// Any invalid flag fails the whole document.
    Strict,
}

/// Parse and validate a flag configuration document.
pub fn parse(raw: &[u8], format: DocumentFormat, mode: ParseMode) -> Result<FlagSet> {
    let document: Value = match format {
        DocumentFormat::Json => serde_json::from_slice(raw)
            .map_err(|e| Error::InvalidConfiguration(format!("invalid JSON: {e}")))?,
        DocumentFormat::Yaml => serde_yaml::from_slice(raw)
            .map_err(|e| Error::InvalidConfiguration(format!("invalid YAML: {e}")))?,
    };

    let Value::Object(document) = document else {
        return Err(Error::InvalidConfiguration(
            "flag configuration root must be an object".to_owned(),
        ));
    };

    let evaluators = match document.get("$evaluators") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(Error::InvalidConfiguration(
                "$evaluators must be an object".to_owned(),
            ))
        }
        None => Map::new(),
    };

    let set_metadata = match document.get("metadata") {
        Some(value) => validate_metadata(value)
            .map_err(|e| Error::InvalidConfiguration(format!("flag set metadata: {e}")))?,
        None => Metadata::new(),
    };

    let entries = match document.get("flags") {
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(Error::InvalidConfiguration(
                "\"flags\" must be an object".to_owned(),
            ))
        }
        None => {
            return Err(Error::InvalidConfiguration(
                "missing required field \"flags\"".to_owned(),
            ))
        }
    };

    let mut flags = BTreeMap::new();
    for (key, definition) in entries {
        match parse_flag(definition, &set_metadata, &evaluators) {
            Ok(flag) => {
                flags.insert(key.clone(), flag);
            }
            Err(message) => match mode {
                ParseMode::Permissive => {
                    log::warn!(target: "flagd", flag_key = key.as_str(); "dropping invalid flag: {message}");
                }
                ParseMode::Strict => {
                    return Err(Error::InvalidConfiguration(format!("flag \"{key}\": {message}")))
                }
            },
        }
    }

    Ok(FlagSet {
        flags,
        metadata: set_metadata,
    })
}

fn parse_flag(
    definition: &Value,
    set_metadata: &Metadata,
    evaluators: &Map<String, Value>,
) -> std::result::Result<Flag, String> {
    let Value::Object(definition) = definition else {
        return Err("flag definition must be an object".to_owned());
    };

    let state = match definition.get("state") {
        Some(Value::String(s)) => match s.as_str() {
            "ENABLED" => FlagState::Enabled,
            "DISABLED" => FlagState::Disabled,
            other => return Err(format!("invalid state \"{other}\"")),
        },
        Some(_) => return Err("\"state\" must be a string".to_owned()),
        None => return Err("missing required field \"state\"".to_owned()),
    };

    let variants: BTreeMap<String, Value> = match definition.get("variants") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        Some(_) => return Err("\"variants\" must be an object".to_owned()),
        None => return Err("missing required field \"variants\"".to_owned()),
    };

    let default_variant = match definition.get("defaultVariant") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err("\"defaultVariant\" must be a string".to_owned()),
        None => return Err("missing required field \"defaultVariant\"".to_owned()),
    };
    if !variants.contains_key(&default_variant) {
        return Err(format!(
            "defaultVariant \"{default_variant}\" is not a variant"
        ));
    }

    // An empty targeting object means "no targeting".
    let targeting = match definition.get("targeting") {
        Some(rule) if !is_empty_targeting(Some(rule)) => {
            let rule = inline_refs(rule, evaluators, 0)?;
            Some(TargetingRule::compile(&rule).map_err(|e| format!("targeting: {e}"))?)
        }
        _ => None,
    };

    let mut metadata = set_metadata.clone();
    if let Some(value) = definition.get("metadata") {
        // Flag-level entries win on key collision.
        metadata.append(&mut validate_metadata(value).map_err(|e| format!("metadata: {e}"))?);
    }

    Ok(Flag {
        state,
        variants,
        default_variant,
        targeting,
        metadata,
    })
}

fn is_empty_targeting(targeting: Option<&Value>) -> bool {
    match targeting {
        None => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Replace `{"$ref": name}` nodes with the named `$evaluators` fragment.
/// Fragments may reference other fragments; the depth bound rejects cycles.
fn inline_refs(
    rule: &Value,
    evaluators: &Map<String, Value>,
    depth: usize,
) -> std::result::Result<Value, String> {
    if depth > MAX_REF_DEPTH {
        return Err("evaluator reference depth exceeded, check $evaluators for cycles".to_owned());
    }
    match rule {
        Value::Object(map) => {
            if let (1, Some(Value::String(name))) = (map.len(), map.get("$ref")) {
                let fragment = evaluators
                    .get(name)
                    .ok_or_else(|| format!("unknown evaluator reference \"{name}\""))?;
                return inline_refs(fragment, evaluators, depth + 1);
            }
            let mut inlined = Map::new();
            for (key, value) in map {
                inlined.insert(key.clone(), inline_refs(value, evaluators, depth)?);
            }
            Ok(Value::Object(inlined))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| inline_refs(item, evaluators, depth))
                .collect::<std::result::Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn validate_metadata(value: &Value) -> std::result::Result<Metadata, String> {
    let Value::Object(map) = value else {
        return Err("metadata must be an object".to_owned());
    };
    let mut metadata = Metadata::new();
    for (key, value) in map {
        if key.is_empty() {
            return Err("metadata keys must be non-empty strings".to_owned());
        }
        let value = match value {
            Value::String(s) => MetadataValue::String(s.clone()),
            Value::Number(n) => MetadataValue::Number(
                n.as_f64().ok_or_else(|| format!("metadata value for \"{key}\" is not a finite number"))?,
            ),
            Value::Bool(b) => MetadataValue::Boolean(*b),
            _ => {
                return Err(format!(
                    "metadata value for \"{key}\" must be a string, number or boolean"
                ))
            }
        };
        metadata.insert(key.clone(), value);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse, DocumentFormat, ParseMode};
    use crate::flagset::{FlagState, MetadataValue};
    use crate::Error;

    fn parse_json(document: serde_json::Value) -> crate::Result<crate::FlagSet> {
        parse(
            document.to_string().as_bytes(),
            DocumentFormat::Json,
            ParseMode::Permissive,
        )
    }

    #[test]
    fn parses_a_minimal_document() {
        let set = parse_json(json!({
            "flags": {
                "bool-flag": {
                    "state": "ENABLED",
                    "variants": {"on": true, "off": false},
                    "defaultVariant": "off"
                }
            }
        }))
        .unwrap();

        let flag = &set.flags["bool-flag"];
        assert_eq!(flag.state, FlagState::Enabled);
        assert_eq!(flag.default_variant, "off");
        assert!(flag.targeting.is_none());
    }

    #[test]
    fn parses_yaml() {
        let raw = b"flags:\n  bool-flag:\n    state: ENABLED\n    variants:\n      on: true\n      off: false\n    defaultVariant: off\n";
        let set = parse(raw, DocumentFormat::Yaml, ParseMode::Permissive).unwrap();
        assert!(set.flags.contains_key("bool-flag"));
    }

    #[test]
    fn invalid_flag_is_dropped_but_siblings_survive() {
        let set = parse_json(json!({
            "flags": {
                "good": {
                    "state": "ENABLED",
                    "variants": {"on": true, "off": false},
                    "defaultVariant": "off"
                },
                "missing-variants": {
                    "state": "ENABLED",
                    "defaultVariant": "off"
                }
            }
        }))
        .unwrap();

        assert!(set.flags.contains_key("good"));
        assert!(!set.flags.contains_key("missing-variants"));
    }

    #[test]
    fn strict_mode_fails_the_whole_document() {
        let document = json!({
            "flags": {
                "good": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on"
                },
                "bad": {"state": "ENABLED"}
            }
        });
        let result = parse(
            document.to_string().as_bytes(),
            DocumentFormat::Json,
            ParseMode::Strict,
        );
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn default_variant_must_exist() {
        let set = parse_json(json!({
            "flags": {
                "dangling": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "off"
                }
            }
        }))
        .unwrap();
        assert!(!set.flags.contains_key("dangling"));
    }

    #[test]
    fn unknown_state_is_invalid() {
        let set = parse_json(json!({
            "flags": {
                "odd": {
                    "state": "PAUSED",
                    "variants": {"on": true},
                    "defaultVariant": "on"
                }
            }
        }))
        .unwrap();
        assert!(!set.flags.contains_key("odd"));
    }

    #[test]
    fn metadata_merges_with_flag_level_winning() {
        let set = parse_json(json!({
            "metadata": {"team": "platform", "version": 1},
            "flags": {
                "f": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on",
                    "metadata": {"team": "checkout"}
                }
            }
        }))
        .unwrap();

        let flag = &set.flags["f"];
        assert_eq!(flag.metadata["team"], MetadataValue::from("checkout"));
        assert_eq!(flag.metadata["version"], MetadataValue::Number(1.0));
        assert_eq!(set.metadata["team"], MetadataValue::from("platform"));
    }

    #[test]
    fn invalid_metadata_drops_only_that_flag() {
        let set = parse_json(json!({
            "flags": {
                "bad-metadata": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on",
                    "metadata": {"nested": {"not": "allowed"}}
                },
                "good": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on"
                }
            }
        }))
        .unwrap();
        assert!(!set.flags.contains_key("bad-metadata"));
        assert!(set.flags.contains_key("good"));
    }

    #[test]
    fn empty_targeting_object_means_no_targeting() {
        let set = parse_json(json!({
            "flags": {
                "f": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on",
                    "targeting": {}
                }
            }
        }))
        .unwrap();
        let flag = &set.flags["f"];
        assert!(flag.targeting.is_none());
    }

    #[test]
    fn evaluator_refs_are_inlined() {
        let set = parse_json(json!({
            "$evaluators": {
                "vip": {"==": [{"var": "targetingKey"}, "vip"]}
            },
            "flags": {
                "f": {
                    "state": "ENABLED",
                    "variants": {"on": true, "off": false},
                    "defaultVariant": "off",
                    "targeting": {"if": [{"$ref": "vip"}, "on", null]}
                }
            }
        }))
        .unwrap();
        assert!(set.flags.contains_key("f"));
    }

    #[test]
    fn unknown_evaluator_ref_invalidates_the_flag() {
        let set = parse_json(json!({
            "flags": {
                "f": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on",
                    "targeting": {"if": [{"$ref": "nope"}, "on", null]}
                }
            }
        }))
        .unwrap();
        assert!(!set.flags.contains_key("f"));
    }

    #[test]
    fn cyclic_evaluator_refs_are_rejected() {
        let set = parse_json(json!({
            "$evaluators": {
                "a": {"$ref": "b"},
                "b": {"$ref": "a"}
            },
            "flags": {
                "f": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on",
                    "targeting": {"if": [{"$ref": "a"}, "on", null]}
                }
            }
        }))
        .unwrap();
        assert!(!set.flags.contains_key("f"));
    }

    #[test]
    fn malformed_json_is_a_document_error() {
        let result = parse(b"{ not json", DocumentFormat::Json, ParseMode::Permissive);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn missing_flags_field_is_a_document_error() {
        let result = parse(b"{}", DocumentFormat::Json, ParseMode::Permissive);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn format_is_inferred_from_extension() {
        use std::path::Path;
        assert_eq!(DocumentFormat::from_path(Path::new("flags.yaml")), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::from_path(Path::new("flags.yml")), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::from_path(Path::new("flags.json")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("flags")), DocumentFormat::Json);
    }
}
