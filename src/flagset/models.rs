use std::collections::BTreeMap;

use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::targeting::TargetingRule;

/// Flat metadata map attached to a flag set or an individual flag. Values are
/// restricted to scalars.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Scalar metadata value.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Whether a flag is served at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagState {
    /// Flag resolves normally.
    Enabled,
    /// Flag resolves to the caller-supplied default with reason DISABLED.
    Disabled,
}

/// Broad JSON type classification used for request/variant type checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    #[allow(missing_docs)]
    Boolean,
    #[allow(missing_docs)]
    String,
    /// A number with an integral value.
    Integer,
    /// Any other number.
    Number,
    #[allow(missing_docs)]
    Object,
    #[allow(missing_docs)]
    Array,
    #[allow(missing_docs)]
    Null,
}

impl ValueType {
    /// Classify a JSON value.
    pub fn of(value: &Value) -> ValueType {
        match value {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueType::Integer,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }
}

/// One validated feature flag definition. The flag's key lives in the owning
/// [`FlagSet`] map.
#[derive(Debug, Clone, PartialEq)]
pub struct Flag {
    /// Whether the flag is served.
    pub state: FlagState,
    /// Variant name to JSON value. Names are unique by construction.
    pub variants: BTreeMap<String, Value>,
    /// Name of the variant served when targeting is absent or yields no
    /// match. Always a key of `variants`.
    pub default_variant: String,
    /// Compiled targeting rule, if the definition had one.
    pub targeting: Option<TargetingRule>,
    /// Flag-set metadata merged with flag-level metadata (flag-level wins).
    pub metadata: Metadata,
}

/// An immutable snapshot of every flag from one synchronization delivery,
/// keyed by flag key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlagSet {
    /// Flags by key. Definitions that failed validation were dropped at
    /// parse time, so looking one up misses.
    pub flags: BTreeMap<String, Flag>,
    /// Flag-set-level metadata.
    pub metadata: Metadata,
}

impl FlagSet {
    /// Look up a flag by key.
    pub fn get(&self, key: &str) -> Option<&Flag> {
        self.flags.get(key)
    }

    /// Keys that differ between `self` and `next`: added, removed, or
    /// structurally changed. Returned sorted; an identical snapshot yields an
    /// empty list.
    pub fn changed_keys(&self, next: &FlagSet) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, flag) in &self.flags {
            match next.flags.get(key) {
                Some(next_flag) if next_flag == flag => {}
                _ => changed.push(key.clone()),
            }
        }
        for key in next.flags.keys() {
            if !self.flags.contains_key(key) {
                changed.push(key.clone());
            }
        }
        changed.sort();
        changed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{Flag, FlagSet, FlagState};

    fn flag(default_variant: &str) -> Flag {
        Flag {
            state: FlagState::Enabled,
            variants: BTreeMap::from([
                ("on".to_owned(), json!(true)),
                ("off".to_owned(), json!(false)),
            ]),
            default_variant: default_variant.to_owned(),
            targeting: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn changed_keys_on_identical_sets_is_empty() {
        let a = FlagSet {
            flags: BTreeMap::from([("bool-flag".to_owned(), flag("on"))]),
            metadata: BTreeMap::new(),
        };
        assert_eq!(a.changed_keys(&a.clone()), Vec::<String>::new());
    }

    #[test]
    fn changed_keys_reports_added_removed_and_modified() {
        let old = FlagSet {
            flags: BTreeMap::from([
                ("kept".to_owned(), flag("on")),
                ("modified".to_owned(), flag("on")),
                ("removed".to_owned(), flag("on")),
            ]),
            metadata: BTreeMap::new(),
        };
        let new = FlagSet {
            flags: BTreeMap::from([
                ("kept".to_owned(), flag("on")),
                ("modified".to_owned(), flag("off")),
                ("added".to_owned(), flag("on")),
            ]),
            metadata: BTreeMap::new(),
        };
        assert_eq!(old.changed_keys(&new), vec!["added", "modified", "removed"]);
    }
}
