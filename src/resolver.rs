//! In-process flag resolution: orchestrates the store and the targeting
//! engine to answer typed per-flag requests.
use std::sync::Arc;

use serde_json::Value;

use crate::events::{EventBus, ProviderEvent};
use crate::flagset::{FlagSet, FlagState, Metadata, ValueType};
use crate::store::FlagStore;
use crate::sync::{Connector, FileConnector, GrpcConnector, SourceConfig};
use crate::targeting;
use crate::{ErrorCode, EvaluationContext, EvaluationError, Result};

/// Why a resolution produced the value it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Reason {
    /// The flag has no targeting; its own default variant was served.
    Static,
    /// Targeting evaluated to no match; the flag's default variant was
    /// served.
    Default,
    /// Targeting selected a variant.
    TargetingMatch,
    /// The flag is disabled; the caller-supplied default was returned.
    Disabled,
    /// Resolution failed; the value is the caller-supplied default.
    Error,
    /// The value was served from a cache in front of this resolver.
    Cached,
}

/// Outcome of a single typed resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionResult<T> {
    /// The resolved value, or the caller-supplied default for
    /// [`Reason::Disabled`] and [`Reason::Error`].
    pub value: T,
    /// Name of the variant served, when one was.
    pub variant: Option<String>,
    #[allow(missing_docs)]
    pub reason: Reason,
    /// Set only on [`Reason::Error`] results.
    pub error_code: Option<ErrorCode>,
    /// Merged flag metadata.
    pub flag_metadata: Metadata,
}

impl<T> ResolutionResult<T> {
    /// Build the error-shaped result for callers that fold typed errors into
    /// their own default value rather than propagating them.
    pub fn from_error(default_value: T, error: &EvaluationError) -> ResolutionResult<T> {
        ResolutionResult {
            value: default_value,
            variant: None,
            reason: Reason::Error,
            error_code: Some(error.error_code()),
            flag_metadata: Metadata::new(),
        }
    }
}

/// Evaluates flags against the current snapshot of a sync source.
///
/// The resolver composes one [`Connector`] from its [`SourceConfig`] at
/// construction time and owns the [`EventBus`] that the connector reports on.
/// Evaluation calls are synchronous, thread-safe and never blocked by
/// background synchronization.
pub struct InProcessResolver {
    store: Arc<FlagStore>,
    events: Arc<EventBus>,
    connector: Box<dyn Connector>,
}

impl InProcessResolver {
    /// Create a resolver backed by the given sync source. Synchronization
    /// starts on [`initialize`](InProcessResolver::initialize).
    pub fn new(source: SourceConfig) -> InProcessResolver {
        let store = Arc::new(FlagStore::new());
        let events = Arc::new(EventBus::new());
        let connector: Box<dyn Connector> = match source {
            SourceConfig::File(config) => {
                Box::new(FileConnector::new(config, store.clone(), events.clone()))
            }
            SourceConfig::Grpc(config) => {
                Box::new(GrpcConnector::new(config, store.clone(), events.clone()))
            }
        };
        InProcessResolver {
            store,
            events,
            connector,
        }
    }

    /// Start the sync source, blocking up to its configured deadline for the
    /// first flag set.
    pub fn initialize(&mut self) -> Result<()> {
        self.connector.initialize()
    }

    /// Stop the sync source and wait for its background thread to exit.
    /// In-flight evaluations are unaffected.
    pub fn shutdown(&mut self) -> Result<()> {
        self.connector.shutdown()
    }

    /// Register a lifecycle event handler on this resolver's bus.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Resolve a boolean flag.
    pub fn resolve_bool(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> std::result::Result<ResolutionResult<bool>, EvaluationError> {
        self.resolve_typed(flag_key, default_value, context, ValueType::Boolean, |value| {
            value.as_bool()
        })
    }

    /// Resolve a string flag.
    pub fn resolve_string(
        &self,
        flag_key: &str,
        default_value: String,
        context: &EvaluationContext,
    ) -> std::result::Result<ResolutionResult<String>, EvaluationError> {
        self.resolve_typed(flag_key, default_value, context, ValueType::String, |value| {
            value.as_str().map(str::to_owned)
        })
    }

    /// Resolve an integer flag. The variant value must be an integral JSON
    /// number.
    pub fn resolve_int(
        &self,
        flag_key: &str,
        default_value: i64,
        context: &EvaluationContext,
    ) -> std::result::Result<ResolutionResult<i64>, EvaluationError> {
        self.resolve_typed(flag_key, default_value, context, ValueType::Integer, |value| {
            value.as_i64()
        })
    }

    /// Resolve a floating-point flag.
    pub fn resolve_float(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> std::result::Result<ResolutionResult<f64>, EvaluationError> {
        self.resolve_typed(flag_key, default_value, context, ValueType::Number, |value| {
            value.as_f64()
        })
    }

    /// Resolve a structured flag (JSON object or array).
    pub fn resolve_object(
        &self,
        flag_key: &str,
        default_value: Value,
        context: &EvaluationContext,
    ) -> std::result::Result<ResolutionResult<Value>, EvaluationError> {
        self.resolve_typed(flag_key, default_value, context, ValueType::Object, |value| {
            matches!(value, Value::Object(_) | Value::Array(_)).then(|| value.clone())
        })
    }

    fn resolve_typed<T>(
        &self,
        flag_key: &str,
        default_value: T,
        context: &EvaluationContext,
        expected: ValueType,
        extract: impl FnOnce(&Value) -> Option<T>,
    ) -> std::result::Result<ResolutionResult<T>, EvaluationError> {
        let snapshot = self.store.snapshot();
        let result = resolve_from(&snapshot, flag_key, context).and_then(|resolved| match resolved {
            Resolved::Disabled { flag_metadata } => Ok(ResolutionResult {
                value: default_value,
                variant: None,
                reason: Reason::Disabled,
                error_code: None,
                flag_metadata,
            }),
            Resolved::Variant {
                value,
                variant,
                reason,
                flag_metadata,
            } => {
                let value = extract(&value).ok_or_else(|| EvaluationError::TypeMismatch {
                    expected,
                    found: ValueType::of(&value),
                })?;
                Ok(ResolutionResult {
                    value,
                    variant: Some(variant),
                    reason,
                    error_code: None,
                    flag_metadata,
                })
            }
        });

        match &result {
            Ok(resolution) => {
                log::trace!(target: "flagd",
                    flag_key,
                    variant = resolution.variant.as_deref();
                    "evaluated a flag");
            }
            Err(err) => {
                log::warn!(target: "flagd",
                    flag_key;
                    "error evaluating a flag: {err}");
            }
        }
        result
    }
}

/// Untyped resolution outcome, before the requested type is checked.
enum Resolved {
    Disabled {
        flag_metadata: Metadata,
    },
    Variant {
        value: Value,
        variant: String,
        reason: Reason,
        flag_metadata: Metadata,
    },
}

/// The per-evaluation state machine, run against one immutable snapshot.
fn resolve_from(
    flag_set: &FlagSet,
    flag_key: &str,
    context: &EvaluationContext,
) -> std::result::Result<Resolved, EvaluationError> {
    let Some(flag) = flag_set.get(flag_key) else {
        return Err(EvaluationError::FlagNotFound {
            key: flag_key.to_owned(),
        });
    };

    if flag.state == FlagState::Disabled {
        return Ok(Resolved::Disabled {
            flag_metadata: flag.metadata.clone(),
        });
    }

    let (variant, reason) = match &flag.targeting {
        None => (flag.default_variant.clone(), Reason::Static),
        Some(targeting) => {
            let scope = targeting::build_scope(flag_key, context);
            match targeting.evaluate(&scope) {
                Value::Null => (flag.default_variant.clone(), Reason::Default),
                Value::String(variant) => (variant, Reason::TargetingMatch),
                // Boolean selectors address variants by their string
                // representation.
                Value::Bool(selector) => (selector.to_string(), Reason::TargetingMatch),
                other => {
                    return Err(EvaluationError::Parse(format!(
                        "targeting for \"{flag_key}\" returned {:?} instead of a variant name",
                        ValueType::of(&other)
                    )))
                }
            }
        }
    };

    let Some(value) = flag.variants.get(&variant) else {
        return Err(EvaluationError::Parse(format!(
            "resolved variant \"{variant}\" is not in the variants of \"{flag_key}\""
        )));
    };

    Ok(Resolved::Variant {
        value: value.clone(),
        variant,
        reason,
        flag_metadata: flag.metadata.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{InProcessResolver, Reason, ResolutionResult};
    use crate::events::EventBus;
    use crate::flagset::{self, DocumentFormat, ParseMode, ValueType};
    use crate::store::FlagStore;
    use crate::sync::Connector;
    use crate::{ErrorCode, EvaluationContext, EvaluationError};

    struct NoopConnector;

    impl Connector for NoopConnector {
        fn initialize(&mut self) -> crate::Result<()> {
            Ok(())
        }
        fn shutdown(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    /// A resolver whose store is populated directly, with no sync source.
    fn resolver_with(document: serde_json::Value) -> InProcessResolver {
        let store = Arc::new(FlagStore::new());
        let flag_set = flagset::parse(
            document.to_string().as_bytes(),
            DocumentFormat::Json,
            ParseMode::Permissive,
        )
        .expect("test document should parse");
        store.replace(Arc::new(flag_set));
        InProcessResolver {
            store,
            events: Arc::new(EventBus::new()),
            connector: Box::new(NoopConnector),
        }
    }

    fn test_document() -> serde_json::Value {
        json!({
            "flags": {
                "static-flag": {
                    "state": "ENABLED",
                    "variants": {"on": true, "off": false},
                    "defaultVariant": "off"
                },
                "targeted-flag": {
                    "state": "ENABLED",
                    "variants": {"on": true, "off": false},
                    "defaultVariant": "off",
                    "targeting": {"if": [{"==": [{"var": "targetingKey"}, "vip"]}, "on", null]}
                },
                "disabled-flag": {
                    "state": "DISABLED",
                    "variants": {"on": true, "off": false},
                    "defaultVariant": "on",
                    "targeting": {"if": [true, "on"]}
                },
                "string-flag": {
                    "state": "ENABLED",
                    "variants": {"red": "#ff0000", "green": "#00ff00"},
                    "defaultVariant": "red"
                },
                "numbers-flag": {
                    "state": "ENABLED",
                    "variants": {"whole": 42, "fractional": 1.5},
                    "defaultVariant": "whole"
                },
                "object-flag": {
                    "state": "ENABLED",
                    "variants": {"config": {"retries": 3}},
                    "defaultVariant": "config"
                },
                "dangling-variant": {
                    "state": "ENABLED",
                    "variants": {"on": true, "off": false},
                    "defaultVariant": "off",
                    "targeting": {"if": [true, "missing-variant"]}
                },
                "bad-selector": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on",
                    "targeting": {"if": [true, 42]}
                },
                "broken-flag": {
                    "state": "ENABLED",
                    "defaultVariant": "off"
                }
            }
        })
    }

    #[test]
    fn static_resolution_serves_the_flags_own_default_variant() {
        let resolver = resolver_with(test_document());
        let result = resolver
            .resolve_bool("static-flag", false, &EvaluationContext::new())
            .unwrap();
        assert_eq!(result.value, false);
        assert_eq!(result.reason, Reason::Static);
        assert_eq!(result.variant.as_deref(), Some("off"));
        assert_eq!(result.error_code, None);
    }

    #[test]
    fn targeting_match_and_miss() {
        let resolver = resolver_with(test_document());

        let vip = EvaluationContext::new().with_targeting_key("vip");
        let result = resolver.resolve_bool("targeted-flag", false, &vip).unwrap();
        assert_eq!(result.value, true);
        assert_eq!(result.reason, Reason::TargetingMatch);
        assert_eq!(result.variant.as_deref(), Some("on"));

        let other = EvaluationContext::new().with_targeting_key("other");
        let result = resolver.resolve_bool("targeted-flag", false, &other).unwrap();
        assert_eq!(result.value, false);
        assert_eq!(result.reason, Reason::Default);
        assert_eq!(result.variant.as_deref(), Some("off"));
    }

    #[test]
    fn unknown_key_is_flag_not_found() {
        let resolver = resolver_with(test_document());
        let result = resolver.resolve_bool("no-such-flag", false, &EvaluationContext::new());
        assert_eq!(
            result,
            Err(EvaluationError::FlagNotFound {
                key: "no-such-flag".to_owned()
            })
        );
    }

    #[test]
    fn disabled_flag_returns_caller_default_regardless_of_targeting() {
        let resolver = resolver_with(test_document());
        let result = resolver
            .resolve_bool("disabled-flag", false, &EvaluationContext::new())
            .unwrap();
        assert_eq!(result.value, false);
        assert_eq!(result.reason, Reason::Disabled);
        assert_eq!(result.variant, None);
    }

    #[test]
    fn broken_flag_is_dropped_while_siblings_serve() {
        // "broken-flag" has no variants, so the permissive parser dropped it:
        // it resolves as flag-not-found while valid siblings still serve.
        let resolver = resolver_with(test_document());

        let broken = resolver.resolve_bool("broken-flag", false, &EvaluationContext::new());
        assert!(
            matches!(broken, Err(EvaluationError::FlagNotFound { .. })),
            "{broken:?}"
        );

        let sibling = resolver
            .resolve_bool("static-flag", true, &EvaluationContext::new())
            .unwrap();
        assert_eq!(sibling.reason, Reason::Static);
    }

    #[test]
    fn targeting_result_must_name_an_existing_variant() {
        let resolver = resolver_with(test_document());
        let result = resolver.resolve_bool("dangling-variant", false, &EvaluationContext::new());
        assert!(
            matches!(&result, Err(EvaluationError::Parse(message)) if message.contains("missing-variant")),
            "{result:?}"
        );
    }

    #[test]
    fn targeting_result_must_be_string_or_bool() {
        let resolver = resolver_with(test_document());
        let result = resolver.resolve_bool("bad-selector", false, &EvaluationContext::new());
        assert!(matches!(result, Err(EvaluationError::Parse(_))), "{result:?}");
    }

    #[test]
    fn type_mismatch_is_never_coerced() {
        let resolver = resolver_with(test_document());

        let result = resolver.resolve_bool("string-flag", false, &EvaluationContext::new());
        assert_eq!(
            result,
            Err(EvaluationError::TypeMismatch {
                expected: ValueType::Boolean,
                found: ValueType::String,
            })
        );

        let result = resolver.resolve_int("numbers-flag", 0, &EvaluationContext::new());
        assert_eq!(result.unwrap().value, 42);

        // A fractional number does not resolve as an integer.
        let context = EvaluationContext::new();
        let resolver2 = resolver_with(json!({
            "flags": {
                "numbers-flag": {
                    "state": "ENABLED",
                    "variants": {"fractional": 1.5},
                    "defaultVariant": "fractional"
                }
            }
        }));
        let result = resolver2.resolve_int("numbers-flag", 0, &context);
        assert_eq!(
            result,
            Err(EvaluationError::TypeMismatch {
                expected: ValueType::Integer,
                found: ValueType::Number,
            })
        );

        // But it resolves as a float, and integers widen to float.
        assert_eq!(
            resolver2
                .resolve_float("numbers-flag", 0.0, &context)
                .unwrap()
                .value,
            1.5
        );
        assert_eq!(
            resolver.resolve_float("numbers-flag", 0.0, &context).unwrap().value,
            42.0
        );
    }

    #[test]
    fn object_resolution() {
        let resolver = resolver_with(test_document());
        let result = resolver
            .resolve_object("object-flag", json!({}), &EvaluationContext::new())
            .unwrap();
        assert_eq!(result.value, json!({"retries": 3}));
        assert_eq!(result.variant.as_deref(), Some("config"));
    }

    #[test]
    fn flag_metadata_is_returned_with_results() {
        let resolver = resolver_with(json!({
            "metadata": {"team": "platform"},
            "flags": {
                "f": {
                    "state": "ENABLED",
                    "variants": {"on": true},
                    "defaultVariant": "on",
                    "metadata": {"owner": "checkout"}
                }
            }
        }));
        let result = resolver.resolve_bool("f", false, &EvaluationContext::new()).unwrap();
        assert_eq!(
            result.flag_metadata["team"],
            crate::flagset::MetadataValue::from("platform")
        );
        assert_eq!(
            result.flag_metadata["owner"],
            crate::flagset::MetadataValue::from("checkout")
        );
    }

    #[test]
    fn from_error_builds_the_error_shaped_result() {
        let error = EvaluationError::FlagNotFound {
            key: "nope".to_owned(),
        };
        let result = ResolutionResult::from_error(false, &error);
        assert_eq!(result.reason, Reason::Error);
        assert_eq!(result.error_code, Some(ErrorCode::FlagNotFound));
        assert_eq!(result.value, false);
    }

    #[test]
    fn fractional_targeting_distributes_deterministically() {
        let resolver = resolver_with(json!({
            "flags": {
                "experiment": {
                    "state": "ENABLED",
                    "variants": {"control": "a", "treatment": "b"},
                    "defaultVariant": "control",
                    "targeting": {"fractional": [["control", 50], ["treatment", 50]]}
                }
            }
        }));

        let context = EvaluationContext::new().with_targeting_key("user-1");
        let first = resolver
            .resolve_string("experiment", String::new(), &context)
            .unwrap();
        assert_eq!(first.reason, Reason::TargetingMatch);
        for _ in 0..10 {
            let again = resolver
                .resolve_string("experiment", String::new(), &context)
                .unwrap();
            assert_eq!(again.variant, first.variant);
        }

        // Without a targeting key the bucketing key is missing and the
        // default variant is served.
        let result = resolver
            .resolve_string("experiment", String::new(), &EvaluationContext::new())
            .unwrap();
        assert_eq!(result.reason, Reason::Default);
        assert_eq!(result.variant.as_deref(), Some("control"));
    }

    #[test]
    fn end_to_end_with_a_file_source() {
        use crate::sync::{FileSourceConfig, SourceConfig};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(test_document().to_string().as_bytes()).unwrap();
        f.sync_all().unwrap();

        let mut resolver = InProcessResolver::new(SourceConfig::File(FileSourceConfig::new(&path)));
        resolver.initialize().unwrap();

        let result = resolver
            .resolve_bool("static-flag", true, &EvaluationContext::new())
            .unwrap();
        assert_eq!(result.value, false);
        assert_eq!(result.reason, Reason::Static);

        resolver.shutdown().unwrap();
    }
}
