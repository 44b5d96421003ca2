//! `flagd_core` is the in-process evaluation core for flagd flag
//! configuration: it keeps a synchronized in-memory flag set and evaluates
//! targeting rules locally, with no network round trip per evaluation.
//!
//! # Overview
//!
//! [`FlagSet`](flagset::FlagSet) is an immutable snapshot of every flag from
//! one synchronization delivery, produced by [`flagset::parse`] from a raw
//! JSON or YAML document. A flag that fails validation is dropped (or, in
//! strict mode, fails the document) while sibling flags keep serving.
//!
//! [`FlagStore`] is a thread-safe holder of the current `FlagSet`. Snapshots
//! are replaced atomically and never mutated, so a reader that started
//! evaluating against one snapshot finishes against it regardless of
//! concurrent replacements.
//!
//! Sync connectors ([`FileConnector`](sync::FileConnector),
//! [`GrpcConnector`](sync::GrpcConnector)) run on background threads,
//! delivering new flag sets into the store and reporting lifecycle
//! transitions ([`ProviderEvent`]) on the resolver's [`EventBus`]. Each
//! connector owns its retry/backoff policy; a failing source never fails an
//! evaluation, the store just keeps serving the last good snapshot.
//!
//! Targeting rules are a JSON-Logic dialect with the flagd custom operators
//! (`fractional`, `sem_ver`, `starts_with`, `ends_with`). They are compiled
//! at document load into a closed expression tree ([`targeting`]) and
//! evaluated per request against an [`EvaluationContext`].
//!
//! [`InProcessResolver`] ties it together: it composes a connector from a
//! [`SourceConfig`](sync::SourceConfig), owns the event bus, and answers
//! typed resolution requests ([`InProcessResolver::resolve_bool`] and
//! friends) with a [`ResolutionResult`] carrying value, variant, reason and
//! flag metadata. Deterministic per-call failures (unknown flag, malformed
//! rule, type mismatch) are returned as [`EvaluationError`] and never
//! retried.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) crate under the
//! `flagd` target.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod events;
pub mod flagset;
pub mod sync;
pub mod targeting;

mod context;
mod error;
mod resolver;
mod store;

pub use context::EvaluationContext;
pub use error::{Error, ErrorCode, EvaluationError, Result};
pub use events::{EventBus, ProviderEvent};
pub use flagset::FlagSet;
pub use resolver::{InProcessResolver, Reason, ResolutionResult};
pub use store::FlagStore;
