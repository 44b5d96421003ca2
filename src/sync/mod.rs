//! Sync connectors: pluggable sources that deliver flag configuration
//! documents into the [`FlagStore`](crate::FlagStore) over time.
//!
//! Each connector owns a background thread, its own retry/backoff policy and
//! its own error-to-event mapping. The evaluation path never waits on a
//! connector; the current snapshot is the only shared state.
mod file;
mod grpc;

pub use file::FileConnector;
pub use grpc::GrpcConnector;

use std::path::PathBuf;
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::flagset::ParseMode;
use crate::Result;

/// A source of flag configuration documents.
///
/// Connectors push parsed flag sets into the store and report lifecycle
/// transitions on the event bus they were constructed with.
pub trait Connector: Send {
    /// Start the background sync and block, up to the source's configured
    /// deadline, until the first flag set is available.
    ///
    /// A deadline elapsing is reported as
    /// [`Error::InitializationTimeout`](crate::Error::InitializationTimeout)
    /// and is non-fatal: background sync keeps retrying and readiness is
    /// reported asynchronously.
    fn initialize(&mut self) -> Result<()>;

    /// Stop the background sync, release the underlying resource and wait
    /// for the thread to exit. In-flight evaluations are unaffected.
    fn shutdown(&mut self) -> Result<()>;
}

/// Selects and configures the sync source for a resolver.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SourceConfig {
    /// Watch a flag configuration file on disk.
    File(FileSourceConfig),
    /// Stream from a flagd sync gRPC endpoint.
    Grpc(GrpcSourceConfig),
}

/// Configuration for [`FileConnector`].
#[derive(Debug, Clone)]
pub struct FileSourceConfig {
    /// Path of the flag configuration document. Format is inferred from the
    /// extension (`.yaml`/`.yml` is YAML, everything else JSON).
    pub path: PathBuf,
    /// Interval between modification-time polls.
    ///
    /// Defaults to [`FileSourceConfig::DEFAULT_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Whether an invalid flag drops only that flag or the whole document.
    pub parse_mode: ParseMode,
}

impl FileSourceConfig {
    /// Default value for [`FileSourceConfig::poll_interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Create a config watching `path` with default settings.
    pub fn new(path: impl Into<PathBuf>) -> FileSourceConfig {
        FileSourceConfig {
            path: path.into(),
            poll_interval: FileSourceConfig::DEFAULT_POLL_INTERVAL,
            parse_mode: ParseMode::default(),
        }
    }

    /// Update the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> FileSourceConfig {
        self.poll_interval = poll_interval;
        self
    }

    /// Update the parse mode.
    pub fn with_parse_mode(mut self, parse_mode: ParseMode) -> FileSourceConfig {
        self.parse_mode = parse_mode;
        self
    }
}

/// Configuration for [`GrpcConnector`].
#[derive(Debug, Clone)]
pub struct GrpcSourceConfig {
    /// Endpoint of the flagd sync service, e.g. `http://localhost:8015`.
    pub target: String,
    /// Sync-source selector forwarded with the stream request.
    pub selector: String,
    /// Identifier this client reports to the sync service.
    pub provider_id: String,
    /// First reconnect delay; doubles per failed attempt.
    ///
    /// Defaults to [`GrpcSourceConfig::DEFAULT_INITIAL_BACKOFF`].
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling.
    ///
    /// Defaults to [`GrpcSourceConfig::DEFAULT_MAX_BACKOFF`].
    pub max_backoff: Duration,
    /// How long [`Connector::initialize`] blocks waiting for the first sync.
    ///
    /// Defaults to [`GrpcSourceConfig::DEFAULT_DEADLINE`].
    pub deadline: Duration,
    /// Whether an invalid flag drops only that flag or the whole document.
    pub parse_mode: ParseMode,
}

impl GrpcSourceConfig {
    /// Default value for [`GrpcSourceConfig::initial_backoff`].
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
    /// Default value for [`GrpcSourceConfig::max_backoff`].
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);
    /// Default value for [`GrpcSourceConfig::deadline`].
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

    /// Create a config streaming from `target` with default settings.
    pub fn new(target: impl Into<String>) -> GrpcSourceConfig {
        GrpcSourceConfig {
            target: target.into(),
            selector: String::new(),
            provider_id: String::new(),
            initial_backoff: GrpcSourceConfig::DEFAULT_INITIAL_BACKOFF,
            max_backoff: GrpcSourceConfig::DEFAULT_MAX_BACKOFF,
            deadline: GrpcSourceConfig::DEFAULT_DEADLINE,
            parse_mode: ParseMode::default(),
        }
    }

    /// Update the sync selector.
    pub fn with_selector(mut self, selector: impl Into<String>) -> GrpcSourceConfig {
        self.selector = selector.into();
        self
    }

    /// Update the reported provider id.
    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> GrpcSourceConfig {
        self.provider_id = provider_id.into();
        self
    }

    /// Update the initialization deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> GrpcSourceConfig {
        self.deadline = deadline;
        self
    }

    /// Update the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> GrpcSourceConfig {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Update the parse mode.
    pub fn with_parse_mode(mut self, parse_mode: ParseMode) -> GrpcSourceConfig {
        self.parse_mode = parse_mode;
        self
    }
}

/// Exponential reconnect backoff: doubles per failure up to a cap, reset to
/// the initial delay after any success.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt. Doubles the stored delay.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Apply randomized subtractive jitter, up to a tenth of `delay`, so
/// reconnecting clients don't synchronize against a recovering server.
pub(crate) fn jitter(delay: Duration) -> Duration {
    let jitter = delay / 10;
    Duration::saturating_sub(delay, thread_rng().gen_range(Duration::ZERO..=jitter))
}
