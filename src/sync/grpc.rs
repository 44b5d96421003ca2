//! gRPC sync connector: consumes the flagd sync streaming protocol and keeps
//! the store current, reconnecting with exponential backoff.
use std::sync::{Arc, Condvar, Mutex};

use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Endpoint;
use tonic::Request;

use crate::events::{EventBus, ProviderEvent};
use crate::flagset::{self, DocumentFormat, Metadata, MetadataValue};
use crate::store::FlagStore;
use crate::{Error, Result};

use super::{jitter, Backoff, Connector, GrpcSourceConfig};

const SYNC_FLAGS_PATH: &str = "/flagd.sync.v1.FlagSyncService/SyncFlags";
const GET_METADATA_PATH: &str = "/flagd.sync.v1.FlagSyncService/GetMetadata";

/// Wire messages of `flagd.sync.v1.FlagSyncService`, written out for the
/// narrow surface this connector consumes.
mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SyncFlagsRequest {
        /// Identifier of the requesting client.
        #[prost(string, tag = "1")]
        pub provider_id: ::prost::alloc::string::String,
        /// Source selector scoping which flags to sync.
        #[prost(string, tag = "2")]
        pub selector: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SyncFlagsResponse {
        /// Full flag configuration document as JSON.
        #[prost(string, tag = "1")]
        pub flag_configuration: ::prost::alloc::string::String,
        /// Optional per-message sync metadata.
        #[prost(message, optional, tag = "2")]
        pub sync_context: ::core::option::Option<::prost_types::Struct>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetMetadataRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetMetadataResponse {
        /// Sync metadata for clients whose stream messages carry none.
        #[prost(message, optional, tag = "1")]
        pub metadata: ::core::option::Option<::prost_types::Struct>,
    }
}

/// Streams flag configuration from a flagd sync endpoint.
///
/// `initialize` blocks up to the configured deadline waiting for the first
/// successful sync; afterwards a background thread owns the stream and
/// reconnects on failure with doubling backoff (reset after any successful
/// message). The store keeps serving the last good snapshot throughout.
pub struct GrpcConnector {
    config: GrpcSourceConfig,
    store: Arc<FlagStore>,
    events: Arc<EventBus>,
    worker: Option<Worker>,
}

struct Worker {
    join_handle: std::thread::JoinHandle<()>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl GrpcConnector {
    /// Create a connector pushing into `store` and reporting on `events`.
    pub fn new(
        config: GrpcSourceConfig,
        store: Arc<FlagStore>,
        events: Arc<EventBus>,
    ) -> GrpcConnector {
        GrpcConnector {
            config,
            store,
            events,
            worker: None,
        }
    }
}

impl Connector for GrpcConnector {
    fn initialize(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let endpoint = Endpoint::from_shared(self.config.target.clone())?;
        let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
        let synced = Arc::new((Mutex::new(false), Condvar::new()));

        let join_handle = {
            let session = SyncSession {
                config: self.config.clone(),
                store: self.store.clone(),
                events: self.events.clone(),
                synced: synced.clone(),
                sync_metadata: None,
                healthy: None,
                loaded: false,
            };
            std::thread::Builder::new()
                .name("flagd-grpc-sync".to_owned())
                .spawn(move || run_sync_loop(session, endpoint, shutdown_rx))?
        };
        self.worker = Some(Worker {
            join_handle,
            shutdown,
        });

        let (lock, condvar) = &*synced;
        let guard = lock
            .lock()
            .expect("thread holding sync flag lock should not panic");
        let (_guard, timeout) = condvar
            .wait_timeout_while(guard, self.config.deadline, |synced| !*synced)
            .expect("thread holding sync flag lock should not panic");
        if timeout.timed_out() {
            log::warn!(target: "flagd",
                "sync stream not ready within {:?}, continuing to retry in the background",
                self.config.deadline);
            return Err(Error::InitializationTimeout(self.config.deadline));
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // Error means the background thread already exited.
        let _ = worker.shutdown.send(true);
        worker.join_handle.join().map_err(|_| Error::ConnectorPanicked)
    }
}

fn run_sync_loop(
    mut session: SyncSession,
    endpoint: Endpoint,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            session
                .events
                .emit(ProviderEvent::Error(format!("cannot start sync runtime: {err}")));
            return;
        }
    };

    runtime.block_on(async move {
        let mut backoff = Backoff::new(session.config.initial_backoff, session.config.max_backoff);
        loop {
            tokio::select! {
                // A closed channel means the connector was dropped; stop too.
                _ = shutdown_rx.changed() => return,
                result = session.serve(&endpoint, &mut backoff) => {
                    let message = match result {
                        Ok(()) => "sync stream ended".to_owned(),
                        Err(err) => err.to_string(),
                    };
                    session.fail(&message);
                }
            }

            let delay = jitter(backoff.next_delay());
            log::debug!(target: "flagd", "reconnecting sync stream in {delay:?}");
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    });
}

/// Per-stream state shared by the sync loop.
struct SyncSession {
    config: GrpcSourceConfig,
    store: Arc<FlagStore>,
    events: Arc<EventBus>,
    /// Wakes a blocked `initialize` call after the first successful sync.
    synced: Arc<(Mutex<bool>, Condvar)>,
    /// Metadata fetched through the companion unary call, cached across
    /// messages that carry no sync context.
    sync_metadata: Option<Metadata>,
    healthy: Option<bool>,
    loaded: bool,
}

impl SyncSession {
    /// Connect and consume the stream until it ends or errors.
    async fn serve(&mut self, endpoint: &Endpoint, backoff: &mut Backoff) -> Result<()> {
        let channel = endpoint.connect().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await?;

        let request = proto::SyncFlagsRequest {
            provider_id: self.config.provider_id.clone(),
            selector: self.config.selector.clone(),
        };
        let codec: ProstCodec<proto::SyncFlagsRequest, proto::SyncFlagsResponse> =
            ProstCodec::default();
        let mut stream = grpc
            .server_streaming(
                Request::new(request),
                PathAndQuery::from_static(SYNC_FLAGS_PATH),
                codec,
            )
            .await?
            .into_inner();

        while let Some(message) = stream.message().await? {
            backoff.reset();
            let sync_context = match &message.sync_context {
                Some(context) => struct_to_metadata(context),
                None => self.fetch_metadata(endpoint).await,
            };
            self.apply(&message.flag_configuration, &sync_context);
        }
        Ok(())
    }

    /// Companion unary call used when stream messages carry no sync context.
    /// Failures degrade to empty metadata; they never fail the stream.
    async fn fetch_metadata(&mut self, endpoint: &Endpoint) -> Metadata {
        if let Some(cached) = &self.sync_metadata {
            return cached.clone();
        }
        let result: Result<Metadata> = async {
            let channel = endpoint.connect().await?;
            let mut grpc = tonic::client::Grpc::new(channel);
            grpc.ready().await?;
            let codec: ProstCodec<proto::GetMetadataRequest, proto::GetMetadataResponse> =
                ProstCodec::default();
            let response = grpc
                .unary(
                    Request::new(proto::GetMetadataRequest {}),
                    PathAndQuery::from_static(GET_METADATA_PATH),
                    codec,
                )
                .await?;
            Ok(response
                .into_inner()
                .metadata
                .as_ref()
                .map(struct_to_metadata)
                .unwrap_or_default())
        }
        .await;

        match result {
            Ok(metadata) => {
                self.sync_metadata = Some(metadata.clone());
                metadata
            }
            Err(err) => {
                log::warn!(target: "flagd", "sync metadata fetch failed: {err}");
                Metadata::new()
            }
        }
    }

    /// Parse one delivered document and swap it into the store.
    fn apply(&mut self, raw: &str, sync_context: &Metadata) {
        match flagset::parse(raw.as_bytes(), DocumentFormat::Json, self.config.parse_mode) {
            Ok(mut flag_set) => {
                // Sync-context entries have the lowest precedence: both
                // document-level and flag-level metadata win over them.
                for (key, value) in sync_context {
                    flag_set
                        .metadata
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                    for flag in flag_set.flags.values_mut() {
                        flag.metadata
                            .entry(key.clone())
                            .or_insert_with(|| value.clone());
                    }
                }

                let changed = self.store.replace(Arc::new(flag_set));
                if self.healthy != Some(true) {
                    self.healthy = Some(true);
                    self.events.emit(ProviderEvent::Ready);
                }
                if self.loaded && !changed.is_empty() {
                    self.events.emit(ProviderEvent::ConfigurationChanged(changed));
                }
                self.loaded = true;

                let (lock, condvar) = &*self.synced;
                *lock
                    .lock()
                    .expect("thread holding sync flag lock should not panic") = true;
                condvar.notify_all();
            }
            Err(err) => self.fail(&err.to_string()),
        }
    }

    /// Report a sync failure. Stale fires only when a snapshot had been
    /// served; both fire on transitions, not on every failed reconnect.
    fn fail(&mut self, message: &str) {
        log::warn!(target: "flagd", "sync stream failed: {message}");
        if self.healthy != Some(false) {
            self.healthy = Some(false);
            if self.loaded {
                self.events.emit(ProviderEvent::Stale);
            }
            self.events.emit(ProviderEvent::Error(message.to_owned()));
        }
    }
}

fn struct_to_metadata(context: &prost_types::Struct) -> Metadata {
    context
        .fields
        .iter()
        .filter_map(|(key, value)| {
            let value = match value.kind.as_ref()? {
                prost_types::value::Kind::StringValue(s) => MetadataValue::String(s.clone()),
                prost_types::value::Kind::NumberValue(n) => MetadataValue::Number(*n),
                prost_types::value::Kind::BoolValue(b) => MetadataValue::Boolean(*b),
                // Nested values are not representable as flag metadata.
                _ => return None,
            };
            Some((key.clone(), value))
        })
        .collect()
}
