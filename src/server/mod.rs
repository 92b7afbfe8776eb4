//! Server assembly and lifecycle.
//!
//! Builds stores, backends, the engine and the link manager from the
//! validated configuration, spawns the background tasks (cache sweeper,
//! link reaper, raft loops), performs the initialization ordering around
//! root-directory creation, then serves the router until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::api::{build_router, AppState};
use crate::auth::{AllowConfiguredUsers, Authenticator, SharedAuthorizer};
use crate::backends::{
    BackendSet, LocalFsBackend, NoopBackend, ObjectStoreBackend, PeerProxyBackend, SharedStorage,
};
use crate::cache::{CacheConfig, MetadataCache};
use crate::cluster::{
    ClusterMetadataStore, JoinRequest, RaftClient, RaftLogStore, RaftNode, RaftOptions,
    StateMachine,
};
use crate::config::Config;
use crate::core::{BackendKind, FsError, FsResult};
use crate::engine::{Engine, EngineConfig};
use crate::links::LinkManager;
use crate::locks::{LocalLockManager, RedisLockManager, SharedLockManager};
use crate::metadata::{
    MemoryMetadataStore, SharedMetadataStore, SledMetadataStore, SqlMetadataStore,
};

/// How long a bootstrap node waits to lead before root creation.
const LEADERSHIP_WAIT: Duration = Duration::from_secs(10);

/// The assembled service.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let authenticator = Arc::new(Authenticator::new(
            config.auth.parsed_keys()?,
            config.auth.internal_proxy_secret.clone(),
        ));
        let authorizer: SharedAuthorizer = Arc::new(AllowConfiguredUsers);

        // Metadata store (plus the raft node when replicated).
        let (store, raft, raft_client) = build_metadata_store(&config).await?;

        // Storage backends.
        let backends = build_backends(&config)?;
        let default_kind = backends.default_kind;

        // Lock manager.
        let locks = build_lock_manager(&config).await?;

        // Cache with its background sweep.
        let cache = Arc::new(MetadataCache::new(CacheConfig::default()));
        let sweeper = Arc::clone(&cache).spawn_sweeper(shutdown_rx.clone());

        let replica_backend = match config.ha.replica_backend.as_deref() {
            Some(tag) => Some(BackendKind::parse(tag).ok_or_else(|| {
                FsError::InvalidInput(format!("unknown replica backend {tag:?}"))
            })?),
            None => None,
        };

        let engine = Arc::new(Engine::new(
            Arc::clone(&store),
            backends,
            Arc::clone(&cache),
            locks,
            EngineConfig {
                instance_id: config.instance_discovery.instance_id.clone(),
                replication_enabled: config.ha.replication_enabled,
                replica_backend,
                require_replica_success: config.ha.require_replica_success,
            },
        ));

        let links = Arc::new(LinkManager::new(
            Arc::clone(&store),
            &config.auth.single_use_link_secret,
        ));
        let reaper = Arc::clone(&links).spawn_reaper(shutdown_rx.clone());

        // Cluster lifecycle: start raft, then settle the root directory.
        if let Some(node) = &raft {
            Arc::clone(node).start(shutdown_rx.clone());

            let replicated = &config.metadata_store.replicated_log;
            if replicated.bootstrap {
                if node.wait_for_leadership(LEADERSHIP_WAIT).await {
                    engine.ensure_root().await?;
                } else {
                    tracing::warn!(
                        "bootstrap node did not take leadership within {LEADERSHIP_WAIT:?}; \
                         skipping root creation"
                    );
                }
            } else if !replicated.api_peer_endpoints.is_empty() {
                spawn_cluster_join(
                    Arc::clone(node),
                    raft_client.clone().expect("raft client exists with raft"),
                    replicated.api_peer_endpoints.values().cloned().collect(),
                    config.server.external_url.clone(),
                );
            }
        } else {
            engine.ensure_root().await?;
        }

        if config.server.enable_quic {
            tracing::warn!("enable_quic is set but this build serves HTTP/1.1 only");
        }
        if config.server.protocol != "http" {
            tracing::warn!(
                protocol = %config.server.protocol,
                "TLS terminates in front of the service; serving plain HTTP"
            );
        }
        tracing::info!(
            instance_id = %config.instance_discovery.instance_id,
            backend = %default_kind.as_str(),
            store = %config.metadata_store.store_type,
            "callfs assembled"
        );

        let state = Arc::new(AppState {
            engine,
            links,
            authenticator,
            authorizer,
            raft,
            raft_client,
            external_url: config.server.external_url.clone(),
            peer_endpoints: config.instance_discovery.peer_endpoints.clone(),
        });
        let router = build_router(state);

        let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
        tracing::info!(addr = %config.server.listen_addr, "listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await?;

        // Stop the background tasks and let them wind down.
        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            let _ = sweeper.await;
            let _ = reaper.await;
        })
        .await;

        Ok(())
    }
}

/// Pick and build the metadata store per configuration.
async fn build_metadata_store(
    config: &Config,
) -> FsResult<(
    SharedMetadataStore,
    Option<Arc<RaftNode>>,
    Option<Arc<RaftClient>>,
)> {
    match config.metadata_store.store_type.as_str() {
        "memory" => Ok((Arc::new(MemoryMetadataStore::new()), None, None)),
        "relational" => {
            let url = config
                .metadata_store
                .database_url
                .as_deref()
                .ok_or_else(|| FsError::InvalidInput("database_url missing".to_string()))?;
            Ok((Arc::new(SqlMetadataStore::connect(url).await?), None, None))
        }
        "embedded" => {
            let dir = config
                .metadata_store
                .data_dir
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from("./callfs-metadata"));
            Ok((Arc::new(SledMetadataStore::open(&dir)?), None, None))
        }
        "replicated_log" => {
            let replicated = &config.metadata_store.replicated_log;
            let log_store = Arc::new(RaftLogStore::open(&replicated.data_dir)?);
            let state_machine = Arc::new(StateMachine::new());
            let client = Arc::new(RaftClient::new(
                config.auth.internal_proxy_secret.clone(),
                replicated.forward_timeout(),
            )?);
            // Raft RPC rides the public listener, so peers address this
            // node at its external URL.
            let options = RaftOptions::from_config(
                replicated,
                config.server.external_url.clone(),
                config.server.external_url.clone(),
            );
            let node = RaftNode::new(options, log_store, state_machine, Arc::clone(&client))?;
            let store = Arc::new(ClusterMetadataStore::new(
                Arc::clone(&node),
                Arc::clone(&client),
            ));
            Ok((store, Some(node), Some(client)))
        }
        other => Err(FsError::InvalidInput(format!(
            "unknown metadata store type {other:?}"
        ))),
    }
}

/// Register the configured drivers into a backend set.
fn build_backends(config: &Config) -> FsResult<BackendSet> {
    let default_kind = BackendKind::parse(&config.backend.default_backend).ok_or_else(|| {
        FsError::InvalidInput(format!(
            "unknown default backend {:?}",
            config.backend.default_backend
        ))
    })?;

    let proxy: SharedStorage = Arc::new(PeerProxyBackend::new(
        config.instance_discovery.peer_endpoints.clone(),
        config.auth.internal_proxy_secret.clone(),
        config.backend.peer_skip_tls_verify,
    )?);

    let mut backends = BackendSet::new(default_kind, proxy);
    backends.register(
        BackendKind::Localfs,
        Arc::new(LocalFsBackend::new(
            config.backend.localfs_root_path.clone(),
            config.instance_discovery.instance_id.clone(),
        )?),
    );
    if config.backend.object_store.enabled {
        backends.register(
            BackendKind::ObjectStore,
            Arc::new(ObjectStoreBackend::new(config.backend.object_store.clone())?),
        );
    } else {
        backends.register(
            BackendKind::ObjectStore,
            Arc::new(NoopBackend::new("object_store")),
        );
    }
    Ok(backends)
}

async fn build_lock_manager(config: &Config) -> FsResult<SharedLockManager> {
    match config.lock_manager.manager_type.as_str() {
        "local" => Ok(Arc::new(LocalLockManager::default())),
        "redis" => {
            let addr = config
                .lock_manager
                .redis_addr
                .as_deref()
                .ok_or_else(|| FsError::InvalidInput("redis_addr missing".to_string()))?;
            let manager = RedisLockManager::connect(
                addr,
                config.lock_manager.redis_password.as_deref(),
                Duration::from_secs(config.lock_manager.lease_secs),
            )
            .await?;
            Ok(Arc::new(manager))
        }
        other => Err(FsError::InvalidInput(format!(
            "unknown lock manager type {other:?}"
        ))),
    }
}

/// Keep asking known peers to admit this node until one leader accepts.
fn spawn_cluster_join(
    node: Arc<RaftNode>,
    client: Arc<RaftClient>,
    endpoints: Vec<String>,
    own_endpoint: String,
) {
    tokio::spawn(async move {
        let request = JoinRequest {
            node_id: node.node_id().to_string(),
            raft_addr: own_endpoint.clone(),
            api_endpoint: own_endpoint,
        };
        for attempt in 0..12u32 {
            for endpoint in &endpoints {
                match client.join(endpoint, &request).await {
                    Ok(response) => {
                        tracing::info!(
                            leader = %response.leader_id,
                            "joined the cluster"
                        );
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(endpoint = %endpoint, error = %err, "join attempt failed");
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            if attempt == 11 {
                tracing::warn!("giving up on cluster join; still serving reads");
            }
        }
    });
}
