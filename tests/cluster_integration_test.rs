//! Two-instance cluster tests over real listeners.
//!
//! Boots two full instances (replicated metadata store, localfs backends,
//! peer proxy) on ephemeral ports, joins the second to the first and
//! exercises leader forwarding, replication convergence, cross-instance
//! conflicts and transparent peer-proxy reads.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use callfs::api::{build_router, AppState};
use callfs::auth::{AllowConfiguredUsers, Authenticator};
use callfs::backends::{BackendSet, LocalFsBackend, NoopBackend, PeerProxyBackend};
use callfs::cache::{CacheConfig, MetadataCache};
use callfs::cluster::{
    ClusterMetadataStore, JoinRequest, PeerInfo, RaftClient, RaftLogStore, RaftNode, RaftOptions,
    StateMachine,
};
use callfs::core::BackendKind;
use callfs::engine::{Engine, EngineConfig};
use callfs::links::LinkManager;
use callfs::locks::LocalLockManager;
use callfs::metadata::SharedMetadataStore;

const API_KEY: &str = "alice-key";
const INTERNAL_SECRET: &str = "cluster-internal-secret";

struct Instance {
    addr: String,
    node: Arc<RaftNode>,
    engine: Arc<Engine>,
    client: Arc<RaftClient>,
    _dirs: Vec<tempfile::TempDir>,
    _shutdown: watch::Sender<bool>,
}

async fn bind() -> (tokio::net::TcpListener, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    (listener, addr)
}

/// Raft tuning: the bootstrap node campaigns fast, the joiner never
/// campaigns during the test window.
fn raft_options(
    node_id: &str,
    addr: &str,
    bootstrap: bool,
    seed: BTreeMap<String, PeerInfo>,
) -> RaftOptions {
    let election = if bootstrap {
        (Duration::from_millis(100), Duration::from_millis(200))
    } else {
        (Duration::from_secs(60), Duration::from_secs(120))
    };
    RaftOptions {
        node_id: node_id.to_string(),
        raft_addr: addr.to_string(),
        api_endpoint: addr.to_string(),
        bootstrap,
        heartbeat_interval: Duration::from_millis(100),
        election_timeout_min: election.0,
        election_timeout_max: election.1,
        apply_timeout: Duration::from_secs(5),
        snapshot_threshold: 4096,
        snapshot_interval: Duration::from_secs(3600),
        retain_snapshot_count: 2,
        max_append_entries: 32,
        seed_peers: seed,
    }
}

async fn spawn_instance(
    listener: tokio::net::TcpListener,
    addr: String,
    node_id: &str,
    bootstrap: bool,
    raft_seed: BTreeMap<String, PeerInfo>,
    peer_endpoints: HashMap<String, String>,
) -> Instance {
    let raft_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    let log_store = Arc::new(RaftLogStore::open(raft_dir.path()).unwrap());
    let state_machine = Arc::new(StateMachine::new());
    let client = Arc::new(
        RaftClient::new(INTERNAL_SECRET.to_string(), Duration::from_secs(3)).unwrap(),
    );
    let options = raft_options(node_id, &addr, bootstrap, raft_seed);
    let node = RaftNode::new(options, log_store, state_machine, Arc::clone(&client)).unwrap();

    let store: SharedMetadataStore = Arc::new(ClusterMetadataStore::new(
        Arc::clone(&node),
        Arc::clone(&client),
    ));

    let mut backends = BackendSet::new(
        BackendKind::Localfs,
        Arc::new(
            PeerProxyBackend::new(peer_endpoints.clone(), INTERNAL_SECRET.to_string(), false)
                .unwrap(),
        ),
    );
    backends.register(
        BackendKind::Localfs,
        Arc::new(LocalFsBackend::new(data_dir.path().to_path_buf(), node_id.to_string()).unwrap()),
    );
    backends.register(
        BackendKind::ObjectStore,
        Arc::new(NoopBackend::new("object_store")),
    );

    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        backends,
        Arc::new(MetadataCache::new(CacheConfig::default())),
        Arc::new(LocalLockManager::default()),
        EngineConfig {
            instance_id: node_id.to_string(),
            replication_enabled: false,
            replica_backend: None,
            require_replica_success: false,
        },
    ));

    let links = Arc::new(LinkManager::new(Arc::clone(&store), "cluster-link-secret"));

    let mut keys = HashMap::new();
    keys.insert(API_KEY.to_string(), "alice".to_string());
    let authenticator = Arc::new(Authenticator::new(keys, INTERNAL_SECRET.to_string()));

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        links,
        authenticator,
        authorizer: Arc::new(AllowConfiguredUsers),
        raft: Some(Arc::clone(&node)),
        raft_client: Some(Arc::clone(&client)),
        external_url: addr.clone(),
        peer_endpoints,
    });
    let router = build_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Arc::clone(&node).start(shutdown_rx);

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Instance {
        addr,
        node,
        engine,
        client,
        _dirs: vec![raft_dir, data_dir],
        _shutdown: shutdown_tx,
    }
}

/// Poll `probe` until it returns true or the deadline passes.
async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Boot a two-node cluster: node-1 leads, node-2 is joined, the root is
/// replicated and both proxies know each other's endpoint.
async fn two_node_cluster() -> (Instance, Instance) {
    let (listener1, addr1) = bind().await;
    let (listener2, addr2) = bind().await;

    let mut peers_of_1 = HashMap::new();
    peers_of_1.insert("node-2".to_string(), addr2.clone());
    let node1 = spawn_instance(
        listener1,
        addr1.clone(),
        "node-1",
        true,
        BTreeMap::new(),
        peers_of_1,
    )
    .await;

    let mut seed = BTreeMap::new();
    seed.insert(
        "node-1".to_string(),
        PeerInfo {
            raft_addr: addr1.clone(),
            api_endpoint: addr1.clone(),
        },
    );
    let mut peers_of_2 = HashMap::new();
    peers_of_2.insert("node-1".to_string(), addr1.clone());
    let node2 = spawn_instance(listener2, addr2, "node-2", false, seed, peers_of_2).await;

    // node-1 must lead before anything else happens.
    let leader = Arc::clone(&node1.node);
    wait_for("node-1 leadership", Duration::from_secs(5), move || {
        let leader = Arc::clone(&leader);
        async move { leader.is_leader().await }
    })
    .await;
    node1.engine.ensure_root().await.unwrap();

    // Admit node-2; the join can race the first elections, so retry.
    let request = JoinRequest {
        node_id: "node-2".to_string(),
        raft_addr: node2.addr.clone(),
        api_endpoint: node2.addr.clone(),
    };
    let mut joined = false;
    for _ in 0..20 {
        if node2.client.join(&node1.addr, &request).await.is_ok() {
            joined = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(joined, "node-2 failed to join the cluster");

    // Replication must deliver the root record and a known leader.
    let follower = Arc::clone(&node2.node);
    wait_for(
        "root replication to node-2",
        Duration::from_secs(5),
        move || {
            let follower = Arc::clone(&follower);
            async move {
                follower.current_leader().await.as_deref() == Some("node-1")
                    && follower.state_machine().get("/").is_ok()
            }
        },
    )
    .await;

    (node1, node2)
}

#[tokio::test]
async fn test_write_on_leader_replicates_to_follower() {
    let (node1, node2) = two_node_cluster().await;

    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/v1/files/k.txt", node1.addr))
        .bearer_auth(API_KEY)
        .body("owned by node-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let follower = Arc::clone(&node2.node);
    wait_for("k.txt replication", Duration::from_secs(5), move || {
        let follower = Arc::clone(&follower);
        async move { follower.state_machine().get("/k.txt").is_ok() }
    })
    .await;

    // After quiescence the in-memory state mappings agree.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        node1.node.state_machine().maps(),
        node2.node.state_machine().maps()
    );

    let replicated = node2.node.state_machine().get("/k.txt").unwrap();
    assert_eq!(replicated.instance_id.as_deref(), Some("node-1"));
}

#[tokio::test]
async fn test_cross_instance_post_conflicts_with_owner_details() {
    let (node1, node2) = two_node_cluster().await;

    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/v1/files/k.txt", node1.addr))
        .bearer_auth(API_KEY)
        .body("original")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let follower = Arc::clone(&node2.node);
    wait_for("replication", Duration::from_secs(5), move || {
        let follower = Arc::clone(&follower);
        async move { follower.state_machine().get("/k.txt").is_ok() }
    })
    .await;

    // node-2 knows the file belongs to node-1 and refuses the POST.
    let response = http
        .post(format!("{}/v1/files/k.txt", node2.addr))
        .bearer_auth(API_KEY)
        .body("usurper")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["instance_id"], "node-1");
    assert_eq!(body["existing_path"], "/k.txt");
    assert!(body["suggestion"].as_str().unwrap().contains("PUT"));
    assert!(body["update_url"]
        .as_str()
        .unwrap()
        .contains("/v1/files/k.txt"));
}

#[tokio::test]
async fn test_follower_write_forwards_to_leader() {
    let (node1, node2) = two_node_cluster().await;

    // POST on the follower: metadata forwards to the leader, bytes stay on
    // node-2's local backend.
    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/v1/files/from-follower.txt", node2.addr))
        .bearer_auth(API_KEY)
        .body("written via node-2")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    // The leader sees the committed record immediately.
    let inode = node1
        .node
        .state_machine()
        .get("/from-follower.txt")
        .unwrap();
    assert_eq!(inode.instance_id.as_deref(), Some("node-2"));
    assert_eq!(inode.size_bytes, 18);

    // Reading through the follower serves the local bytes.
    let response = http
        .get(format!("{}/v1/files/from-follower.txt", node2.addr))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "written via node-2");
}

#[tokio::test]
async fn test_read_proxies_to_owning_instance() {
    let (node1, node2) = two_node_cluster().await;

    // Bytes land on node-2; node-1 only ever sees the metadata.
    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/v1/files/remote-read.txt", node2.addr))
        .bearer_auth(API_KEY)
        .body("bytes on node-2")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let leader = Arc::clone(&node1.node);
    wait_for("metadata on leader", Duration::from_secs(5), move || {
        let leader = Arc::clone(&leader);
        async move { leader.state_machine().get("/remote-read.txt").is_ok() }
    })
    .await;

    // A GET landing on node-1 streams through the peer proxy from node-2.
    let response = http
        .get(format!("{}/v1/files/remote-read.txt", node1.addr))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "bytes on node-2");

    // HEAD on node-1 answers from committed metadata with owner attribution.
    let response = http
        .head(format!("{}/v1/files/remote-read.txt", node1.addr))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-callfs-instance-id")
            .unwrap()
            .to_str()
            .unwrap(),
        "node-2"
    );
}
