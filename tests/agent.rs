//! Node agents driving a real (stand-in) daemon over a temp directory

#![cfg(unix)]

mod common;

use common::web_service;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tor_operator::agent::{rooted_paths, DaemonSpec, ServiceAgent, Supervisor};
use tor_operator::api::{HiddenService, ObjectKey};
use tor_operator::config::{Config, ReloadMode};
use tor_operator::controller::{Action, Reconciler};
use tor_operator::crypto::OnionIdentity;
use tor_operator::store::{Api, ClusterApi, MemoryStore};

struct Fixture {
    _dir: TempDir,
    config: Arc<Config>,
    client: Arc<dyn ClusterApi>,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
    address: String,
}

/// Mount an identity and a hashed password the way the workload would
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    rooted_paths(&mut config, dir.path());

    let identity = OnionIdentity::from_seed(&[9u8; 32]);
    let agent = &config.agent;
    std::fs::create_dir_all(&agent.key_dir).unwrap();
    std::fs::write(
        agent.key_dir.join("hostname"),
        format!("{}\n", identity.onion_address()),
    )
    .unwrap();
    std::fs::write(agent.key_dir.join("hs_ed25519_secret_key"), identity.private_key_file()).unwrap();
    std::fs::write(agent.key_dir.join("hs_ed25519_public_key"), identity.public_key_file()).unwrap();
    std::fs::create_dir_all(&agent.control_dir).unwrap();
    std::fs::write(agent.control_dir.join("hashedControl"), "16:00AABB\n").unwrap();

    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::spawn(
        DaemonSpec {
            name: "tor".to_string(),
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            reload: ReloadMode::Restart,
            restart_delay: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        },
        shutdown.clone(),
    );

    Fixture {
        _dir: dir,
        config: Arc::new(config),
        client: Arc::new(MemoryStore::new()),
        supervisor: Arc::new(supervisor),
        shutdown,
        address: identity.onion_address(),
    }
}

#[tokio::test]
async fn test_service_agent_renders_starts_and_reports() {
    let fx = fixture();
    let services: Api<HiddenService> = Api::namespaced(fx.client.clone(), "default");
    services.create(web_service("default", "web")).await.unwrap();

    let agent = ServiceAgent::new(fx.client.clone(), fx.config.clone(), fx.supervisor.clone());
    let key = ObjectKey::new("default", "web");
    assert_eq!(agent.reconcile(&key).await.unwrap(), Action::Done);

    let paths = &fx.config.agent;
    let torrc = std::fs::read_to_string(&paths.torrc_path).unwrap();
    assert!(torrc.contains("HashedControlPassword 16:00AABB\n"));
    assert!(torrc.contains("HiddenServicePort 80 web-backend:8080\n"));
    assert!(paths.service_dir.join("hs_ed25519_secret_key").exists());
    assert_eq!(fx.supervisor.status().starts, 1);

    let hs = services.get("web").await.unwrap();
    assert_eq!(hs.status.hostname, fx.address);

    // Nothing changed: no reload, no status write
    agent.reconcile(&key).await.unwrap();
    assert_eq!(fx.supervisor.status().starts, 1);
    let again = services.get("web").await.unwrap();
    assert_eq!(
        again.metadata.resource_version,
        hs.metadata.resource_version
    );

    let mut updated = again;
    updated.spec.extra_config = Some("Log notice stdout".to_string());
    services.update(updated).await.unwrap();
    agent.reconcile(&key).await.unwrap();
    assert_eq!(fx.supervisor.status().starts, 2);
    let torrc = std::fs::read_to_string(&paths.torrc_path).unwrap();
    assert!(torrc.ends_with("Log notice stdout\n"));

    fx.shutdown.cancel();
}

#[tokio::test]
async fn test_service_agent_writes_ob_config_for_backends() {
    let fx = fixture();
    let services: Api<HiddenService> = Api::namespaced(fx.client.clone(), "default");
    let mut hs = web_service("default", "shop-tor-obb-1");
    hs.spec.master_address = Some("master.onion".to_string());
    services.create(hs).await.unwrap();

    let agent = ServiceAgent::new(fx.client.clone(), fx.config.clone(), fx.supervisor.clone());
    agent
        .reconcile(&ObjectKey::new("default", "shop-tor-obb-1"))
        .await
        .unwrap();

    let paths = &fx.config.agent;
    let ob_config = std::fs::read_to_string(paths.service_dir.join("ob_config")).unwrap();
    assert_eq!(ob_config, "MasterOnionAddress master.onion\n");
    let torrc = std::fs::read_to_string(&paths.torrc_path).unwrap();
    assert!(torrc.contains("HiddenServiceOnionbalanceInstance 1\n"));

    fx.shutdown.cancel();
}

#[tokio::test]
async fn test_missing_resource_is_a_no_op() {
    let fx = fixture();
    let agent = ServiceAgent::new(fx.client.clone(), fx.config.clone(), fx.supervisor.clone());
    let action = agent.reconcile(&ObjectKey::new("default", "gone")).await.unwrap();
    assert_eq!(action, Action::Done);
    assert_eq!(fx.supervisor.status().starts, 0);
    fx.shutdown.cancel();
}
