//! End-to-end service flows: initialization, agent registration, resolution,
//! failure atomicity, and restart recovery.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use haxen_common::paths::{haxen_server_id_for, HaxenDirs};

use haxen_common::{
    AgentDIDRecord, AgentDIDStatus, AgentSummary, ComponentType, DIDConfig, HaxenServerIdentity,
    IdentityKind, PublicKeyJwk,
};
use haxen_did::{DIDError, DIDRegistry, DIDService};
use haxen_keystore::LocalKeystore;
use haxen_storage::{
    ComponentDIDRequest, LocalStorage, StorageError, StorageProvider, StorageResult,
};

#[tokio::test]
async fn register_agent_mints_identity_package() {
    let env = common::setup_initialized("haxen-test").await;

    let package = env
        .service
        .register_agent(&common::alpha_registration())
        .await
        .expect("register agent");

    let agent = &package.agent_did;
    assert_eq!(agent.agent_node_id, "agent-alpha");
    assert!(agent.did.starts_with("did:haxen:haxen-test:agent:"));
    assert_eq!(agent.status, AgentDIDStatus::Pending);
    assert_eq!(agent.components.len(), 2);

    let reasoner = &package.reasoner_dids["reasoner.fn"];
    assert!(reasoner.did.starts_with("did:haxen:haxen-test:reasoner:"));
    let skill = &package.skill_dids["skill.fn"];
    assert!(skill.did.starts_with("did:haxen:haxen-test:skill:"));

    // Components are derived after the agent, in request order.
    assert!(reasoner.derivation_index > agent.derivation_index);
    assert!(skill.derivation_index > reasoner.derivation_index);

    // Registry and listing views agree.
    let snapshot = env.registry.get_registry("haxen-test").expect("registry");
    assert!(snapshot.agent_nodes.contains_key("agent-alpha"));

    let listed = env.storage.list_agent_dids().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].component_count, 2);

    // Every minted DID resolves back to its record.
    for (did, kind) in [
        (&agent.did, IdentityKind::Agent),
        (&reasoner.did, IdentityKind::Reasoner),
        (&skill.did, IdentityKind::Skill),
    ] {
        let resolved = env.service.resolve_did(did).await.expect("resolve");
        assert_eq!(&resolved.did, did);
        assert_eq!(resolved.kind, kind);
        assert_eq!(resolved.agent_node_id, "agent-alpha");
    }
}

#[tokio::test]
async fn registration_requires_initialized_server() {
    let env = common::setup().await;

    assert!(matches!(
        env.service.validate_haxen_server_registry(),
        Err(DIDError::RegistryNotInitialized)
    ));
    assert!(matches!(
        env.service.register_agent(&common::alpha_registration()).await,
        Err(DIDError::RegistryNotInitialized)
    ));

    env.service.initialize("haxen-test").await.expect("initialize");
    env.service
        .validate_haxen_server_registry()
        .expect("validated after initialize");

    let registry = env.registry.get_registry("haxen-test").expect("registry");
    assert_eq!(registry.root_did, "did:haxen:haxen-test");
    assert_eq!(registry.created_at, registry.last_key_rotation);
}

#[tokio::test]
async fn duplicate_agent_registration_is_rejected() {
    let env = common::setup_initialized("haxen-test").await;
    env.service
        .register_agent(&common::alpha_registration())
        .await
        .expect("first registration");

    match env.service.register_agent(&common::alpha_registration()).await {
        Err(DIDError::DuplicateAgent(node)) => assert_eq!(node, "agent-alpha"),
        other => panic!("expected duplicate agent error, got {:?}", other.map(|p| p.agent_did.did)),
    }
}

#[tokio::test]
async fn derivation_indices_are_monotonic_across_registrations() {
    let env = common::setup_initialized("haxen-test").await;

    let first = env
        .service
        .register_agent(&common::alpha_registration())
        .await
        .expect("first");
    let mut request = common::alpha_registration();
    request.agent_node_id = "agent-beta".to_string();
    let second = env.service.register_agent(&request).await.expect("second");

    let max_first = first
        .agent_did
        .components
        .iter()
        .map(|c| c.derivation_index)
        .max()
        .unwrap_or(first.agent_did.derivation_index);
    assert!(second.agent_did.derivation_index > max_first);

    // Distinct paths mean distinct DIDs everywhere.
    assert_ne!(first.agent_did.did, second.agent_did.did);
    assert_ne!(
        first.reasoner_dids["reasoner.fn"].did,
        second.reasoner_dids["reasoner.fn"].did
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_registrations_get_disjoint_indices() {
    let env = common::setup_initialized("haxen-test").await;

    let mut handles = Vec::new();
    for n in 0..16 {
        let service = env.service.clone();
        handles.push(tokio::spawn(async move {
            let mut request = common::alpha_registration();
            request.agent_node_id = format!("agent-{:02}", n);
            service.register_agent(&request).await
        }));
    }

    // Each registration consumes an agent index plus one per component; no
    // index may ever be handed to two registrations.
    let mut seen = HashSet::new();
    for handle in handles {
        let package = handle.await.expect("join").expect("register");
        assert!(seen.insert(package.agent_did.derivation_index));
        for component in &package.agent_did.components {
            assert!(seen.insert(component.derivation_index));
        }
    }
    assert_eq!(seen.len(), 16 * 3);

    let snapshot = env.registry.get_registry("haxen-test").expect("registry");
    assert_eq!(snapshot.agent_nodes.len(), 16);
}

#[tokio::test]
async fn initialize_for_derives_server_id_from_installation_path() {
    let env = common::setup().await;
    let dirs = HaxenDirs::new(env.home.path());

    env.service.initialize_for(&dirs).await.expect("initialize");

    assert_eq!(
        env.service.active_server().expect("active server"),
        haxen_server_id_for(env.home.path())
    );
    env.service
        .validate_haxen_server_registry()
        .expect("validated");
}

/// Delegating provider that can be switched to fail agent persistence, for
/// exercising the failure path of a registration.
struct FlakyStorage {
    inner: Arc<LocalStorage>,
    fail_writes: AtomicBool,
}

#[async_trait]
impl StorageProvider for FlakyStorage {
    async fn store_haxen_server_did(&self, identity: &HaxenServerIdentity) -> StorageResult<()> {
        self.inner.store_haxen_server_did(identity).await
    }

    async fn load_haxen_server_dids(&self) -> StorageResult<Vec<HaxenServerIdentity>> {
        self.inner.load_haxen_server_dids().await
    }

    async fn store_agent_did_with_components(
        &self,
        agent_node_id: &str,
        agent_did: &str,
        haxen_server_id: &str,
        public_key_jwk: &PublicKeyJwk,
        derivation_index: u64,
        status: AgentDIDStatus,
        components: &[ComponentDIDRequest],
    ) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::TransactionFailed(
                "injected write failure".to_string(),
            ));
        }
        self.inner
            .store_agent_did_with_components(
                agent_node_id,
                agent_did,
                haxen_server_id,
                public_key_jwk,
                derivation_index,
                status,
                components,
            )
            .await
    }

    async fn load_agent_dids(&self, haxen_server_id: &str) -> StorageResult<Vec<AgentDIDRecord>> {
        self.inner.load_agent_dids(haxen_server_id).await
    }

    async fn list_agent_dids(&self) -> StorageResult<Vec<AgentSummary>> {
        self.inner.list_agent_dids().await
    }

    async fn update_agent_did_status(
        &self,
        haxen_server_id: &str,
        agent_node_id: &str,
        status: AgentDIDStatus,
    ) -> StorageResult<()> {
        self.inner
            .update_agent_did_status(haxen_server_id, agent_node_id, status)
            .await
    }

    async fn allocate_derivation_indices(
        &self,
        haxen_server_id: &str,
        count: u64,
    ) -> StorageResult<u64> {
        self.inner
            .allocate_derivation_indices(haxen_server_id, count)
            .await
    }
}

#[tokio::test]
async fn failed_registration_leaves_no_trace_and_burns_indices() {
    let home = tempfile::TempDir::new().expect("temp dir");
    let local = Arc::new(LocalStorage::open(&common::storage_config(&home)).expect("open storage"));
    let flaky = Arc::new(FlakyStorage {
        inner: local,
        fail_writes: AtomicBool::new(false),
    });

    let registry = Arc::new(DIDRegistry::new(flaky.clone()));
    registry.initialize().await.expect("initialize registry");
    let keystore_cfg = common::keystore_config(&home);
    let keystore = Arc::new(LocalKeystore::new(&keystore_cfg).expect("keystore"));
    let service = Arc::new(DIDService::new(
        DIDConfig {
            enabled: true,
            keystore: keystore_cfg,
        },
        keystore,
        registry.clone(),
    ));
    service.initialize("haxen-test").await.expect("initialize");

    flaky.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(
        service.register_agent(&common::alpha_registration()).await,
        Err(DIDError::Storage(StorageError::TransactionFailed(_)))
    ));

    // Nothing partial is visible: no agent in the cache, no component lookup.
    let snapshot = registry.get_registry("haxen-test").expect("registry");
    assert!(snapshot.agent_nodes.is_empty());
    assert!(matches!(
        registry.find_did_by_component("haxen-test", ComponentType::Skill, "skill.fn"),
        Err(DIDError::NotFound(_))
    ));

    // A retry succeeds, on fresh indices: the failed attempt's reservations
    // are consumed, never reissued.
    flaky.fail_writes.store(false, Ordering::SeqCst);
    let package = service
        .register_agent(&common::alpha_registration())
        .await
        .expect("retry");
    assert!(package.agent_did.derivation_index >= 3);
}

#[tokio::test]
async fn restart_reloads_identities_and_continues_counter() {
    let home = tempfile::TempDir::new().expect("temp dir");
    let keystore_cfg = common::keystore_config(&home);

    let first_agent_did;
    {
        let storage = Arc::new(LocalStorage::open(&common::storage_config(&home)).expect("open"));
        let registry = Arc::new(DIDRegistry::new(storage));
        registry.initialize().await.expect("initialize");
        let keystore = Arc::new(LocalKeystore::new(&keystore_cfg).expect("keystore"));
        let service = Arc::new(DIDService::new(
            DIDConfig {
                enabled: true,
                keystore: keystore_cfg.clone(),
            },
            keystore,
            registry,
        ));
        service.initialize("haxen-test").await.expect("initialize");
        let package = service
            .register_agent(&common::alpha_registration())
            .await
            .expect("register");
        first_agent_did = package.agent_did.did.clone();
    }

    // Same home, fresh process.
    let storage = Arc::new(LocalStorage::open(&common::storage_config(&home)).expect("reopen"));
    let registry = Arc::new(DIDRegistry::new(storage));
    registry.initialize().await.expect("re-initialize");
    let keystore = Arc::new(LocalKeystore::new(&keystore_cfg).expect("keystore"));
    let service = Arc::new(DIDService::new(
        DIDConfig {
            enabled: true,
            keystore: keystore_cfg,
        },
        keystore,
        registry,
    ));
    service.initialize("haxen-test").await.expect("adopt existing server");

    let resolved = service.resolve_did(&first_agent_did).await.expect("resolve");
    assert_eq!(resolved.agent_node_id, "agent-alpha");

    let mut request = common::alpha_registration();
    request.agent_node_id = "agent-beta".to_string();
    let package = service.register_agent(&request).await.expect("register after restart");
    // Counter picked up where the first process left it.
    assert!(package.agent_did.derivation_index >= 3);
    assert_ne!(package.agent_did.did, first_agent_did);
}

#[tokio::test]
async fn rotate_server_key_updates_rotation_timestamp_only() {
    let env = common::setup_initialized("haxen-test").await;
    let package = env
        .service
        .register_agent(&common::alpha_registration())
        .await
        .expect("register");
    let before = env.registry.get_registry("haxen-test").expect("registry");

    env.service.rotate_server_key().await.expect("rotate");

    let after = env.registry.get_registry("haxen-test").expect("registry");
    assert_eq!(after.created_at, before.created_at);
    assert!(after.last_key_rotation > before.last_key_rotation);
    // Existing agent records are untouched by rotation.
    assert!(after.agent_nodes.contains_key("agent-alpha"));
    let resolved = env
        .service
        .resolve_did(&package.agent_did.did)
        .await
        .expect("resolve after rotation");
    assert_eq!(resolved.kind, IdentityKind::Agent);
}
