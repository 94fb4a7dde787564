#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use haxen_common::{
    AgentDIDStatus, DIDConfig, DIDRegistrationRequest, KeystoreConfig, LocalStorageConfig,
    ReasonerDefinition, SkillDefinition,
};
use haxen_did::{DIDRegistry, DIDService};
use haxen_keystore::LocalKeystore;
use haxen_storage::{LocalStorage, StorageProvider};

pub struct TestEnv {
    pub home: TempDir,
    pub storage: Arc<LocalStorage>,
    pub registry: Arc<DIDRegistry>,
    pub service: Arc<DIDService>,
    pub keystore: Arc<LocalKeystore>,
}

pub fn keystore_config(home: &TempDir) -> KeystoreConfig {
    KeystoreConfig {
        path: home.path().join("keys"),
        kind: "local".to_string(),
    }
}

pub fn storage_config(home: &TempDir) -> LocalStorageConfig {
    LocalStorageConfig {
        database_path: home.path().join("haxen.db"),
    }
}

/// Build a full stack over a temp directory. The registry is initialized,
/// the service is not.
pub async fn setup() -> TestEnv {
    let home = TempDir::new().expect("temp dir");

    let storage = Arc::new(LocalStorage::open(&storage_config(&home)).expect("open storage"));
    let provider: Arc<dyn StorageProvider> = storage.clone();
    let registry = Arc::new(DIDRegistry::new(provider));
    registry.initialize().await.expect("initialize registry");

    let keystore_cfg = keystore_config(&home);
    let keystore = Arc::new(LocalKeystore::new(&keystore_cfg).expect("open keystore"));
    let config = DIDConfig {
        enabled: true,
        keystore: keystore_cfg,
    };
    let service = Arc::new(DIDService::new(config, keystore.clone(), registry.clone()));

    TestEnv {
        home,
        storage,
        registry,
        service,
        keystore,
    }
}

/// Build a full stack and initialize the service for `haxen_server_id`.
pub async fn setup_initialized(haxen_server_id: &str) -> TestEnv {
    let env = setup().await;
    env.service
        .initialize(haxen_server_id)
        .await
        .expect("initialize service");
    env
}

/// The registration request used across the service tests: one reasoner and
/// one tagged skill.
pub fn alpha_registration() -> DIDRegistrationRequest {
    DIDRegistrationRequest {
        agent_node_id: "agent-alpha".to_string(),
        reasoners: vec![ReasonerDefinition {
            id: "reasoner.fn".to_string(),
            tags: vec![],
        }],
        skills: vec![SkillDefinition {
            id: "skill.fn".to_string(),
            tags: vec!["analysis".to_string()],
        }],
        status: AgentDIDStatus::Pending,
    }
}
