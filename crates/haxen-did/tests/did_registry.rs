//! Registry behavior over pre-seeded storage: cache bootstrap, component
//! lookup, status updates, and listing.

mod common;

use chrono::Utc;

use haxen_common::{AgentDIDStatus, ComponentType, HaxenServerIdentity, PublicKeyJwk};
use haxen_did::{DIDError, DIDRegistry};
use haxen_storage::{ComponentDIDRequest, StorageProvider};

fn server_identity(haxen_server_id: &str) -> HaxenServerIdentity {
    let now = Utc::now();
    HaxenServerIdentity {
        haxen_server_id: haxen_server_id.to_string(),
        root_did: format!("did:haxen:{}", haxen_server_id),
        seed_ref: format!("root/{}", haxen_server_id),
        created_at: now,
        last_key_rotation: now,
    }
}

fn component_request(
    did: &str,
    component_type: ComponentType,
    name: &str,
    index: u64,
) -> ComponentDIDRequest {
    ComponentDIDRequest {
        component_did: did.to_string(),
        component_type,
        component_name: name.to_string(),
        public_key_jwk: PublicKeyJwk::ed25519("AA"),
        derivation_index: index,
    }
}

async fn seed_agent(
    storage: &dyn StorageProvider,
    haxen_server_id: &str,
    agent_node_id: &str,
    index: u64,
    components: &[ComponentDIDRequest],
) {
    storage
        .store_agent_did_with_components(
            agent_node_id,
            &format!("did:haxen:{}:agent:{}", haxen_server_id, index),
            haxen_server_id,
            &PublicKeyJwk::ed25519("AA"),
            index,
            AgentDIDStatus::Pending,
            components,
        )
        .await
        .expect("seed agent");
}

#[tokio::test]
async fn initialize_rebuilds_registry_from_storage() {
    let env = common::setup().await;
    env.storage
        .store_haxen_server_did(&server_identity("haxen-test"))
        .await
        .expect("store server");
    seed_agent(
        env.storage.as_ref(),
        "haxen-test",
        "agent-1",
        0,
        &[
            component_request("did:haxen:haxen-test:reasoner:1", ComponentType::Reasoner, "reasoner.fn", 1),
            component_request("did:haxen:haxen-test:skill:2", ComponentType::Skill, "skill.fn", 2),
        ],
    )
    .await;

    // Fresh registry over the same storage sees everything.
    let registry = DIDRegistry::new(env.storage.clone());
    registry.initialize().await.expect("initialize");

    let snapshot = registry.get_registry("haxen-test").expect("registry");
    assert_eq!(snapshot.haxen_server_id, "haxen-test");
    assert!(snapshot.agent_nodes.contains_key("agent-1"));
    assert_eq!(snapshot.agent_nodes["agent-1"].components.len(), 2);

    let reasoner = registry
        .find_did_by_component("haxen-test", ComponentType::Reasoner, "reasoner.fn")
        .expect("reasoner lookup");
    assert_eq!(reasoner.did, "did:haxen:haxen-test:reasoner:1");

    let skill = registry
        .find_did_by_component("haxen-test", ComponentType::Skill, "skill.fn")
        .expect("skill lookup");
    assert_eq!(skill.derivation_index, 2);
}

#[tokio::test]
async fn get_registry_unknown_server_is_not_found() {
    let env = common::setup().await;
    assert!(matches!(
        env.registry.get_registry("nowhere"),
        Err(DIDError::NotFound(_))
    ));
    assert!(matches!(
        env.registry
            .find_did_by_component("nowhere", ComponentType::Skill, "skill.fn"),
        Err(DIDError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_agent_status_persists_and_mirrors() {
    let env = common::setup().await;
    env.storage
        .store_haxen_server_did(&server_identity("haxen-test"))
        .await
        .expect("store server");
    seed_agent(env.storage.as_ref(), "haxen-test", "agent-1", 0, &[]).await;
    env.registry.initialize().await.expect("reload");

    env.registry
        .update_agent_status("haxen-test", "agent-1", AgentDIDStatus::Active)
        .await
        .expect("update status");

    // Visible in the cache.
    let snapshot = env.registry.get_registry("haxen-test").expect("registry");
    assert_eq!(snapshot.agent_nodes["agent-1"].status, AgentDIDStatus::Active);

    // And durable: a cold registry sees the same status.
    let reloaded = DIDRegistry::new(env.storage.clone());
    reloaded.initialize().await.expect("reload");
    let snapshot = reloaded.get_registry("haxen-test").expect("registry");
    assert_eq!(snapshot.agent_nodes["agent-1"].status, AgentDIDStatus::Active);

    assert!(matches!(
        env.registry
            .update_agent_status("haxen-test", "agent-9", AgentDIDStatus::Revoked)
            .await,
        Err(DIDError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_component_names_resolve_to_first_registered() {
    let env = common::setup().await;
    env.storage
        .store_haxen_server_did(&server_identity("haxen-test"))
        .await
        .expect("store server");
    seed_agent(
        env.storage.as_ref(),
        "haxen-test",
        "agent-early",
        0,
        &[component_request("did:haxen:haxen-test:skill:1", ComponentType::Skill, "shared.fn", 1)],
    )
    .await;
    seed_agent(
        env.storage.as_ref(),
        "haxen-test",
        "agent-late",
        2,
        &[component_request("did:haxen:haxen-test:skill:3", ComponentType::Skill, "shared.fn", 3)],
    )
    .await;
    env.registry.initialize().await.expect("reload");

    let found = env
        .registry
        .find_did_by_component("haxen-test", ComponentType::Skill, "shared.fn")
        .expect("lookup");
    assert_eq!(found.did, "did:haxen:haxen-test:skill:1");
}

#[tokio::test]
async fn list_registries_and_agent_dids() {
    let env = common::setup().await;
    for server in ["haxen-b", "haxen-a"] {
        env.storage
            .store_haxen_server_did(&server_identity(server))
            .await
            .expect("store server");
    }
    seed_agent(env.storage.as_ref(), "haxen-a", "agent-1", 0, &[]).await;
    env.registry.initialize().await.expect("reload");

    let summaries = env.registry.list_registries();
    assert_eq!(summaries.len(), 2);
    // Sorted by server ID.
    assert_eq!(summaries[0].haxen_server_id, "haxen-a");
    assert_eq!(summaries[0].agent_count, 1);
    assert_eq!(summaries[1].haxen_server_id, "haxen-b");
    assert_eq!(summaries[1].agent_count, 0);

    let package = env
        .registry
        .get_agent_dids("haxen-a", "agent-1")
        .expect("package");
    assert_eq!(package.agent_did.agent_node_id, "agent-1");
    assert!(package.reasoner_dids.is_empty());
    assert!(package.skill_dids.is_empty());
}
