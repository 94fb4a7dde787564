use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use haxen_common::{
    AgentDIDRecord, AgentDIDStatus, ComponentDIDRecord, ComponentType, HaxenServerIdentity,
    HaxenServerRegistry, IdentityKind, IdentityPackage, RegistrySummary, ResolvedIdentity,
};
use haxen_storage::{ComponentDIDRequest, StorageProvider};

use crate::{DIDError, DIDResult};

/// The in-memory index of every identity rooted at the haxen servers known to
/// this storage backend.
///
/// The cache only ever reflects durably persisted state: it is filled from
/// storage on [`initialize`](DIDRegistry::initialize) and mutated strictly
/// after a successful storage write. Reads never touch storage.
pub struct DIDRegistry {
    storage: Arc<dyn StorageProvider>,
    cache: RwLock<HashMap<String, HaxenServerRegistry>>,
}

impl DIDRegistry {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted haxen server registry into the cache. Idempotent;
    /// an empty storage backend yields an empty (but initialized) registry.
    pub async fn initialize(&self) -> DIDResult<()> {
        let identities = self.storage.load_haxen_server_dids().await?;
        let mut loaded = HashMap::with_capacity(identities.len());
        for identity in identities {
            let mut registry = HaxenServerRegistry::from_identity(&identity);
            for agent in self.storage.load_agent_dids(&identity.haxen_server_id).await? {
                registry.agent_nodes.insert(agent.agent_node_id.clone(), agent);
            }
            loaded.insert(identity.haxen_server_id.clone(), registry);
        }

        let count = loaded.len();
        *self.cache.write().unwrap() = loaded;
        info!(registries = count, "DID registry initialized");
        Ok(())
    }

    /// Snapshot of one haxen server's registry, straight from the cache.
    pub fn get_registry(&self, haxen_server_id: &str) -> DIDResult<HaxenServerRegistry> {
        self.cache
            .read()
            .unwrap()
            .get(haxen_server_id)
            .cloned()
            .ok_or_else(|| DIDError::NotFound(format!("haxen server registry {}", haxen_server_id)))
    }

    /// Whether an agent node is already registered on the given server.
    pub fn contains_agent(&self, haxen_server_id: &str, agent_node_id: &str) -> bool {
        self.cache
            .read()
            .unwrap()
            .get(haxen_server_id)
            .map(|registry| registry.agent_nodes.contains_key(agent_node_id))
            .unwrap_or(false)
    }

    /// Look up a component DID by type and name across all agents of a
    /// server. Deterministic: agents are scanned in registration order, so if
    /// duplicate names exist the first registered wins.
    pub fn find_did_by_component(
        &self,
        haxen_server_id: &str,
        component_type: ComponentType,
        component_name: &str,
    ) -> DIDResult<ComponentDIDRecord> {
        let cache = self.cache.read().unwrap();
        let registry = cache.get(haxen_server_id).ok_or_else(|| {
            DIDError::NotFound(format!("haxen server registry {}", haxen_server_id))
        })?;

        let mut agents: Vec<&AgentDIDRecord> = registry.agent_nodes.values().collect();
        agents.sort_by_key(|agent| agent.derivation_index);

        for agent in agents {
            for component in &agent.components {
                if component.component_type == component_type
                    && component.component_name == component_name
                {
                    return Ok(component.clone());
                }
            }
        }
        Err(DIDError::NotFound(format!(
            "{} {} on haxen server {}",
            component_type, component_name, haxen_server_id
        )))
    }

    /// Persist a status change, then mirror it into the cache. The cache is
    /// only touched after the write succeeds, so it never shows a status that
    /// is not durable.
    pub async fn update_agent_status(
        &self,
        haxen_server_id: &str,
        agent_node_id: &str,
        status: AgentDIDStatus,
    ) -> DIDResult<()> {
        if !self.contains_agent(haxen_server_id, agent_node_id) {
            return Err(DIDError::NotFound(format!(
                "agent {} on haxen server {}",
                agent_node_id, haxen_server_id
            )));
        }

        self.storage
            .update_agent_did_status(haxen_server_id, agent_node_id, status)
            .await?;

        let mut cache = self.cache.write().unwrap();
        if let Some(agent) = cache
            .get_mut(haxen_server_id)
            .and_then(|registry| registry.agent_nodes.get_mut(agent_node_id))
        {
            agent.status = status;
        }
        debug!(haxen_server_id, agent_node_id, status = %status, "agent status updated");
        Ok(())
    }

    /// Enumerate every known haxen server. Supports multi-tenant deployments
    /// where several control planes share one storage backend.
    pub fn list_registries(&self) -> Vec<RegistrySummary> {
        let cache = self.cache.read().unwrap();
        let mut summaries: Vec<RegistrySummary> = cache
            .values()
            .map(|registry| RegistrySummary {
                haxen_server_id: registry.haxen_server_id.clone(),
                root_did: registry.root_did.clone(),
                agent_count: registry.agent_nodes.len(),
                created_at: registry.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.haxen_server_id.cmp(&b.haxen_server_id));
        summaries
    }

    /// The identity package view for one registered agent.
    pub fn get_agent_dids(
        &self,
        haxen_server_id: &str,
        agent_node_id: &str,
    ) -> DIDResult<IdentityPackage> {
        let cache = self.cache.read().unwrap();
        let agent = cache
            .get(haxen_server_id)
            .and_then(|registry| registry.agent_nodes.get(agent_node_id))
            .ok_or_else(|| {
                DIDError::NotFound(format!(
                    "agent {} on haxen server {}",
                    agent_node_id, haxen_server_id
                ))
            })?;
        Ok(IdentityPackage::from_record(agent))
    }

    /// Resolve a DID string against one server's agent and component records.
    pub fn resolve(&self, haxen_server_id: &str, did: &str) -> DIDResult<ResolvedIdentity> {
        let cache = self.cache.read().unwrap();
        let registry = cache.get(haxen_server_id).ok_or_else(|| {
            DIDError::NotFound(format!("haxen server registry {}", haxen_server_id))
        })?;

        for agent in registry.agent_nodes.values() {
            if agent.did == did {
                return Ok(ResolvedIdentity {
                    did: agent.did.clone(),
                    kind: IdentityKind::Agent,
                    agent_node_id: agent.agent_node_id.clone(),
                    component_name: None,
                    public_key_jwk: agent.public_key_jwk.clone(),
                    derivation_index: agent.derivation_index,
                });
            }
            for component in &agent.components {
                if component.did == did {
                    return Ok(ResolvedIdentity {
                        did: component.did.clone(),
                        kind: match component.component_type {
                            ComponentType::Reasoner => IdentityKind::Reasoner,
                            ComponentType::Skill => IdentityKind::Skill,
                        },
                        agent_node_id: agent.agent_node_id.clone(),
                        component_name: Some(component.component_name.clone()),
                        public_key_jwk: component.public_key_jwk.clone(),
                        derivation_index: component.derivation_index,
                    });
                }
            }
        }
        Err(DIDError::NotFound(format!("DID {}", did)))
    }

    /// Persist a server identity and apply it to the cache. Existing agent
    /// records survive (used by key rotation, which only touches the server
    /// row).
    pub async fn register_server(&self, identity: &HaxenServerIdentity) -> DIDResult<()> {
        self.storage.store_haxen_server_did(identity).await?;

        let mut cache = self.cache.write().unwrap();
        match cache.get_mut(&identity.haxen_server_id) {
            Some(existing) => {
                existing.root_did = identity.root_did.clone();
                existing.created_at = identity.created_at;
                existing.last_key_rotation = identity.last_key_rotation;
            }
            None => {
                cache.insert(
                    identity.haxen_server_id.clone(),
                    HaxenServerRegistry::from_identity(identity),
                );
            }
        }
        Ok(())
    }

    /// Persist a fully assembled agent record set atomically, then apply it
    /// to the cache.
    pub async fn store_agent(&self, record: &AgentDIDRecord) -> DIDResult<()> {
        let components: Vec<ComponentDIDRequest> = record
            .components
            .iter()
            .map(|component| ComponentDIDRequest {
                component_did: component.did.clone(),
                component_type: component.component_type,
                component_name: component.component_name.clone(),
                public_key_jwk: component.public_key_jwk.clone(),
                derivation_index: component.derivation_index,
            })
            .collect();

        self.storage
            .store_agent_did_with_components(
                &record.agent_node_id,
                &record.did,
                &record.haxen_server_id,
                &record.public_key_jwk,
                record.derivation_index,
                record.status,
                &components,
            )
            .await?;

        let mut cache = self.cache.write().unwrap();
        let registry = cache.get_mut(&record.haxen_server_id).ok_or_else(|| {
            DIDError::NotFound(format!("haxen server registry {}", record.haxen_server_id))
        })?;
        registry
            .agent_nodes
            .insert(record.agent_node_id.clone(), record.clone());
        Ok(())
    }

    /// Reserve a run of derivation indices through the storage-level counter.
    pub async fn allocate_indices(&self, haxen_server_id: &str, count: u64) -> DIDResult<u64> {
        Ok(self
            .storage
            .allocate_derivation_indices(haxen_server_id, count)
            .await?)
    }
}
