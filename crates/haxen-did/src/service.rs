use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use haxen_common::{
    AgentDIDRecord, ComponentDIDRecord, ComponentType, DIDConfig, DIDRegistrationRequest,
    HaxenServerIdentity, IdentityPackage, PublicKeyJwk, ResolvedIdentity,
};
use haxen_common::paths::{haxen_server_id_for, HaxenDirs};
use haxen_keystore::{DerivationPath, Keystore, KeystoreError};
use haxen_storage::StorageError;

use crate::{DIDError, DIDRegistry, DIDResult};

/// Orchestrates identity derivation: translates a registration request into
/// derived key pairs and DIDs, persists them atomically through the registry,
/// and resolves issued DIDs back to their records.
pub struct DIDService {
    config: DIDConfig,
    keystore: Arc<dyn Keystore>,
    registry: Arc<DIDRegistry>,
    active_server: RwLock<Option<String>>,
}

impl DIDService {
    pub fn new(config: DIDConfig, keystore: Arc<dyn Keystore>, registry: Arc<DIDRegistry>) -> Self {
        Self {
            config,
            keystore,
            registry,
            active_server: RwLock::new(None),
        }
    }

    /// Ensure a haxen server identity exists for this instance, creating one
    /// with a fresh root key and current timestamps if absent. Must run before
    /// any registration or resolution for the server. Idempotent.
    pub async fn initialize(&self, haxen_server_id: &str) -> DIDResult<()> {
        if !self.config.enabled {
            warn!("DID subsystem is disabled by configuration; initializing anyway");
        }
        if self.registry.get_registry(haxen_server_id).is_ok() {
            // Known server: make sure root key material is present, then
            // adopt it as the active server.
            self.keystore.ensure_root(haxen_server_id).await?;
            *self.active_server.write().unwrap() = Some(haxen_server_id.to_string());
            return Ok(());
        }

        let (_root_jwk, key_ref) = self.keystore.ensure_root(haxen_server_id).await?;
        let now = Utc::now();
        let identity = HaxenServerIdentity {
            haxen_server_id: haxen_server_id.to_string(),
            root_did: format!("did:haxen:{}", haxen_server_id),
            seed_ref: key_ref.to_string(),
            created_at: now,
            last_key_rotation: now,
        };
        self.registry.register_server(&identity).await?;
        *self.active_server.write().unwrap() = Some(haxen_server_id.to_string());
        info!(haxen_server_id, root_did = %identity.root_did, "haxen server identity initialized");
        Ok(())
    }

    /// Initialize for the installation rooted at `dirs`, deriving the haxen
    /// server ID from the installation path.
    pub async fn initialize_for(&self, dirs: &HaxenDirs) -> DIDResult<()> {
        self.initialize(&haxen_server_id_for(&dirs.home)).await
    }

    /// The server this service was initialized for.
    pub fn active_server(&self) -> DIDResult<String> {
        self.active_server
            .read()
            .unwrap()
            .clone()
            .ok_or(DIDError::RegistryNotInitialized)
    }

    /// The root DID of the active server.
    pub fn root_did(&self) -> DIDResult<String> {
        Ok(format!("did:haxen:{}", self.active_server()?))
    }

    /// Precondition guard: errors until a haxen server identity has been
    /// initialized for this instance.
    pub fn validate_haxen_server_registry(&self) -> DIDResult<()> {
        let server = self.active_server()?;
        self.registry
            .get_registry(&server)
            .map_err(|_| DIDError::RegistryNotInitialized)?;
        Ok(())
    }

    /// Register an agent node and mint DIDs for it and every reasoner and
    /// skill it exposes, in request order.
    ///
    /// Derivation indices come from the storage-level counter and are
    /// consumed even if a later step fails: an abandoned index is never
    /// recycled, so no two identities can ever share a derivation path. The
    /// record set is built completely, persisted in one transaction, and only
    /// then applied to the cache.
    pub async fn register_agent(
        &self,
        request: &DIDRegistrationRequest,
    ) -> DIDResult<IdentityPackage> {
        let server = self.active_server()?;
        self.validate_haxen_server_registry()?;

        if self.registry.contains_agent(&server, &request.agent_node_id) {
            return Err(DIDError::DuplicateAgent(request.agent_node_id.clone()));
        }

        let total = 1 + request.reasoners.len() as u64 + request.skills.len() as u64;
        let first = self.registry.allocate_indices(&server, total).await?;
        let mut next_index = first;

        let (agent_jwk, _) = self
            .keystore
            .generate(&DerivationPath::new(&server, next_index))
            .await?;
        let agent_did = mint_did(&server, "agent", &agent_jwk)?;
        let agent_index = next_index;
        next_index += 1;

        let mut components = Vec::with_capacity((total - 1) as usize);
        for reasoner in &request.reasoners {
            components.push(
                self.derive_component(&server, ComponentType::Reasoner, &reasoner.id, next_index)
                    .await?,
            );
            next_index += 1;
        }
        for skill in &request.skills {
            components.push(
                self.derive_component(&server, ComponentType::Skill, &skill.id, next_index)
                    .await?,
            );
            next_index += 1;
        }

        let record = AgentDIDRecord {
            agent_node_id: request.agent_node_id.clone(),
            did: agent_did,
            haxen_server_id: server.clone(),
            public_key_jwk: agent_jwk,
            derivation_index: agent_index,
            status: request.status,
            components,
        };

        match self.registry.store_agent(&record).await {
            Ok(()) => {}
            Err(DIDError::Storage(StorageError::Duplicate(_))) => {
                // Lost a race with a concurrent registration of the same node.
                warn!(
                    haxen_server_id = %server,
                    agent_node_id = %request.agent_node_id,
                    "duplicate agent registration rejected by storage"
                );
                return Err(DIDError::DuplicateAgent(request.agent_node_id.clone()));
            }
            Err(other) => return Err(other),
        }

        info!(
            haxen_server_id = %server,
            agent_node_id = %request.agent_node_id,
            did = %record.did,
            components = record.components.len(),
            "agent registered"
        );
        Ok(IdentityPackage::from_record(&record))
    }

    /// Resolve a DID issued by the active server back to its record.
    pub async fn resolve_did(&self, did: &str) -> DIDResult<ResolvedIdentity> {
        let server = self.active_server()?;
        self.registry.resolve(&server, did)
    }

    /// Rotate the active server's root key material and persist the new
    /// rotation timestamp. Agent and component records are untouched.
    pub async fn rotate_server_key(&self) -> DIDResult<()> {
        let server = self.active_server()?;
        let current = self.registry.get_registry(&server)?;

        let (_jwk, key_ref) = self.keystore.rotate_root(&server).await?;
        let identity = HaxenServerIdentity {
            haxen_server_id: server.clone(),
            root_did: current.root_did.clone(),
            seed_ref: key_ref.to_string(),
            created_at: current.created_at,
            last_key_rotation: Utc::now(),
        };
        self.registry.register_server(&identity).await?;
        info!(haxen_server_id = %server, "server root key rotated");
        Ok(())
    }

    async fn derive_component(
        &self,
        server: &str,
        component_type: ComponentType,
        name: &str,
        index: u64,
    ) -> DIDResult<ComponentDIDRecord> {
        let (jwk, _) = self
            .keystore
            .generate(&DerivationPath::new(server, index))
            .await?;
        Ok(ComponentDIDRecord {
            did: mint_did(server, component_type.as_str(), &jwk)?,
            component_type,
            component_name: name.to_string(),
            public_key_jwk: jwk,
            derivation_index: index,
        })
    }
}

/// DID string for a derived identity: the kind segment keeps agent, reasoner,
/// and skill namespaces disjoint; the fingerprint is the first 16 hex chars of
/// the SHA-256 of the public key, so the DID is fully determined by the
/// derivation path.
fn mint_did(haxen_server_id: &str, kind: &str, jwk: &PublicKeyJwk) -> DIDResult<String> {
    let key_bytes = URL_SAFE_NO_PAD
        .decode(&jwk.x)
        .map_err(|e| KeystoreError::Serialization(format!("invalid JWK x parameter: {}", e)))?;
    let digest = Sha256::digest(&key_bytes);
    Ok(format!(
        "did:haxen:{}:{}:{}",
        haxen_server_id,
        kind,
        &hex::encode(digest)[..16]
    ))
}
