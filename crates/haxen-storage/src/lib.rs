/*!
# Haxen Storage

The durable storage contract consumed by the DID registry, plus the one local
implementation: SQLite behind a mutex-guarded connection. Atomicity of an
agent registration (the agent row and all of its component rows) is a single
SQLite transaction; a partial failure leaves the database unchanged.
*/

mod error;
mod local;

pub use error::{StorageError, StorageResult};
pub use local::LocalStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use haxen_common::{
    AgentDIDRecord, AgentDIDStatus, AgentSummary, ComponentType, HaxenServerIdentity, PublicKeyJwk,
};

/// One component row of an agent registration, as handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDIDRequest {
    pub component_did: String,
    pub component_type: ComponentType,
    pub component_name: String,
    pub public_key_jwk: PublicKeyJwk,
    pub derivation_index: u64,
}

/// Durable store for server, agent, and component DIDs.
///
/// Implementations must provide atomic multi-row writes for
/// [`store_agent_did_with_components`](StorageProvider::store_agent_did_with_components)
/// and point lookups sufficient to rebuild a full registry snapshot on
/// startup. Errors are surfaced to the caller, never retried here.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Create or replace the identity record of a haxen server.
    async fn store_haxen_server_did(&self, identity: &HaxenServerIdentity) -> StorageResult<()>;

    /// Every persisted server identity, for registry bootstrap.
    async fn load_haxen_server_dids(&self) -> StorageResult<Vec<HaxenServerIdentity>>;

    /// Persist one agent and all of its components in a single transaction.
    #[allow(clippy::too_many_arguments)]
    async fn store_agent_did_with_components(
        &self,
        agent_node_id: &str,
        agent_did: &str,
        haxen_server_id: &str,
        public_key_jwk: &PublicKeyJwk,
        derivation_index: u64,
        status: AgentDIDStatus,
        components: &[ComponentDIDRequest],
    ) -> StorageResult<()>;

    /// The full agent record set for one server, components included,
    /// ordered by derivation index.
    async fn load_agent_dids(&self, haxen_server_id: &str) -> StorageResult<Vec<AgentDIDRecord>>;

    /// Listing view over every persisted agent DID, across servers.
    async fn list_agent_dids(&self) -> StorageResult<Vec<AgentSummary>>;

    /// Persist a status change for one agent.
    async fn update_agent_did_status(
        &self,
        haxen_server_id: &str,
        agent_node_id: &str,
        status: AgentDIDStatus,
    ) -> StorageResult<()>;

    /// Atomically reserve `count` derivation indices for a server, returning
    /// the first. Reserved indices are never handed out again, even if the
    /// registration they were reserved for fails.
    async fn allocate_derivation_indices(
        &self,
        haxen_server_id: &str,
        count: u64,
    ) -> StorageResult<u64>;
}
