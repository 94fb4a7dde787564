use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An Ed25519 public key in JWK form, as stored alongside every DID record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    /// Base64url (unpadded) public key bytes.
    pub x: String,
}

impl PublicKeyJwk {
    /// Create an OKP/Ed25519 JWK from an already-encoded `x` parameter.
    pub fn ed25519(x: impl Into<String>) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x: x.into(),
        }
    }
}

/// Lifecycle marker on an agent DID record.
///
/// This is a free enum: any value may move to any other. Callers use it as a
/// soft lifecycle signal, not a workflow gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentDIDStatus {
    Pending,
    Active,
    Revoked,
}

impl AgentDIDStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentDIDStatus::Pending => "pending",
            AgentDIDStatus::Active => "active",
            AgentDIDStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for AgentDIDStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentDIDStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AgentDIDStatus::Pending),
            "active" => Ok(AgentDIDStatus::Active),
            "revoked" => Ok(AgentDIDStatus::Revoked),
            other => Err(format!("unknown agent DID status: {}", other)),
        }
    }
}

/// The kind of component an agent exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Reasoner,
    Skill,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Reasoner => "reasoner",
            ComponentType::Skill => "skill",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reasoner" => Ok(ComponentType::Reasoner),
            "skill" => Ok(ComponentType::Skill),
            other => Err(format!("unknown component type: {}", other)),
        }
    }
}

/// The identity record of one control-plane instance. Exactly one exists per
/// haxen server ID; it is created on first initialization and mutated only by
/// key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaxenServerIdentity {
    pub haxen_server_id: String,
    pub root_did: String,
    /// Keystore reference to the root key material. Never the raw seed.
    pub seed_ref: String,
    pub created_at: DateTime<Utc>,
    pub last_key_rotation: DateTime<Utc>,
}

/// A DID minted for a reasoner or skill, owned by exactly one agent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDIDRecord {
    pub did: String,
    pub component_type: ComponentType,
    pub component_name: String,
    pub public_key_jwk: PublicKeyJwk,
    /// Position in the server's derivation path. Strictly greater than the
    /// owning agent's index; globally unique per haxen server.
    pub derivation_index: u64,
}

/// A DID minted for a registered agent node, carrying its component records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDIDRecord {
    pub agent_node_id: String,
    pub did: String,
    pub haxen_server_id: String,
    pub public_key_jwk: PublicKeyJwk,
    pub derivation_index: u64,
    pub status: AgentDIDStatus,
    pub components: Vec<ComponentDIDRecord>,
}

impl AgentDIDRecord {
    /// Components of the given type, in registration order.
    pub fn components_of(&self, component_type: ComponentType) -> impl Iterator<Item = &ComponentDIDRecord> {
        self.components
            .iter()
            .filter(move |c| c.component_type == component_type)
    }
}

/// The bundle returned from a successful registration: the agent DID plus a
/// name-indexed view of its component DIDs. A view, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPackage {
    pub agent_did: AgentDIDRecord,
    pub reasoner_dids: HashMap<String, ComponentDIDRecord>,
    pub skill_dids: HashMap<String, ComponentDIDRecord>,
}

impl IdentityPackage {
    /// Assemble the package view from a materialized agent record.
    pub fn from_record(record: &AgentDIDRecord) -> Self {
        let mut reasoner_dids = HashMap::new();
        let mut skill_dids = HashMap::new();
        for component in &record.components {
            let entry = (component.component_name.clone(), component.clone());
            match component.component_type {
                ComponentType::Reasoner => {
                    reasoner_dids.entry(entry.0).or_insert(entry.1);
                }
                ComponentType::Skill => {
                    skill_dids.entry(entry.0).or_insert(entry.1);
                }
            }
        }
        Self {
            agent_did: record.clone(),
            reasoner_dids,
            skill_dids,
        }
    }
}

/// A reasoner exposed by an agent at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonerDefinition {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A skill exposed by an agent at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_status() -> AgentDIDStatus {
    AgentDIDStatus::Pending
}

/// What an agent onboarding flow submits to mint its identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DIDRegistrationRequest {
    pub agent_node_id: String,
    #[serde(default)]
    pub reasoners: Vec<ReasonerDefinition>,
    #[serde(default)]
    pub skills: Vec<SkillDefinition>,
    /// Initial lifecycle marker; defaults to pending.
    #[serde(default = "default_status")]
    pub status: AgentDIDStatus,
}

/// The fully materialized registry for one haxen server: the server identity
/// plus every agent record (each carrying its components).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaxenServerRegistry {
    pub haxen_server_id: String,
    pub root_did: String,
    pub created_at: DateTime<Utc>,
    pub last_key_rotation: DateTime<Utc>,
    pub agent_nodes: HashMap<String, AgentDIDRecord>,
}

impl HaxenServerRegistry {
    /// An empty registry for a freshly initialized server identity.
    pub fn from_identity(identity: &HaxenServerIdentity) -> Self {
        Self {
            haxen_server_id: identity.haxen_server_id.clone(),
            root_did: identity.root_did.clone(),
            created_at: identity.created_at,
            last_key_rotation: identity.last_key_rotation,
            agent_nodes: HashMap::new(),
        }
    }
}

/// Listing view over one haxen server registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub haxen_server_id: String,
    pub root_did: String,
    pub agent_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Listing view over one persisted agent DID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_node_id: String,
    pub did: String,
    pub haxen_server_id: String,
    pub status: AgentDIDStatus,
    pub component_count: usize,
}

/// Which kind of record a DID resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Agent,
    Reasoner,
    Skill,
}

/// The record a DID string resolves back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub did: String,
    pub kind: IdentityKind,
    /// The agent node that owns this identity (the agent itself for agent DIDs).
    pub agent_node_id: String,
    pub component_name: Option<String>,
    pub public_key_jwk: PublicKeyJwk,
    pub derivation_index: u64,
}
