/*!
# Haxen Common

Shared building blocks for the Haxen control plane: the record types that make
up the DID registry, the configuration surface, and the installation path
layout every service agrees on.
*/

pub mod config;
pub mod paths;
pub mod types;

pub use config::{DIDConfig, KeystoreConfig, LocalStorageConfig, StorageConfig};
pub use types::{
    AgentDIDRecord, AgentDIDStatus, AgentSummary, ComponentDIDRecord, ComponentType,
    DIDRegistrationRequest, HaxenServerIdentity, HaxenServerRegistry, IdentityKind,
    IdentityPackage, PublicKeyJwk, ReasonerDefinition, RegistrySummary, ResolvedIdentity,
    SkillDefinition,
};
