/*!
# Haxen DID Registry

The authoritative index of all identities rooted at one control-plane
instance, and the services around it: identity derivation for agents and
their components, DID resolution, and credential issuance.

Registration follows a strict derive-then-commit-then-cache ordering: the
full record set is built first, persisted in one storage transaction, and
only then applied to the in-memory cache. The cache never shows state that
is not durable.
*/

mod error;
mod registry;
mod service;
mod vc;

pub use error::{DIDError, DIDResult};
pub use registry::DIDRegistry;
pub use service::DIDService;
pub use vc::{VCService, VerifiableCredential};
