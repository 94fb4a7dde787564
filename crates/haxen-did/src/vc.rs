use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use haxen_keystore::{verify_signature, Keystore};

use crate::{DIDError, DIDResult, DIDService};

/// A signed assertion about a subject DID, issued by the haxen server's root
/// identity. Only issuance and local verification live here; how credentials
/// are presented to third parties is out of scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiableCredential {
    pub id: String,
    #[serde(rename = "type")]
    pub credential_type: Vec<String>,
    pub issuer: String,
    #[serde(rename = "issuanceDate")]
    pub issuance_date: String,
    #[serde(rename = "credentialSubject")]
    pub credential_subject: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<serde_json::Value>,
    #[serde(rename = "expirationDate", skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<String>,
}

impl VerifiableCredential {
    /// Set an expiration date on the credential.
    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration_date = Some(expiration.to_rfc3339());
        self
    }
}

/// Issues credentials referencing DIDs resolved through the DID service.
pub struct VCService {
    did_service: Arc<DIDService>,
    keystore: Arc<dyn Keystore>,
}

impl VCService {
    pub fn new(did_service: Arc<DIDService>, keystore: Arc<dyn Keystore>) -> Self {
        Self {
            did_service,
            keystore,
        }
    }

    /// Issue a credential about `subject_did`, signed with the server's root
    /// key. The subject must resolve against the local registry; issuing
    /// about unknown DIDs is refused.
    pub async fn issue(
        &self,
        subject_did: &str,
        credential_type: Vec<String>,
        claims: serde_json::Value,
    ) -> DIDResult<VerifiableCredential> {
        let resolved = self.did_service.resolve_did(subject_did).await?;
        let issuer = self.did_service.root_did()?;

        let mut subject = serde_json::Map::new();
        subject.insert("id".to_string(), json!(resolved.did));
        if let serde_json::Value::Object(claim_map) = claims {
            for (key, value) in claim_map {
                subject.insert(key, value);
            }
        }

        let mut credential = VerifiableCredential {
            id: format!("urn:uuid:{}", Uuid::new_v4()),
            credential_type,
            issuer: issuer.clone(),
            issuance_date: Utc::now().to_rfc3339(),
            credential_subject: serde_json::Value::Object(subject),
            proof: None,
            expiration_date: None,
        };

        let jws = self.sign_credential(&credential, &issuer).await?;
        credential.proof = Some(json!({
            "type": "JsonWebSignature2020",
            "created": Utc::now().to_rfc3339(),
            "proofPurpose": "assertionMethod",
            "verificationMethod": format!("{}#root", issuer),
            "jws": jws,
        }));

        info!(subject = %subject_did, credential_id = %credential.id, "credential issued");
        Ok(credential)
    }

    /// Verify a credential's shape, expiry, and signature against the active
    /// server's root key. Returns `Ok(false)` for an unsigned credential.
    pub async fn verify(&self, credential: &VerifiableCredential) -> DIDResult<bool> {
        if credential.issuer.is_empty() {
            return Err(DIDError::Credential("issuer is empty".to_string()));
        }
        if let Some(expiration) = &credential.expiration_date {
            let expiration = DateTime::parse_from_rfc3339(expiration)
                .map_err(|e| DIDError::Credential(format!("invalid expiration date: {}", e)))?;
            if expiration < Utc::now() {
                return Ok(false);
            }
        }

        let proof = match &credential.proof {
            Some(proof) => proof,
            None => return Ok(false),
        };
        let jws = proof
            .get("jws")
            .and_then(|value| value.as_str())
            .ok_or_else(|| DIDError::Credential("proof is missing jws".to_string()))?;

        let parts: Vec<&str> = jws.split('.').collect();
        let [header, payload, signature] = parts.as_slice() else {
            return Err(DIDError::Credential("malformed compact JWS".to_string()));
        };
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| DIDError::Credential(format!("invalid signature encoding: {}", e)))?;

        let server = self.did_service.active_server()?;
        let (root_jwk, _) = self.keystore.ensure_root(&server).await?;

        let signing_input = format!("{}.{}", header, payload);
        Ok(verify_signature(&root_jwk, signing_input.as_bytes(), &signature_bytes)?)
    }

    async fn sign_credential(
        &self,
        credential: &VerifiableCredential,
        issuer: &str,
    ) -> DIDResult<String> {
        let header = json!({
            "alg": "EdDSA",
            "typ": "JWT",
            "kid": format!("{}#root", issuer),
        });
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(credential)?);
        let signing_input = format!("{}.{}", header_b64, payload_b64);

        let server = self.did_service.active_server()?;
        let (_, root_ref) = self.keystore.ensure_root(&server).await?;
        let signature = self
            .keystore
            .sign(&root_ref, signing_input.as_bytes())
            .await?;

        Ok(format!(
            "{}.{}.{}",
            header_b64,
            payload_b64,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}
