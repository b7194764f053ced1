use crate::types::{Did, Handle};
use bon::Builder;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use url::Url;

/// Service type of a user's repository host.
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

/// DID Document representation.
///
/// Only the fields the client reads are modeled explicitly. Everything else is
/// kept in `extra_data` so documents survive a round trip.
///
/// Example
/// ```
/// use skein_common::types::did_doc::DidDocument;
/// use serde_json::json;
/// let doc: DidDocument = serde_json::from_value(json!({
///   "id": "did:plc:alice",
///   "alsoKnownAs": ["at://alice.example.com"],
///   "service": [{"id":"#atproto_pds","type":"AtprotoPersonalDataServer","serviceEndpoint":"https://pds.example"}]
/// })).unwrap();
/// assert_eq!(doc.id.as_str(), "did:plc:alice");
/// assert_eq!(doc.pds_endpoint().unwrap().as_str(), "https://pds.example/");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(start_fn = new)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// Document identifier (e.g., `did:plc:...` or `did:web:...`)
    pub id: Did,

    /// Alternate identifiers for the subject, such as at://<handle>
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub also_known_as: Option<Vec<SmolStr>>,

    /// Verification methods (keys) for this DID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_method: Option<Vec<VerificationMethod>>,

    /// Services associated with this DID (e.g., AtprotoPersonalDataServer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Vec<Service>>,

    /// Forward‑compatible capture of unmodeled fields
    #[serde(flatten)]
    #[builder(default)]
    pub extra_data: BTreeMap<SmolStr, serde_json::Value>,
}

impl DidDocument {
    /// Extract validated handles from `alsoKnownAs` entries like `at://<handle>`.
    pub fn handles(&self) -> Vec<Handle> {
        self.also_known_as
            .as_ref()
            .map(|v| {
                v.iter()
                    .filter_map(|s| s.strip_prefix("at://"))
                    .filter_map(|h| Handle::new(h).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Extract the AtprotoPersonalDataServer service endpoint as a `Url`.
    /// Accepts endpoint as string or object (string preferred).
    pub fn pds_endpoint(&self) -> Option<Url> {
        self.service.as_ref().and_then(|services| {
            services.iter().find_map(|s| {
                if s.r#type.as_str() != PDS_SERVICE_TYPE {
                    return None;
                }
                match &s.service_endpoint {
                    Some(serde_json::Value::String(url)) => Url::parse(url).ok(),
                    // some documents carry structured endpoints
                    Some(serde_json::Value::Object(obj)) => obj
                        .get("url")
                        .and_then(|v| v.as_str())
                        .and_then(|u| Url::parse(u).ok()),
                    _ => None,
                }
            })
        })
    }
}

/// Verification method (key) entry in a DID Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(start_fn = new)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// Identifier for this key material within the document
    pub id: SmolStr,
    /// Key type (e.g., `Multikey`)
    #[serde(rename = "type")]
    pub r#type: SmolStr,
    /// Optional controller DID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<SmolStr>,
    /// Multikey `publicKeyMultibase` (base58btc)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<SmolStr>,
}

/// Service entry in a DID Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(start_fn = new)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Service identifier
    pub id: SmolStr,
    /// Service type (e.g., `AtprotoPersonalDataServer`)
    #[serde(rename = "type")]
    pub r#type: SmolStr,
    /// String or object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<serde_json::Value>,
}
