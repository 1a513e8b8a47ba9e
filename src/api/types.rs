use serde::{Deserialize, Serialize};

use crate::monitor::{AddressRef, SourceKind};

#[derive(Debug, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub name: String,
    pub status: String,
}

impl DeleteResponse {
    pub fn deleted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "deleted".to_string(),
        }
    }
}

/// Identifies the owning source of a derived address in address routes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub extended_key_name: Option<String>,
    pub descriptor_name: Option<String>,
}

impl OwnerQuery {
    pub fn into_ref(self, collection: String, address: String) -> AddressRef {
        match (self.extended_key_name, self.descriptor_name) {
            (Some(name), _) => AddressRef::in_source(collection, SourceKind::ExtendedKey, name, address),
            (None, Some(name)) => AddressRef::in_source(collection, SourceKind::Descriptor, name, address),
            (None, None) => AddressRef::plain(collection, address),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub collection: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub queued: usize,
}

#[derive(Debug, Serialize)]
pub struct TrackedAddressesResponse {
    pub addresses: Vec<String>,
}
