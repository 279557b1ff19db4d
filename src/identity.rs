//! Device identity and profile.
//!
//! The device UUID is generated once per device lifetime and persisted before
//! first use. Within a process it is loaded at most once and then served from
//! memory.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::{
    get_string, KeyValueStore, StorageError, KEY_PLANT_LOCATION, KEY_PLANT_NAME,
    KEY_PLANT_VARIETY, KEY_UUID,
};

/// Canonical hyphenated UUID v4 string identifying this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Parse a stored identity, accepting only canonical hyphenated UUIDs.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() != 36 {
            return None;
        }
        Uuid::parse_str(value)
            .ok()
            .map(|uuid| Self(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the identity returned by [`IdentityStore::get_or_create`] came from.
#[derive(Debug)]
pub enum IdentityOrigin {
    /// Loaded from persistent storage
    Loaded,

    /// Freshly generated and persisted
    Generated,

    /// Freshly generated, but persisting it failed; valid for this session only
    SessionOnly(StorageError),
}

/// Owns the persistent device identifier.
pub struct IdentityStore<S> {
    store: S,
    cached: Option<DeviceIdentity>,
    persisted: bool,
}

impl<S: KeyValueStore> IdentityStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cached: None,
            persisted: false,
        }
    }

    /// Return the device identity, creating and persisting it on first use.
    ///
    /// A failure to persist a freshly generated identity is logged and
    /// visible through [`IdentityStore::is_persisted`], but the identity is
    /// still returned for the current session.
    pub fn get_or_create(&mut self) -> DeviceIdentity {
        self.get_or_create_with_origin().0
    }

    /// Like [`IdentityStore::get_or_create`], also reporting where the value
    /// came from. Returns `None` as origin for in-memory hits.
    pub fn get_or_create_with_origin(&mut self) -> (DeviceIdentity, Option<IdentityOrigin>) {
        if let Some(identity) = &self.cached {
            return (identity.clone(), None);
        }

        let (identity, origin) = self.load_or_generate();
        self.persisted = !matches!(origin, IdentityOrigin::SessionOnly(_));
        self.cached = Some(identity.clone());
        (identity, Some(origin))
    }

    /// Whether the identity in use is known to be persisted.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    fn load_or_generate(&self) -> (DeviceIdentity, IdentityOrigin) {
        if let Some(stored) = get_string(&self.store, KEY_UUID) {
            match DeviceIdentity::parse(&stored) {
                Some(identity) => {
                    info!(device_id = %identity, "Loaded device identity");
                    return (identity, IdentityOrigin::Loaded);
                }
                None => {
                    warn!(stored = %stored, "Stored device identity is malformed, regenerating");
                }
            }
        }

        let identity = DeviceIdentity::generate();
        match self.store.set(KEY_UUID, identity.as_str().as_bytes().to_vec()) {
            Ok(()) => {
                info!(device_id = %identity, "Generated and stored device identity");
                (identity, IdentityOrigin::Generated)
            }
            Err(e) => {
                warn!(
                    device_id = %identity,
                    error = %e,
                    "Failed to persist device identity, using it for this session only"
                );
                (identity, IdentityOrigin::SessionOnly(e))
            }
        }
    }
}

/// Descriptive plant metadata attached to every snapshot when configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_variety: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plant_location: Option<String>,
}

impl DeviceProfile {
    /// Load the profile from persistent storage. Missing keys stay unset.
    pub fn load(store: &impl KeyValueStore) -> Self {
        Self {
            plant_name: get_string(store, KEY_PLANT_NAME),
            plant_variety: get_string(store, KEY_PLANT_VARIETY),
            plant_location: get_string(store, KEY_PLANT_LOCATION),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plant_name.is_none() && self.plant_variety.is_none() && self.plant_location.is_none()
    }
}
