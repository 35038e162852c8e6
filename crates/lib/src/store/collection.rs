//! Versioned JSON collections over a [`StorageBackend`].
//!
//! On disk every collection is `{"version": N, "data": ...}`. Blobs written without the
//! envelope (bare arrays or maps) are read as version 0 and upgraded through
//! [`Versioned::from_legacy`]. Loading never fails: absent, unreadable or malformed blobs
//! yield the default value and a log line.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{StorageBackend, StoreError};

/// Current envelope version written by [`Collection::save`].
pub const CURRENT_VERSION: u64 = 1;

/// Data that can live in a [`Collection`].
pub trait Versioned: Serialize + DeserializeOwned + Default + Send + Sync {
    /// Upgrade a blob that predates the envelope.
    fn from_legacy(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Inner state of a blob written by a zustand-style persist wrapper
/// (`{"state": {...}, "version": 0}`); any other value is returned unchanged.
pub fn legacy_state(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut map)
            if map.get("state").map(|s| s.is_object()).unwrap_or(false) =>
        {
            map.remove("state").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u64,
    data: &'a T,
}

/// A named collection with serialized, revision-ordered writes.
pub struct Collection<T> {
    namespace: String,
    backend: Arc<dyn StorageBackend>,
    /// Highest revision written so far.
    written: Mutex<u64>,
    _data: PhantomData<fn() -> T>,
}

impl<T: Versioned> Collection<T> {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
            written: Mutex::new(0),
            _data: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Read the collection, falling back to `T::default()` on any problem.
    pub async fn load(&self) -> T {
        let blob = match self.backend.get(&self.namespace).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                log::debug!("store: {} not found, starting empty", self.namespace);
                return T::default();
            }
            Err(e) => {
                log::error!("store: reading {} failed, starting empty: {}", self.namespace, e);
                return T::default();
            }
        };
        match decode::<T>(&blob) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("store: {} is malformed, starting empty: {}", self.namespace, e);
                T::default()
            }
        }
    }

    /// Write `data` as revision `revision`.
    ///
    /// Writes queue behind each other; a revision older than the last one written is
    /// dropped since the newer snapshot already contains its changes. Revision 0 always
    /// writes.
    pub async fn save(&self, revision: u64, data: &T) -> Result<(), StoreError> {
        let mut written = self.written.lock().await;
        if revision != 0 && revision <= *written {
            log::debug!(
                "store: skipping stale write of {} (revision {} <= {})",
                self.namespace,
                revision,
                *written
            );
            return Ok(());
        }
        let blob = encode(data)?;
        self.backend.set(&self.namespace, blob).await?;
        *written = (*written).max(revision);
        Ok(())
    }

    /// [`save`](Self::save) that logs failures instead of returning them.
    pub async fn save_best_effort(&self, revision: u64, data: &T) {
        if let Err(e) = self.save(revision, data).await {
            log::error!("store: writing {} failed: {}", self.namespace, e);
        }
    }

    /// Remove the collection from the backend.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _written = self.written.lock().await;
        self.backend.remove(&self.namespace).await
    }
}

pub(crate) fn encode<T: Serialize>(data: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&EnvelopeRef {
        version: CURRENT_VERSION,
        data,
    })?)
}

pub(crate) fn decode<T: Versioned>(blob: &str) -> Result<T, StoreError> {
    let value: serde_json::Value = serde_json::from_str(blob)?;
    let enveloped = value
        .as_object()
        .filter(|o| o.len() == 2 && o.contains_key("data"))
        .and_then(|o| o.get("version"))
        .and_then(|v| v.as_u64());
    match enveloped {
        Some(version) if version > CURRENT_VERSION => Err(StoreError::UnsupportedVersion(version)),
        Some(_) => {
            let data = value
                .get("data")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            Ok(serde_json::from_value(data)?)
        }
        None => Ok(T::from_legacy(value)?),
    }
}
