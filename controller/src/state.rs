//! State implements the last-known-state store backing the three-way merge.
//!
//! The default backend persists one JSON blob per synced source object in a
//! service-side secret, one secret per (source cluster, source GVK). Updates
//! are read-modify-write; the API server's optimistic concurrency serializes
//! concurrent writers.

use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString};
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::{mapper::hash20, object_state_label, prelude::*, Result};

/// Metadata fields that are never part of a snapshot.
const VOLATILE_METADATA: [&str; 8] = [
    "creationTimestamp",
    "resourceVersion",
    "managedFields",
    "uid",
    "selfLink",
    "ownerReferences",
    "generation",
    "finalizers",
];

/// StateKey identifies the snapshot of one source object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateKey {
    /// Cluster is the logical cluster of the source object.
    pub cluster: String,
    /// Gvk of the source object.
    pub gvk: GroupVersionKind,
    /// Namespace of the source object, if namespaced.
    pub namespace: Option<String>,
    /// Name of the source object.
    pub name: String,
}

impl StateKey {
    /// Secret_name is the deterministic name of the backing secret.
    pub fn secret_name(&self) -> String {
        let gvk = format!("{}/{}/{}", self.gvk.group, self.gvk.version, self.gvk.kind);
        format!("obj-state-{}-{}", self.cluster, hash20(gvk))
    }

    /// Data_key is the deterministic key of this object's blob within the
    /// backing secret.
    pub fn data_key(&self) -> String {
        let ns = self.namespace.as_deref().unwrap_or("");
        hash20(format!("{ns}/{}", self.name))
    }
}

/// Strip_object removes volatile metadata and the given subresources from an
/// object document, in place.
///
/// The result is what a snapshot holds: the source object exactly as the
/// reconciler last wrote it downstream, without server-managed noise.
pub fn strip_object<S: AsRef<str>>(doc: &mut Value, subresources: &[S]) {
    if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in VOLATILE_METADATA {
            meta.remove(field);
        }
    }
    if let Some(map) = doc.as_object_mut() {
        for sub in subresources {
            map.remove(sub.as_ref());
        }
    }
}

fn decode_blob(blob: &[u8]) -> Option<Value> {
    match serde_json::from_slice(blob) {
        Ok(v) => Some(v),
        Err(err) => {
            // A malformed snapshot forces a full resync on the next write.
            warn!(%err, "discarding malformed state blob");
            None
        }
    }
}

/// StateStore is the snapshot backend used by the reconcilers.
#[derive(Clone)]
pub enum StateStore {
    /// Snapshots live in service-side secrets.
    Secret(SecretStateStore),
    /// Snapshots live in process memory; tests only.
    #[cfg(test)]
    Memory(std::sync::Arc<MemoryStateStore>),
}

impl StateStore {
    /// New_secret constructs the default secret-backed store.
    pub fn new_secret(client: kube::Client, namespace: String) -> Self {
        StateStore::Secret(SecretStateStore { client, namespace })
    }

    /// Get returns the most recent snapshot for a source identity, or absent.
    pub async fn get(&self, key: &StateKey) -> Result<Option<Value>> {
        match self {
            StateStore::Secret(s) => s.get(key).await,
            #[cfg(test)]
            StateStore::Memory(m) => Ok(m.get(key)),
        }
    }

    /// Put persists a snapshot of the object, stripped of volatile metadata
    /// and the listed subresources.
    pub async fn put<S: AsRef<str>>(
        &self,
        obj: &DynamicObject,
        key: &StateKey,
        subresources: &[S],
    ) -> Result<()> {
        let mut doc = serde_json::to_value(obj)?;
        strip_object(&mut doc, subresources);
        match self {
            StateStore::Secret(s) => s.put(key, doc).await,
            #[cfg(test)]
            StateStore::Memory(m) => {
                m.put(key, doc);
                Ok(())
            }
        }
    }
}

/// SecretStateStore is the secret-backed snapshot store.
#[derive(Clone)]
pub struct SecretStateStore {
    client: kube::Client,
    namespace: String,
}

impl SecretStateStore {
    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    #[instrument(skip(self), fields(secret = key.secret_name()))]
    async fn get(&self, key: &StateKey) -> Result<Option<Value>> {
        let Some(secret) = self.api().get_opt(&key.secret_name()).await? else {
            return Ok(None);
        };
        Ok(secret
            .data
            .as_ref()
            .and_then(|data| data.get(&key.data_key()))
            .and_then(|blob| decode_blob(&blob.0)))
    }

    #[instrument(skip(self, doc), fields(secret = key.secret_name()))]
    async fn put(&self, key: &StateKey, doc: Value) -> Result<()> {
        let api = self.api();
        let name = key.secret_name();
        let blob = ByteString(serde_json::to_vec(&doc)?);
        match api.get_opt(&name).await? {
            Some(mut secret) => {
                secret.metadata.managed_fields = None;
                secret
                    .data
                    .get_or_insert_default()
                    .insert(key.data_key(), blob);
                api.replace(&name, &CREATE_PARAMS, &secret).await?;
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name),
                        namespace: Some(self.namespace.clone()),
                        labels: Some(BTreeMap::from([(
                            object_state_label().to_string(),
                            "true".to_string(),
                        )])),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(key.data_key(), blob)])),
                    ..Default::default()
                };
                api.create(&CREATE_PARAMS, &secret).await?;
            }
        }
        Ok(())
    }
}

/// MemoryStateStore keeps snapshots in a map; tests only.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStateStore {
    blobs: std::sync::Mutex<std::collections::HashMap<(String, String), Value>>,
}

#[cfg(test)]
impl MemoryStateStore {
    fn entry_key(key: &StateKey) -> (String, String) {
        (key.secret_name(), key.data_key())
    }

    /// Get returns the stored snapshot, if any.
    pub fn get(&self, key: &StateKey) -> Option<Value> {
        self.blobs
            .lock()
            .expect("state mutex is never poisoned")
            .get(&Self::entry_key(key))
            .cloned()
    }

    /// Put stores a snapshot.
    pub fn put(&self, key: &StateKey, doc: Value) {
        self.blobs
            .lock()
            .expect("state mutex is never poisoned")
            .insert(Self::entry_key(key), doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> StateKey {
        StateKey {
            cluster: "root-tenant-a".into(),
            gvk: GroupVersionKind::gvk("example.com", "v1", "CronTab"),
            namespace: Some("default".into()),
            name: "my-crontab".into(),
        }
    }

    #[test]
    fn secret_name_is_deterministic_and_bounded() {
        let k = key();
        let name = k.secret_name();
        assert!(name.starts_with("obj-state-root-tenant-a-"));
        assert_eq!(name, k.secret_name());
        let hash = name.rsplit('-').next().expect("name has a hash suffix");
        assert_eq!(hash.len(), 20);
    }

    #[test]
    fn data_key_separates_objects() {
        let a = key();
        let mut b = key();
        b.name = "other".into();
        assert_ne!(a.data_key(), b.data_key());
        let mut c = key();
        c.namespace = Some("other".into());
        assert_ne!(a.data_key(), c.data_key());
    }

    #[test]
    fn strip_removes_volatile_fields_and_subresources() {
        let mut doc = json!({
            "apiVersion": "example.com/v1",
            "kind": "CronTab",
            "metadata": {
                "name": "my-crontab",
                "namespace": "default",
                "uid": "42",
                "resourceVersion": "1001",
                "generation": 3,
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "finalizers": ["syncagent.servicebridge.io/cleanup"],
                "labels": {"keep": "me"},
            },
            "spec": {"cronSpec": "* * *"},
            "status": {"phase": "Active"},
        });
        strip_object(&mut doc, &["status"]);
        assert_eq!(
            doc,
            json!({
                "apiVersion": "example.com/v1",
                "kind": "CronTab",
                "metadata": {
                    "name": "my-crontab",
                    "namespace": "default",
                    "labels": {"keep": "me"},
                },
                "spec": {"cronSpec": "* * *"},
            }),
        );
    }

    #[test]
    fn malformed_blob_is_absent() {
        assert_eq!(decode_blob(b"{\"ok\": true}"), Some(json!({"ok": true})));
        assert_eq!(decode_blob(b"not json"), None);
    }

    #[tokio::test]
    async fn memory_roundtrip() {
        let store = StateStore::Memory(std::sync::Arc::new(MemoryStateStore::default()));
        let k = key();
        assert!(store.get(&k).await.expect("get works").is_none());

        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "CronTab",
            "metadata": {"name": "my-crontab", "namespace": "default", "resourceVersion": "5"},
            "spec": {"cronSpec": "* * *"},
            "status": {"phase": "Active"},
        }))
        .expect("object parses");
        store.put(&obj, &k, &["status"]).await.expect("put works");

        let got = store.get(&k).await.expect("get works").expect("blob present");
        assert_eq!(got["spec"]["cronSpec"], "* * *");
        assert!(got.get("status").is_none());
        assert!(got["metadata"].get("resourceVersion").is_none());
    }
}
