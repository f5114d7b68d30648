//! Mapper expands the naming templates of a PublishedResource into concrete
//! service-side namespace/name pairs.

use api::v1alpha1;

use crate::sha256_hex;

/// RemoteCoordinates identifies a platform object: its logical cluster, its
/// namespace (absent for cluster-scoped objects) and its name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteCoordinates {
    /// Cluster is the logical cluster name.
    pub cluster: String,
    /// Namespace of the remote object, if namespaced.
    pub namespace: Option<String>,
    /// Name of the remote object.
    pub name: String,
}

impl RemoteCoordinates {
    /// Namespace_or_empty is the namespace, or "" for cluster-scoped objects.
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

/// Hash20 is the bounded-length stand-in for arbitrarily long namespace and
/// name inputs: the first 20 hex characters of the digest.
pub fn hash20<S: AsRef<str>>(input: S) -> String {
    let mut h = sha256_hex(input.as_ref().as_bytes());
    h.truncate(20);
    h
}

/// Resolve expands every placeholder in the pattern.
///
/// Longer tokens are substituted first so that `$remoteNamespaceHash` is
/// never clipped by `$remoteNamespace`. Substitution is global within the
/// pattern.
pub fn resolve(pattern: &str, coords: &RemoteCoordinates) -> String {
    let ns = coords.namespace_or_empty();
    pattern
        .replace(v1alpha1::PLACEHOLDER_REMOTE_CLUSTER_NAME, &coords.cluster)
        .replace(v1alpha1::PLACEHOLDER_REMOTE_NAMESPACE_HASH, &hash20(ns))
        .replace(v1alpha1::PLACEHOLDER_REMOTE_NAMESPACE, ns)
        .replace(v1alpha1::PLACEHOLDER_REMOTE_NAME_HASH, &hash20(&coords.name))
        .replace(v1alpha1::PLACEHOLDER_REMOTE_NAME, &coords.name)
}

/// Destination computes the service-side (namespace, name) pair for a
/// publication's naming templates.
pub fn destination(
    spec: &v1alpha1::PublishedResourceSpec,
    coords: &RemoteCoordinates,
) -> (String, String) {
    (
        resolve(spec.namespace_template(), coords),
        resolve(spec.name_template(), coords),
    )
}
