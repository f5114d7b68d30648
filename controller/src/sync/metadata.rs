//! Metadata holds the label and annotation rules of the syncer: which keys
//! are reserved for the agent, and how identity is stamped onto service-side
//! copies.

use std::collections::BTreeMap;

use kube::core::DynamicObject;

use crate::{
    agent_name_label, mapper::{hash20, RemoteCoordinates}, remote_cluster_label,
    remote_name_annotation, remote_name_hash_label, remote_namespace_annotation,
    remote_namespace_hash_label, workspace_path_annotation, CLAIMED_LABEL_PREFIX,
    CLUSTER_ANNOTATION, LAST_APPLIED_ANNOTATION,
};

/// Reserved_label reports whether a label key belongs to the agent or the
/// platform's claim machinery and must never be copied between planes.
pub fn reserved_label(key: &str) -> bool {
    key == remote_cluster_label()
        || key == remote_namespace_hash_label()
        || key == remote_name_hash_label()
        || key == agent_name_label()
        || key.starts_with(CLAIMED_LABEL_PREFIX)
}

/// Reserved_annotation reports whether an annotation key is bookkeeping that
/// must never be copied between planes.
pub fn reserved_annotation(key: &str) -> bool {
    key == LAST_APPLIED_ANNOTATION
        || key == CLUSTER_ANNOTATION
        || key == remote_namespace_annotation()
        || key == remote_name_annotation()
        || key == workspace_path_annotation()
        || key.starts_with("related-resources.servicebridge.io/")
}

/// Filter_labels drops every reserved key.
pub fn filter_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| !reserved_label(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Filter_annotations drops every reserved key.
pub fn filter_annotations(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    annotations
        .iter()
        .filter(|(k, _)| !reserved_annotation(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Apply_identity stamps the identity label triple, the agent-name label and
/// the reverse-lookup annotations onto a service-side copy.
pub fn apply_identity(
    obj: &mut DynamicObject,
    coords: &RemoteCoordinates,
    agent_name: &str,
    workspace_path: Option<&str>,
) {
    let labels = obj.metadata.labels.get_or_insert_default();
    labels.insert(agent_name_label().to_string(), agent_name.to_string());
    labels.insert(remote_cluster_label().to_string(), coords.cluster.clone());
    labels.insert(
        remote_namespace_hash_label().to_string(),
        hash20(coords.namespace_or_empty()),
    );
    labels.insert(remote_name_hash_label().to_string(), hash20(&coords.name));

    let annotations = obj.metadata.annotations.get_or_insert_default();
    annotations.insert(
        remote_namespace_annotation().to_string(),
        coords.namespace_or_empty().to_string(),
    );
    annotations.insert(remote_name_annotation().to_string(), coords.name.clone());
    match workspace_path {
        Some(path) => {
            annotations.insert(workspace_path_annotation().to_string(), path.to_string());
        }
        None => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys() {
        assert!(reserved_label("syncagent.servicebridge.io/remote-object-cluster"));
        assert!(reserved_label("claimed.platform.servicebridge.io/anything"));
        assert!(!reserved_label("find"));
        assert!(!reserved_label("app.kubernetes.io/name"));

        assert!(reserved_annotation("kcp.io/cluster"));
        assert!(reserved_annotation("kubectl.kubernetes.io/last-applied-configuration"));
        assert!(reserved_annotation("related-resources.servicebridge.io/credentials"));
        assert!(!reserved_annotation("mycompany.example/owner"));
    }

    #[test]
    fn filters_keep_domain_keys() {
        let labels = BTreeMap::from([
            ("find".to_string(), "me".to_string()),
            (remote_cluster_label().to_string(), "c1".to_string()),
        ]);
        let filtered = filter_labels(&labels);
        assert_eq!(filtered, BTreeMap::from([("find".to_string(), "me".to_string())]));
    }

    #[test]
    fn identity_is_complete() {
        let mut obj = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::Value::Object(Default::default()),
        };
        let coords = RemoteCoordinates {
            cluster: "root-tenant-a".into(),
            namespace: Some("default".into()),
            name: "my-crontab".into(),
        };
        apply_identity(&mut obj, &coords, "agent-1", Some("root:tenant-a"));

        let labels = obj.metadata.labels.expect("labels stamped");
        assert_eq!(labels.get(agent_name_label()).map(String::as_str), Some("agent-1"));
        assert_eq!(
            labels.get(remote_cluster_label()).map(String::as_str),
            Some("root-tenant-a"),
        );
        assert_eq!(
            labels.get(remote_namespace_hash_label()),
            Some(&hash20("default")),
        );
        let annotations = obj.metadata.annotations.expect("annotations stamped");
        assert_eq!(
            annotations.get(remote_name_annotation()).map(String::as_str),
            Some("my-crontab"),
        );
        assert_eq!(
            annotations.get(workspace_path_annotation()).map(String::as_str),
            Some("root:tenant-a"),
        );
    }
}
