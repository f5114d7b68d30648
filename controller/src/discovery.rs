//! Discovery resolves a local GroupVersionKind into a complete structural
//! schema, expressed as a single-version CustomResourceDefinition.
//!
//! An on-cluster CRD is preferred; types served by aggregated apiservers fall
//! back to the server's OpenAPI document.

use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
        CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps,
    },
    apimachinery::pkg::apis::meta::v1::{APIResourceList, ObjectMeta},
};
use kube::api::Api;
use serde_json::Value;
use tracing::{debug, instrument, trace};

use crate::{prelude::*, Error, Result};

/// Annotations preserved when a fetched CRD is trimmed.
const KEEP_ANNOTATIONS: [&str; 1] = ["api-approved.kubernetes.io"];

/// Inlining depth for OpenAPI `$ref` resolution; recursive models degrade to
/// a permissive schema below this.
const MAX_REF_DEPTH: usize = 16;

/// Discover resolves the GVK into a CRD trimmed to exactly the requested
/// version.
#[instrument(skip(client), fields(group = gvk.group, version = gvk.version, kind = gvk.kind))]
pub async fn discover(client: &kube::Client, gvk: &GroupVersionKind) -> Result<CustomResourceDefinition> {
    let listing = list_resources(client, gvk).await?;
    let resource = named_resource(&listing, gvk)?;

    let crd_name = crd_name(&resource.plural, &gvk.group);
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    if let Some(crd) = crds.get_opt(&crd_name).await? {
        debug!(name = crd_name, "using on-cluster CRD");
        return trim_crd(crd, &gvk.version);
    }

    debug!(name = crd_name, "no on-cluster CRD, converting OpenAPI models");
    let schema = schema_from_openapi(client, gvk).await?;
    Ok(synthesize_crd(gvk, &resource, schema))
}

/// NamedResource is the discovery listing entry for one resource, plus its
/// subresource flags.
#[derive(Clone, Debug, Default)]
pub struct NamedResource {
    /// Plural resource name.
    pub plural: String,
    /// Singular resource name.
    pub singular: String,
    /// Short names served by the apiserver.
    pub short_names: Vec<String>,
    /// Categories the resource appears in.
    pub categories: Vec<String>,
    /// Namespaced reports the scope.
    pub namespaced: bool,
    /// Has_status reports a `<plural>/status` entry in the listing.
    pub has_status: bool,
    /// Has_scale reports a `<plural>/scale` entry in the listing.
    pub has_scale: bool,
}

async fn list_resources(client: &kube::Client, gvk: &GroupVersionKind) -> Result<APIResourceList> {
    let res = if gvk.group.is_empty() {
        client.list_core_api_resources(&gvk.version).await
    } else {
        client
            .list_api_group_resources(&format!("{}/{}", gvk.group, gvk.version))
            .await
    };
    res.map_err(Error::Kube)
}

/// Named_resource finds the listing entry for the GVK and its subresources.
pub fn named_resource(listing: &APIResourceList, gvk: &GroupVersionKind) -> Result<NamedResource> {
    let entry = listing
        .resources
        .iter()
        .find(|r| r.kind == gvk.kind && !r.name.contains('/'))
        .ok_or_else(|| {
            Error::UnknownResource(format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind))
        })?;
    let sub = |name: &str| {
        let wanted = format!("{}/{name}", entry.name);
        listing.resources.iter().any(|r| r.name == wanted)
    };
    Ok(NamedResource {
        plural: entry.name.clone(),
        singular: if entry.singular_name.is_empty() {
            gvk.kind.to_ascii_lowercase()
        } else {
            entry.singular_name.clone()
        },
        short_names: entry.short_names.clone().unwrap_or_default(),
        categories: entry.categories.clone().unwrap_or_default(),
        namespaced: entry.namespaced,
        has_status: sub("status"),
        has_scale: sub("scale"),
    })
}

fn crd_name(plural: &str, group: &str) -> String {
    if group.is_empty() {
        format!("{plural}.core")
    } else {
        format!("{plural}.{group}")
    }
}

/// Trim_crd reduces a fetched CRD to the requested version only and scrubs
/// server-managed metadata.
pub fn trim_crd(crd: CustomResourceDefinition, version: &str) -> Result<CustomResourceDefinition> {
    let non_structural = crd
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cnds| {
            cnds.iter()
                .any(|c| c.type_ == "NonStructuralSchema" && c.status == "True")
        });

    let mut ver = crd
        .spec
        .versions
        .iter()
        .find(|v| v.name == version)
        .cloned()
        .ok_or_else(|| {
            Error::UnknownResource(format!(
                "CRD {} does not serve version {version}",
                crd.metadata.name.as_deref().unwrap_or("<unnamed>"),
            ))
        })?;
    ver.served = true;
    ver.storage = true;
    if non_structural {
        trace!("CRD is non-structural, substituting permissive schema");
        ver.schema = Some(CustomResourceValidation {
            open_api_v3_schema: Some(permissive_schema()),
        });
    }

    let annotations: BTreeMap<String, String> = crd
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| KEEP_ANNOTATIONS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(CustomResourceDefinition {
        metadata: ObjectMeta {
            name: crd.metadata.name.clone(),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            conversion: None,
            versions: vec![ver],
            ..crd.spec
        },
        status: None,
    })
}

fn synthesize_crd(
    gvk: &GroupVersionKind,
    resource: &NamedResource,
    schema: JSONSchemaProps,
) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(crd_name(&resource.plural, &gvk.group)),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: gvk.group.clone(),
            names: CustomResourceDefinitionNames {
                plural: resource.plural.clone(),
                singular: Some(resource.singular.clone()),
                kind: gvk.kind.clone(),
                list_kind: Some(format!("{}List", gvk.kind)),
                short_names: (!resource.short_names.is_empty())
                    .then(|| resource.short_names.clone()),
                categories: (!resource.categories.is_empty()).then(|| resource.categories.clone()),
            },
            scope: if resource.namespaced {
                "Namespaced".to_string()
            } else {
                "Cluster".to_string()
            },
            versions: vec![CustomResourceDefinitionVersion {
                name: gvk.version.clone(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(schema),
                }),
                subresources: subresources(resource),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

fn subresources(resource: &NamedResource) -> Option<CustomResourceSubresources> {
    if !resource.has_status && !resource.has_scale {
        return None;
    }
    Some(CustomResourceSubresources {
        status: resource
            .has_status
            .then(|| CustomResourceSubresourceStatus(Value::Object(Default::default()))),
        scale: None,
    })
}

async fn schema_from_openapi(client: &kube::Client, gvk: &GroupVersionKind) -> Result<JSONSchemaProps> {
    let path = if gvk.group.is_empty() {
        format!("/openapi/v3/api/{}", gvk.version)
    } else {
        format!("/openapi/v3/apis/{}/{}", gvk.group, gvk.version)
    };
    let req = http::Request::get(path).body(Vec::new())?;
    let doc: Value = client.request(req).await?;
    openapi_schema_for(&doc, gvk)
}

/// Openapi_schema_for extracts and inlines the model for the GVK out of an
/// OpenAPI v3 document.
pub fn openapi_schema_for(doc: &Value, gvk: &GroupVersionKind) -> Result<JSONSchemaProps> {
    let schemas = doc
        .get("components")
        .and_then(|c| c.get("schemas"))
        .and_then(Value::as_object)
        .ok_or_else(|| {
            Error::UnknownResource(format!(
                "OpenAPI document has no models for {}/{}",
                gvk.group, gvk.version
            ))
        })?;

    let model = schemas
        .values()
        .find(|model| {
            model
                .get("x-kubernetes-group-version-kind")
                .and_then(Value::as_array)
                .is_some_and(|gvks| {
                    gvks.iter().any(|entry| {
                        entry.get("group").and_then(Value::as_str) == Some(gvk.group.as_str())
                            && entry.get("version").and_then(Value::as_str)
                                == Some(gvk.version.as_str())
                            && entry.get("kind").and_then(Value::as_str) == Some(gvk.kind.as_str())
                    })
                })
        })
        .ok_or_else(|| {
            Error::UnknownResource(format!(
                "no OpenAPI model for {}/{}, Kind={}",
                gvk.group, gvk.version, gvk.kind
            ))
        })?;

    let inlined = resolve_refs(model, schemas, MAX_REF_DEPTH);
    match serde_json::from_value(inlined) {
        Ok(props) => Ok(props),
        Err(err) => {
            debug!(%err, "model did not convert cleanly, using permissive schema");
            Ok(permissive_schema())
        }
    }
}

/// Resolve_refs inlines `#/components/schemas/` references. Recursion beyond
/// the depth limit degrades to a permissive subtree.
fn resolve_refs(v: &Value, schemas: &serde_json::Map<String, Value>, depth: usize) -> Value {
    match v {
        Value::Object(map) => {
            if let Some(target) = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("#/components/schemas/"))
            {
                if depth == 0 {
                    return serde_json::json!({"x-kubernetes-preserve-unknown-fields": true});
                }
                return match schemas.get(target) {
                    Some(target) => resolve_refs(target, schemas, depth - 1),
                    None => serde_json::json!({"x-kubernetes-preserve-unknown-fields": true}),
                };
            }
            Value::Object(
                map.iter()
                    .map(|(k, val)| (k.clone(), resolve_refs(val, schemas, depth)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_refs(item, schemas, depth))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn permissive_schema() -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".to_string()),
        x_kubernetes_preserve_unknown_fields: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing() -> APIResourceList {
        serde_json::from_value(json!({
            "groupVersion": "example.com/v1",
            "resources": [
                {
                    "name": "crontabs",
                    "singularName": "crontab",
                    "namespaced": true,
                    "kind": "CronTab",
                    "verbs": ["get", "list", "watch", "create", "update", "patch", "delete"],
                    "shortNames": ["ct"],
                    "categories": ["all"],
                },
                {
                    "name": "crontabs/status",
                    "singularName": "",
                    "namespaced": true,
                    "kind": "CronTab",
                    "verbs": ["get", "update", "patch"],
                },
            ],
        }))
        .expect("listing parses")
    }

    #[test]
    fn resolves_names_and_subresources() {
        let gvk = GroupVersionKind::gvk("example.com", "v1", "CronTab");
        let r = named_resource(&listing(), &gvk).expect("resource resolves");
        assert_eq!(r.plural, "crontabs");
        assert_eq!(r.singular, "crontab");
        assert_eq!(r.short_names, vec!["ct"]);
        assert!(r.namespaced);
        assert!(r.has_status);
        assert!(!r.has_scale);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Unknown");
        let err = named_resource(&listing(), &gvk).unwrap_err();
        assert!(matches!(err, Error::UnknownResource(_)));
    }

    fn crd() -> CustomResourceDefinition {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {
                "name": "crontabs.example.com",
                "uid": "42",
                "resourceVersion": "1000",
                "annotations": {
                    "api-approved.kubernetes.io": "unapproved",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                },
            },
            "spec": {
                "group": "example.com",
                "names": {"plural": "crontabs", "singular": "crontab", "kind": "CronTab", "listKind": "CronTabList"},
                "scope": "Namespaced",
                "conversion": {"strategy": "Webhook"},
                "versions": [
                    {
                        "name": "v1beta1",
                        "served": true,
                        "storage": false,
                        "schema": {"openAPIV3Schema": {"type": "object"}},
                    },
                    {
                        "name": "v1",
                        "served": true,
                        "storage": true,
                        "schema": {"openAPIV3Schema": {"type": "object", "properties": {"spec": {"type": "object"}}}},
                        "subresources": {"status": {}},
                    },
                ],
            },
            "status": {"conditions": []},
        }))
        .expect("crd parses")
    }

    #[test]
    fn trim_keeps_only_requested_version() {
        let out = trim_crd(crd(), "v1").expect("trim succeeds");
        assert_eq!(out.spec.versions.len(), 1);
        let ver = &out.spec.versions[0];
        assert_eq!(ver.name, "v1");
        assert!(ver.served && ver.storage);
        assert!(ver.subresources.is_some());
        assert!(out.spec.conversion.is_none());
        assert!(out.status.is_none());
        let ann = out.metadata.annotations.expect("whitelisted annotations kept");
        assert_eq!(ann.len(), 1);
        assert!(ann.contains_key("api-approved.kubernetes.io"));
    }

    #[test]
    fn trim_rejects_unserved_version() {
        let err = trim_crd(crd(), "v2").unwrap_err();
        assert!(matches!(err, Error::UnknownResource(_)));
    }

    #[test]
    fn non_structural_gets_permissive_schema() {
        let mut c = crd();
        c.status = serde_json::from_value(json!({
            "conditions": [{"type": "NonStructuralSchema", "status": "True", "reason": "x", "message": "y", "lastTransitionTime": "2024-01-01T00:00:00Z"}],
        }))
        .expect("status parses");
        let out = trim_crd(c, "v1").expect("trim succeeds");
        let schema = out.spec.versions[0]
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.as_ref())
            .expect("schema present");
        assert_eq!(schema.x_kubernetes_preserve_unknown_fields, Some(true));
    }

    #[test]
    fn openapi_model_is_found_and_inlined() {
        let gvk = GroupVersionKind::gvk("example.com", "v1", "CronTab");
        let doc = json!({
            "components": {
                "schemas": {
                    "com.example.v1.CronTab": {
                        "type": "object",
                        "x-kubernetes-group-version-kind": [
                            {"group": "example.com", "version": "v1", "kind": "CronTab"},
                        ],
                        "properties": {
                            "spec": {"$ref": "#/components/schemas/com.example.v1.CronTabSpec"},
                        },
                    },
                    "com.example.v1.CronTabSpec": {
                        "type": "object",
                        "properties": {"cronSpec": {"type": "string"}},
                    },
                },
            },
        });
        let schema = openapi_schema_for(&doc, &gvk).expect("model found");
        let spec = schema
            .properties
            .as_ref()
            .and_then(|p| p.get("spec"))
            .expect("spec inlined");
        assert_eq!(spec.type_.as_deref(), Some("object"));
        assert!(spec.properties.as_ref().is_some_and(|p| p.contains_key("cronSpec")));
    }

    #[test]
    fn missing_openapi_model_is_not_found() {
        let gvk = GroupVersionKind::gvk("example.com", "v1", "CronTab");
        let err = openapi_schema_for(&json!({"components": {"schemas": {}}}), &gvk).unwrap_err();
        assert!(matches!(err, Error::UnknownResource(_)));
    }

    #[test]
    fn recursive_refs_degrade_to_permissive() {
        let schemas = json!({
            "loop": {"type": "object", "properties": {"next": {"$ref": "#/components/schemas/loop"}}},
        });
        let map = schemas.as_object().expect("map");
        let out = resolve_refs(map.get("loop").expect("loop"), map, 3);
        // The innermost expansion must terminate in a permissive subtree.
        let mut cur = &out;
        for _ in 0..3 {
            cur = cur.get("properties").and_then(|p| p.get("next")).expect("nested");
        }
        assert_eq!(cur.get("x-kubernetes-preserve-unknown-fields"), Some(&json!(true)));
    }
}
