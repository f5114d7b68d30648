//! Projection computes how a published type appears on the platform: the
//! projected GVK, canonical names, scope, and the content-addressed schema
//! identifier.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde_json::Value;

use api::platform::{
    ApiResourceNames, ApiResourceSchema, ApiResourceSchemaSpec, ApiResourceSubresources,
    ApiResourceVersion,
};
use api::v1alpha1::{PublishedResource, ResourceScope};

use crate::{prelude::*, sha256_hex, Result};

/// ProjectedResource is the platform-side identity of one publication.
#[derive(Clone, Debug)]
pub struct ProjectedResource {
    /// Gvk on the platform side.
    pub gvk: GroupVersionKind,
    /// Names on the platform side.
    pub names: ApiResourceNames,
    /// Scope on the platform side.
    pub scope: ResourceScope,
    /// Schema_name is the immutable identifier of the installed schema.
    pub schema_name: String,
}

impl ProjectedResource {
    /// Api_resource is the dynamic-client handle for the projected type.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk, &self.names.plural)
    }
}

/// Project computes the projected identity for a publication.
///
/// Names are derived from the (possibly projected) kind unless the projection
/// sets them explicitly; the API group is always the export's group.
pub fn project(
    pr: &PublishedResource,
    export_group: &str,
    crd: &CustomResourceDefinition,
) -> Result<ProjectedResource> {
    let src = &pr.spec.resource;
    let proj = pr.spec.projection.clone().unwrap_or_default();

    let version = proj.version.unwrap_or_else(|| src.version.clone());
    let kind = proj.kind.unwrap_or_else(|| src.kind.clone());
    let plural = proj
        .plural
        .unwrap_or_else(|| to_plural(&kind.to_ascii_lowercase()));

    let names = ApiResourceNames {
        plural: plural.clone(),
        singular: kind.to_ascii_lowercase(),
        kind: kind.clone(),
        list_kind: format!("{kind}List"),
        short_names: proj.short_names,
        categories: proj.categories,
    };
    let scope = proj.scope.unwrap_or(match crd.spec.scope.as_str() {
        "Namespaced" => ResourceScope::Namespaced,
        _ => ResourceScope::Cluster,
    });

    Ok(ProjectedResource {
        gvk: GroupVersionKind::gvk(export_group, &version, &kind),
        schema_name: schema_identifier(&names, export_group),
        names,
        scope,
    })
}

/// Schema_identifier derives the immutable name of a schema object:
/// `v<hex8>.<plural>.<group>`.
///
/// The hash is computed over the canonical JSON encoding of the names; the
/// leading `v` guards against identifiers that begin with a digit. Encoding
/// the names cannot fail for well-formed input, and a failure here indicates
/// a programming fault, so it panics.
pub fn schema_identifier(names: &ApiResourceNames, group: &str) -> String {
    let encoded = serde_json::to_vec(names).expect("names encode to canonical JSON");
    let mut digest = sha256_hex(encoded);
    digest.truncate(8);
    format!("v{digest}.{}.{group}", names.plural)
}

/// Resource_schema translates a trimmed CRD into the platform's schema
/// object shape for the projected identity.
pub fn resource_schema(
    projected: &ProjectedResource,
    crd: &CustomResourceDefinition,
    export_group: &str,
) -> Result<ApiResourceSchema> {
    let ver = crd
        .spec
        .versions
        .first()
        .ok_or_else(|| Error::UnknownResource("CRD has no versions".into()))?;
    let schema = match ver.schema.as_ref().and_then(|s| s.open_api_v3_schema.as_ref()) {
        Some(props) => serde_json::to_value(props)?,
        None => Value::Null,
    };
    let subresources = ver.subresources.as_ref().map(|sub| ApiResourceSubresources {
        status: sub.status.is_some(),
        scale: sub.scale.is_some(),
    });

    Ok(ApiResourceSchema::new(
        &projected.schema_name,
        ApiResourceSchemaSpec {
            group: export_group.to_string(),
            names: projected.names.clone(),
            scope: projected.scope,
            versions: vec![ApiResourceVersion {
                name: projected.gvk.version.clone(),
                served: true,
                storage: true,
                schema,
                subresources,
            }],
        },
    ))
}

// Simple pluralizer. Handles the special cases.
fn to_plural(word: &str) -> String {
    // Words ending in s, x, z, ch, sh will be pluralized with -es (eg. foxes).
    if word.ends_with('s')
        || word.ends_with('x')
        || word.ends_with('z')
        || word.ends_with("ch")
        || word.ends_with("sh")
    {
        return format!("{word}es");
    }

    // Words ending in y that are preceded by a consonant will be pluralized by
    // replacing y with -ies (eg. puppies).
    if word.ends_with('y') {
        if let Some(c) = word.chars().nth(word.len().saturating_sub(2)) {
            if !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u') {
                let mut chars = word.chars();
                chars.next_back();
                return format!("{}ies", chars.as_str());
            }
        }
    }

    format!("{word}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use api::v1alpha1::{PublishedResourceSpec, ResourceProjection, SourceResourceDescriptor};

    fn crontab_crd() -> CustomResourceDefinition {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "crontabs.example.com"},
            "spec": {
                "group": "example.com",
                "names": {"plural": "crontabs", "singular": "crontab", "kind": "CronTab", "listKind": "CronTabList"},
                "scope": "Namespaced",
                "versions": [{
                    "name": "v1",
                    "served": true,
                    "storage": true,
                    "schema": {"openAPIV3Schema": {"type": "object"}},
                    "subresources": {"status": {}},
                }],
            },
        }))
        .expect("crd parses")
    }

    fn published(projection: Option<ResourceProjection>) -> PublishedResource {
        PublishedResource::new(
            "publish-crontabs",
            PublishedResourceSpec {
                resource: SourceResourceDescriptor {
                    api_group: "example.com".into(),
                    version: "v1".into(),
                    kind: "CronTab".into(),
                },
                projection,
                ..Default::default()
            },
        )
    }

    #[test]
    fn identifier_shape() {
        let pr = published(None);
        let projected = project(&pr, "kcp.example.com", &crontab_crd()).expect("projection");
        let name = &projected.schema_name;
        assert!(name.ends_with(".crontabs.kcp.example.com"), "{name}");
        let (prefix, _) = name.split_once('.').expect("dotted identifier");
        assert_eq!(prefix.len(), 9);
        assert!(prefix.starts_with('v'));
        assert!(prefix.chars().skip(1).all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identifier_is_pure() {
        let pr = published(None);
        let crd = crontab_crd();
        let a = project(&pr, "kcp.example.com", &crd).expect("projection");
        let b = project(&pr, "kcp.example.com", &crd).expect("projection");
        assert_eq!(a.schema_name, b.schema_name);

        // Any change to the projected names must change the identifier.
        let c = published(Some(ResourceProjection {
            plural: Some("tabs".into()),
            ..Default::default()
        }));
        let c = project(&c, "kcp.example.com", &crd).expect("projection");
        assert_ne!(a.schema_name, c.schema_name);
    }

    #[test]
    fn projection_overrides() {
        let pr = published(Some(ResourceProjection {
            version: Some("v2".into()),
            kind: Some("Schedule".into()),
            scope: Some(ResourceScope::Cluster),
            short_names: vec!["sched".into()],
            ..Default::default()
        }));
        let p = project(&pr, "kcp.example.com", &crontab_crd()).expect("projection");
        assert_eq!(p.gvk.group, "kcp.example.com");
        assert_eq!(p.gvk.version, "v2");
        assert_eq!(p.gvk.kind, "Schedule");
        assert_eq!(p.names.plural, "schedules");
        assert_eq!(p.names.singular, "schedule");
        assert_eq!(p.names.short_names, vec!["sched"]);
        assert_eq!(p.scope, ResourceScope::Cluster);
    }

    #[test]
    fn scope_follows_source_by_default() {
        let pr = published(None);
        let p = project(&pr, "kcp.example.com", &crontab_crd()).expect("projection");
        assert_eq!(p.scope, ResourceScope::Namespaced);
    }

    #[test]
    fn schema_carries_subresources() {
        let pr = published(None);
        let projected = project(&pr, "kcp.example.com", &crontab_crd()).expect("projection");
        let schema =
            resource_schema(&projected, &crontab_crd(), "kcp.example.com").expect("translation");
        assert_eq!(schema.metadata.name.as_deref(), Some(projected.schema_name.as_str()));
        assert_eq!(schema.spec.group, "kcp.example.com");
        assert_eq!(schema.spec.versions.len(), 1);
        let ver = &schema.spec.versions[0];
        assert!(ver.served && ver.storage);
        assert_eq!(ver.subresources.as_ref().map(|s| s.status), Some(true));
    }

    #[test]
    fn pluralizer() {
        for (word, plural) in [
            ("crontab", "crontabs"),
            ("box", "boxes"),
            ("gateway", "gateways"),
            ("policy", "policies"),
            ("dish", "dishes"),
            ("ingress", "ingresses"),
        ] {
            assert_eq!(to_plural(word), plural);
        }
    }
}
