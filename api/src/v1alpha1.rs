//! Module `v1alpha1` implements the v1alpha1 PublishedResource CRD API.
use k8s_openapi::apimachinery::pkg::apis::meta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// Placeholder for the logical cluster name of the remote object.
pub static PLACEHOLDER_REMOTE_CLUSTER_NAME: &str = "$remoteClusterName";
/// Placeholder for the namespace of the remote object.
pub static PLACEHOLDER_REMOTE_NAMESPACE: &str = "$remoteNamespace";
/// Placeholder for the hashed namespace of the remote object.
pub static PLACEHOLDER_REMOTE_NAMESPACE_HASH: &str = "$remoteNamespaceHash";
/// Placeholder for the name of the remote object.
pub static PLACEHOLDER_REMOTE_NAME: &str = "$remoteName";
/// Placeholder for the hashed name of the remote object.
pub static PLACEHOLDER_REMOTE_NAME_HASH: &str = "$remoteNameHash";

/// Default naming template for the service-side namespace of a synced object.
pub static DEFAULT_NAMESPACE_TEMPLATE: &str = "$remoteClusterName";
/// Default naming template for the service-side name of a synced object.
pub static DEFAULT_NAME_TEMPLATE: &str = "$remoteNamespaceHash-$remoteNameHash";

/// PublishedResourceSpec declares a locally-served API that should be made
/// available to platform tenants and continuously synchronized.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "syncagent.servicebridge.io",
    version = "v1alpha1",
    kind = "PublishedResource",
    status = "PublishedResourceStatus",
    shortname = "pubres",
    category = "syncagent",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PublishedResourceSpec {
    /// Resource identifies the service-side type to publish.
    pub resource: SourceResourceDescriptor,

    /// Projection overrides how the type appears on the platform side.
    ///
    /// The API group is always rewritten to the export's group and cannot be
    /// configured here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<ResourceProjection>,

    /// Naming configures where on the service side the copies of platform
    /// objects are placed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naming: Option<ResourceNaming>,

    /// Filter restricts which platform objects are synced at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ResourceFilter>,

    /// Mutation declares transformations applied while syncing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation: Option<ResourceMutationSpec>,

    /// Related declares auxiliary objects synced alongside each primary
    /// object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedResourceSpec>,

    /// EnableWorkspacePaths resolves the workspace path of the remote
    /// cluster and makes it available to naming and mutation contexts.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_workspace_paths: bool,
}

/// SourceResourceDescriptor names a single version of an API type served on
/// the service cluster.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResourceDescriptor {
    /// ApiGroup is the API group, empty for the core group.
    #[serde(default)]
    pub api_group: String,
    /// Version is the API version, e.g. "v1".
    pub version: String,
    /// Kind is the singular PascalCase kind, e.g. "CronTab".
    pub kind: String,
}

/// ResourceScope is the scope of an API type.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub enum ResourceScope {
    /// Objects are global.
    Cluster,
    /// Each object lives in a namespace.
    #[default]
    Namespaced,
}

/// ResourceProjection changes how a published type appears on the platform.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProjection {
    /// Version replaces the source version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Kind replaces the source kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Plural replaces the derived plural name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,
    /// ShortNames replaces the short names; the source's short names are not
    /// carried over.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    /// Categories replaces the categories.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Scope overrides the source scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ResourceScope>,
}

/// ResourceNaming holds the templates used to place synced copies on the
/// service cluster.
///
/// Both templates understand the `$remote...` placeholders; see the
/// placeholder constants in this module.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNaming {
    /// Namespace is the template for the service-side namespace.
    ///
    /// Defaults to `$remoteClusterName`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name is the template for the service-side name.
    ///
    /// Defaults to `$remoteNamespaceHash-$remoteNameHash`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// ResourceFilter excludes remote objects from the sync.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    /// Resource is matched against the labels of the remote object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<meta::v1::LabelSelector>,
    /// Namespace is matched against the labels of the remote object's
    /// namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<meta::v1::LabelSelector>,
}

/// ResourceMutationSpec holds the ordered mutations for both sync directions.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMutationSpec {
    /// Spec mutations apply in the platform-to-service direction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spec: Vec<ResourceMutation>,
    /// Status mutations apply in the service-to-platform direction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<ResourceMutation>,
}

/// ResourceMutation is a single transformation step.
///
/// Exactly one of the members must be set.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMutation {
    /// Regex applies a regular expression replacement to one path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<ResourceMutationRegex>,
    /// Template evaluates a template and stores the result at one path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<ResourceMutationTemplate>,
    /// Delete removes one path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<ResourceMutationDelete>,
}

/// ResourceMutationRegex is a regular expression replacement.
///
/// When the pattern is empty, the value at the path is replaced with the
/// literal replacement.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMutationRegex {
    /// Path addresses the value, in dotted notation (`spec.cronSpec`).
    pub path: String,
    /// Pattern is the regular expression; replace-all semantics.
    #[serde(default)]
    pub pattern: String,
    /// Replacement is the replacement text, `$1`-style group references
    /// allowed.
    #[serde(default)]
    pub replacement: String,
}

/// ResourceMutationTemplate evaluates a template.
///
/// The template context exposes `value`, `localObject` and `remoteObject`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMutationTemplate {
    /// Path addresses the value, in dotted notation.
    pub path: String,
    /// Template is the template body.
    pub template: String,
}

/// ResourceMutationDelete removes a path from the document.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMutationDelete {
    /// Path addresses the element to remove, in dotted notation.
    pub path: String,
}

/// RelatedResourceOrigin names the plane a related object originates on.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelatedResourceOrigin {
    /// The object is authored on the service cluster and synced up.
    #[default]
    Service,
    /// The object is authored on the platform and synced down.
    Platform,
}

/// RelatedResourceKind is the kind of a related object.
///
/// Only core-group credential and configuration blobs are supported.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub enum RelatedResourceKind {
    /// A core/v1 Secret.
    #[default]
    Secret,
    /// A core/v1 ConfigMap.
    ConfigMap,
}

/// RelatedResourceSpec attaches an auxiliary object to each primary object.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResourceSpec {
    /// Identifier must be unique within one PublishedResource; it names the
    /// relation in annotations.
    pub identifier: String,
    /// Origin is the plane the related object is authored on.
    pub origin: RelatedResourceOrigin,
    /// Kind of the related object.
    pub kind: RelatedResourceKind,
    /// Object locates the related object; the same locators are evaluated on
    /// the destination primary (or rewritten, for selectors) to place the
    /// copy.
    pub object: RelatedResourceObject,
    /// Mutation applies to this relation only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation: Option<ResourceMutationSpec>,
}

/// RelatedResourceObject locates a related object relative to its primary.
///
/// The name locator is inlined; the namespace locator is optional. Without a
/// namespace locator both sides use their primary object's namespace, which
/// requires the primary to be namespaced.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResourceObject {
    /// The name locator.
    #[serde(flatten)]
    pub name: RelatedResourceLocator,
    /// Namespace locates the namespace, when it differs from the primary's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<RelatedResourceLocator>,
}

/// RelatedResourceLocator resolves a single namespace or name.
///
/// Exactly one of the members must be set.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResourceLocator {
    /// Reference is a path into the primary object's document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<RelatedResourceReference>,
    /// Selector matches objects (or namespaces) by label and rewrites the
    /// match for the destination side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<RelatedResourceSelector>,
    /// Template is a template expression evaluated with the sync context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateExpression>,
}

/// RelatedResourceReference reads a value out of the primary object.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResourceReference {
    /// Path into the primary object, in dotted notation
    /// (`spec.credentials.secretName`).
    pub path: String,
    /// Regex optionally post-processes the referenced value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<RegularExpression>,
}

/// RelatedResourceSelector finds related objects by label.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResourceSelector {
    /// LabelSelector matches candidates on the origin side.
    #[serde(flatten)]
    pub label_selector: meta::v1::LabelSelector,
    /// Rewrite computes the destination-side value from each match.
    pub rewrite: RelatedResourceSelectorRewrite,
}

/// RelatedResourceSelectorRewrite computes the destination value for a
/// selector match.
///
/// Exactly one of the members must be set.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResourceSelectorRewrite {
    /// Regex rewrites the matched value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<RegularExpression>,
    /// Template renders the destination value; the matched value is exposed
    /// as `value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateExpression>,
}

/// RegularExpression is a pattern plus replacement.
///
/// When the pattern is empty, the input is replaced with the literal
/// replacement.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegularExpression {
    /// Pattern is the regular expression; replace-all semantics.
    #[serde(default)]
    pub pattern: String,
    /// Replacement is the replacement text.
    #[serde(default)]
    pub replacement: String,
}

/// TemplateExpression is a template body.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateExpression {
    /// Template is the template body.
    pub template: String,
}

/// PublishedResourceStatus describes the observed state of a publication.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedResourceStatus {
    /// ResourceSchemaName is the name of the schema object installed in the
    /// platform for this publication. It never changes for a given source
    /// digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_schema_name: Option<String>,
    /// Conditions reports k8s-style conditions for the publication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<meta::v1::Condition>>,
}

impl PublishedResourceStatus {
    /// Add_condition inserts or replaces the condition with the same type.
    pub fn add_condition(&mut self, cnd: meta::v1::Condition) {
        let cnds = self.conditions.get_or_insert_default();
        match cnds.iter_mut().find(|c| c.type_ == cnd.type_) {
            Some(cur) => *cur = cnd,
            None => cnds.push(cnd),
        }
    }
}

impl PublishedResourceSpec {
    /// Namespace_template reports the configured or default namespace
    /// template.
    pub fn namespace_template(&self) -> &str {
        self.naming
            .as_ref()
            .and_then(|n| n.namespace.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE_TEMPLATE)
    }

    /// Name_template reports the configured or default name template.
    pub fn name_template(&self) -> &str {
        self.naming
            .as_ref()
            .and_then(|n| n.name.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_NAME_TEMPLATE)
    }
}

impl RelatedResourceKind {
    /// Plural is the resource name claimed for this kind.
    pub fn plural(&self) -> &'static str {
        match self {
            RelatedResourceKind::Secret => "secrets",
            RelatedResourceKind::ConfigMap => "configmaps",
        }
    }

    /// Kind is the PascalCase kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            RelatedResourceKind::Secret => "Secret",
            RelatedResourceKind::ConfigMap => "ConfigMap",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_defaults() {
        let spec = PublishedResourceSpec::default();
        assert_eq!(spec.namespace_template(), "$remoteClusterName");
        assert_eq!(spec.name_template(), "$remoteNamespaceHash-$remoteNameHash");

        let spec = PublishedResourceSpec {
            naming: Some(ResourceNaming {
                namespace: Some("tenant-$remoteClusterName".into()),
                name: None,
            }),
            ..Default::default()
        };
        assert_eq!(spec.namespace_template(), "tenant-$remoteClusterName");
        assert_eq!(spec.name_template(), "$remoteNamespaceHash-$remoteNameHash");
    }

    #[test]
    fn related_kind_plurals() {
        assert_eq!(RelatedResourceKind::Secret.plural(), "secrets");
        assert_eq!(RelatedResourceKind::ConfigMap.plural(), "configmaps");
    }

    #[test]
    fn spec_roundtrip() {
        let doc = serde_json::json!({
            "resource": {"apiGroup": "example.com", "version": "v1", "kind": "CronTab"},
            "related": [{
                "identifier": "credentials",
                "origin": "service",
                "kind": "Secret",
                "object": {
                    "reference": {"path": "spec.secretName"},
                    "namespace": {"template": {"template": "{{ object.metadata.namespace }}"}},
                },
            }],
        });
        let spec: PublishedResourceSpec = serde_json::from_value(doc).expect("spec parses");
        assert_eq!(spec.resource.kind, "CronTab");
        assert_eq!(spec.related.len(), 1);
        assert_eq!(spec.related[0].origin, RelatedResourceOrigin::Service);
        assert!(spec.related[0].object.name.reference.is_some());
        assert!(spec.related[0].object.namespace.is_some());
    }
}
