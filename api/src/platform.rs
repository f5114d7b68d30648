//! Module `platform` holds the platform-plane API types.
//!
//! The agent does not own these types; the platform control plane serves
//! them. They are declared here so the agent can read and write them with
//! typed clients. Schema objects are immutable once created, enforced by the
//! platform.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::v1alpha1::ResourceScope;

/// ApiExportSpec advertises a set of schemas and permission claims under a
/// chosen API group.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "platform.servicebridge.io",
    version = "v1alpha1",
    kind = "ApiExport",
    status = "ApiExportStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportSpec {
    /// LatestResourceSchemas lists the schema objects exported under this
    /// export's API group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub latest_resource_schemas: Vec<String>,
    /// PermissionClaims lists additional resources consumers of this export
    /// grant the agent access to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_claims: Vec<PermissionClaim>,
}

/// PermissionClaim requests access to one resource in consumer workspaces.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionClaim {
    /// Group of the claimed resource, empty for the core group.
    #[serde(default)]
    pub group: String,
    /// Resource is the plural resource name.
    pub resource: String,
    /// All claims every object of the resource.
    #[serde(default)]
    pub all: bool,
}

/// ApiExportStatus reports the endpoints serving this export.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportStatus {
    /// VirtualWorkspaces lists the endpoint URLs under which all consumers of
    /// this export are reachable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_workspaces: Vec<VirtualWorkspace>,
}

/// VirtualWorkspace is one endpoint serving an export.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualWorkspace {
    /// Url is the base URL of the endpoint.
    pub url: String,
}

/// ApiResourceSchemaSpec is the full, versioned schema of one published type.
///
/// Objects of this kind are immutable once created.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "platform.servicebridge.io",
    version = "v1alpha1",
    kind = "ApiResourceSchema",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceSchemaSpec {
    /// Group is the API group the type is served under on the platform.
    pub group: String,
    /// Names are the canonical names of the type.
    pub names: ApiResourceNames,
    /// Scope of the type on the platform.
    pub scope: ResourceScope,
    /// Versions holds exactly one version per publication.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<ApiResourceVersion>,
}

/// ApiResourceNames are the canonical names of an API type.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceNames {
    /// Plural resource name, lower-case.
    pub plural: String,
    /// Singular resource name, lower-case.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub singular: String,
    /// Kind is the PascalCase kind.
    pub kind: String,
    /// ListKind is the PascalCase kind of list objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub list_kind: String,
    /// ShortNames allowed in clients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    /// Categories the resource appears in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

/// ApiResourceVersion is one served version of a published type.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceVersion {
    /// Name of the version, e.g. "v1".
    pub name: String,
    /// Served marks the version as enabled.
    pub served: bool,
    /// Storage marks the version objects are persisted as.
    pub storage: bool,
    /// Schema is the structural OpenAPI v3 schema of the version.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub schema: serde_json::Value,
    /// Subresources served for this version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subresources: Option<ApiResourceSubresources>,
}

/// ApiResourceSubresources flags the subresources of a version.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceSubresources {
    /// Status enables the status subresource.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub status: bool,
    /// Scale enables the scale subresource.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub scale: bool,
}
