#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements common functionality for the sync-agent binary and
//! the controllers themselves.
//!
//! The agent bridges two planes: the "service" cluster this process runs
//! against with its default credentials, and the "platform" control plane
//! reached via a dedicated kubeconfig. Publication of schemas flows service
//! to platform; object specs flow platform to service; object status flows
//! service to platform.

use std::{env, pin::Pin, sync::LazyLock};

use futures::Future;
use kube::runtime::events;
use sha2::{Digest, Sha256};

/// Prelude is the common types for the controllers.
pub(crate) mod prelude {
    pub use std::{collections::BTreeMap, sync::Arc};

    pub use futures::prelude::*;
    pub use k8s_openapi::apimachinery::pkg::apis::meta::{self, v1::Condition};
    pub use kube::{
        self,
        api::{Api, ListParams, Patch, PatchParams, PostParams},
        core::{ApiResource, DynamicObject, GroupVersionKind},
        runtime::{
            controller::{Action, Controller},
            events::{Event, EventType},
            watcher,
        },
        Resource, ResourceExt,
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1alpha1;

    pub use super::{Context, ControllerFuture, Error, Result};
    pub use super::{CONTROLLER_NAME, CREATE_PARAMS, DEFAULT_REQUEUE, PATCH_PARAMS};
}

pub mod discovery;
pub mod exports;
pub mod mapper;
pub mod mutation;
pub mod projection;
pub mod publications;
pub mod state;
pub mod supervisor;
pub mod sync;

#[cfg(test)]
pub mod testing;

/// Error is the common error type of the controllers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Kubeconfig indicates a provided kubeconfig failed to load.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// YAML indicates a YAML serialization failed.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    /// JSONPatch indicates a JSON patch failed.
    #[error("json patch error: {0}")]
    JSONPatch(#[from] json_patch::PatchError),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error joining tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// Http indicates a malformed request or URI.
    #[error("http error: {0}")]
    Http(#[from] http::Error),
    /// Uri indicates a virtual-workspace URL failed to parse.
    #[error("uri error: {0}")]
    Uri(#[from] http::uri::InvalidUri),
    /// Regex indicates a mutation or rewrite pattern failed to compile.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    /// Template indicates a template mutation or locator failed to render.
    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    /// MissingName indicates a name was needed and not provided.
    #[error("missing name for kubernetes object: {0}")]
    MissingName(&'static str),
    /// BadName indicates a disallowed name for a kubernetes object.
    #[error("bad name for kubernetes object: {0}")]
    BadName(String),
    /// UnknownResource indicates a source GVK could not be resolved on the
    /// service cluster.
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    /// InvalidPublication indicates a PublishedResource that cannot be acted
    /// on; these are configuration errors and produce warning events.
    #[error("invalid PublishedResource: {0}")]
    InvalidPublication(String),
    /// InvalidMutation indicates a mutation that is not exactly one of the
    /// supported shapes, or that addresses a path that cannot be written.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for controllers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context is common context for controllers.
pub struct Context {
    /// Client is the service-cluster client. This should only ever be
    /// `clone()`'d out of the Context.
    pub client: kube::Client,
    /// Platform is the platform-plane client, rooted at the workspace the
    /// export lives in.
    pub platform: kube::Client,
    /// Recorder publishes events on service-cluster objects.
    pub recorder: events::Recorder,
    /// Options carries the agent identity and flags.
    pub options: AgentOptions,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// AgentOptions is the validated flag set the agent runs with.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// AgentName is the identity written onto every service-side copy. Must
    /// not change after first registration.
    pub agent_name: String,
    /// ApiexportRef is the name of the export object on the platform.
    pub apiexport_ref: String,
    /// Namespace is the service-side namespace holding the state store.
    pub namespace: String,
    /// PublishedResourceSelector restricts which PublishedResources this
    /// agent processes.
    pub published_resource_selector: Option<String>,
}

/// ControllerFuture is the type the controller constructors should return.
pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// REPORTER identifies this process in published events.
pub static REPORTER: LazyLock<events::Reporter> = LazyLock::new(|| events::Reporter {
    controller: CONTROLLER_NAME.to_string(),
    instance: env::var("CONTROLLER_POD_NAME").ok(),
});

/// Condition is like [keyify], but does not force lower-case.
fn condition<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c,
        })
        .for_each(|c| out.push(c));
    out
}

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Agent_condition returns the provided argument as a name in the agent's
/// space, suitable for use as a condition type.
pub fn agent_condition<S: AsRef<str>>(s: S) -> String {
    condition("syncagent.servicebridge.io/", s)
}

/// Agent_label returns the provided argument as a name in the agent's space,
/// suitable for use as an annotation or label.
pub fn agent_label<S: AsRef<str>>(s: S) -> String {
    keyify("syncagent.servicebridge.io/", s)
}

/// Related_annotation returns the annotation key recording a synced related
/// object on the platform primary.
pub fn related_annotation<S: AsRef<str>>(s: S) -> String {
    keyify("related-resources.servicebridge.io/", s)
}

/// Sha256_hex returns the lower-case hex digest of the input.
///
/// All identity hashes in the agent (name mapping, state-store keys, schema
/// identifiers) are prefixes of this digest.
pub fn sha256_hex<B: AsRef<[u8]>>(data: B) -> String {
    use std::fmt::Write;
    let mut h = Sha256::new();
    h.update(data.as_ref());
    let digest = h.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        write!(&mut out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

/// Is_dns_label reports whether the name is a valid RFC 1123 DNS label.
pub fn is_dns_label<S: AsRef<str>>(name: S) -> bool {
    let name = name.as_ref();
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

static LABELS: LazyLock<Labels> = LazyLock::new(Labels::new);

struct Labels {
    agent_name: String,
    remote_cluster: String,
    remote_namespace_hash: String,
    remote_name_hash: String,
    remote_namespace: String,
    remote_name: String,
    workspace_path: String,
    object_state: String,
}

impl Labels {
    fn new() -> Self {
        Self {
            agent_name: agent_label("agent-name"),
            remote_cluster: agent_label("remote-object-cluster"),
            remote_namespace_hash: agent_label("remote-object-namespace-hash"),
            remote_name_hash: agent_label("remote-object-name-hash"),
            remote_namespace: agent_label("remote-object-namespace"),
            remote_name: agent_label("remote-object-name"),
            workspace_path: agent_label("remote-object-workspace-path"),
            object_state: agent_label("object-state"),
        }
    }
}

/// Agent_name_label marks a service-side object as owned by one agent.
pub fn agent_name_label() -> &'static str {
    &LABELS.agent_name
}
/// Remote_cluster_label holds the logical cluster of the source object.
pub fn remote_cluster_label() -> &'static str {
    &LABELS.remote_cluster
}
/// Remote_namespace_hash_label holds the hashed source namespace.
pub fn remote_namespace_hash_label() -> &'static str {
    &LABELS.remote_namespace_hash
}
/// Remote_name_hash_label holds the hashed source name.
pub fn remote_name_hash_label() -> &'static str {
    &LABELS.remote_name_hash
}
/// Remote_namespace_annotation holds the unhashed source namespace.
pub fn remote_namespace_annotation() -> &'static str {
    &LABELS.remote_namespace
}
/// Remote_name_annotation holds the unhashed source name.
pub fn remote_name_annotation() -> &'static str {
    &LABELS.remote_name
}
/// Workspace_path_annotation holds the workspace path of the source cluster.
pub fn workspace_path_annotation() -> &'static str {
    &LABELS.workspace_path
}
/// Object_state_label marks state-store secrets for bulk cleanup.
pub fn object_state_label() -> &'static str {
    &LABELS.object_state
}

/// CLEANUP_FINALIZER is installed on every synced platform primary.
pub const CLEANUP_FINALIZER: &str = "syncagent.servicebridge.io/cleanup";

/// CLUSTER_ANNOTATION is the logical-cluster coordinate the platform stamps
/// on objects served through the virtual workspace.
pub const CLUSTER_ANNOTATION: &str = "kcp.io/cluster";

/// LAST_APPLIED_ANNOTATION is kubectl's bookkeeping annotation; never synced.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// CLAIMED_LABEL_PREFIX marks labels managed by the platform's claim
/// machinery; never synced in either direction.
pub const CLAIMED_LABEL_PREFIX: &str = "claimed.platform.servicebridge.io/";

/// SOURCE_GENERATION_ANNOTATION records the PublishedResource generation a
/// schema was created from.
pub static SOURCE_GENERATION_ANNOTATION: LazyLock<String> =
    LazyLock::new(|| agent_label("source-generation"));

/// EXPORT_GROUP_LABEL labels schema objects with the export's API group.
pub static EXPORT_GROUP_LABEL: LazyLock<String> = LazyLock::new(|| agent_label("export-group"));

/// CREATE_PARAMS is default post parameters.
pub static CREATE_PARAMS: LazyLock<kube::api::PostParams> =
    LazyLock::new(|| kube::api::PostParams {
        dry_run: false,
        field_manager: Some(String::from(CONTROLLER_NAME)),
    });

/// PATCH_PARAMS is default patch parameters.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));

/// DEFAULT_REQUEUE is the fallback resync interval for healthy objects.
pub static DEFAULT_REQUEUE: LazyLock<kube::runtime::controller::Action> = LazyLock::new(|| {
    kube::runtime::controller::Action::requeue(tokio::time::Duration::from_secs(60 * 60))
});

/// CONTROLLER_NAME is the name the agent uses whenever it needs a
/// human-readable name; also the event reporter and field manager.
pub const CONTROLLER_NAME: &str = "sync-agent";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_names() {
        assert_eq!(agent_name_label(), "syncagent.servicebridge.io/agent-name");
        assert_eq!(
            remote_namespace_hash_label(),
            "syncagent.servicebridge.io/remote-object-namespace-hash"
        );
        assert_eq!(
            related_annotation("credentials"),
            "related-resources.servicebridge.io/credentials"
        );
    }

    #[test]
    fn hashes_are_hex() {
        let h = sha256_hex("synced-default/my-crontab");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, sha256_hex("synced-default/my-crontab"));
    }

    #[test]
    fn dns_labels() {
        assert!(is_dns_label("kcp-example-com-syncagent"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("-leading"));
        assert!(!is_dns_label("Uppercase"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}
