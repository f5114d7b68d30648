//! Sync implements the per-object reconciler: a three-way-merge engine that
//! creates, updates and deletes counterpart objects across the two planes.
//!
//! The engine is direction-agnostic; the primary pipeline runs it platform
//! to service with status flowing back, and the related-object pipeline runs
//! it in whichever direction the relation declares.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::DeleteParams;
use kube::core::TypeMeta;
use serde_json::{json, Value};

use api::v1alpha1::ResourceMutation;

use crate::{
    mapper::{self, hash20, RemoteCoordinates},
    mutation::{self, MutationContext},
    prelude::*,
    remote_cluster_label, remote_name_hash_label, remote_namespace_hash_label,
    state::{strip_object, StateKey, StateStore},
    supervisor::VirtualWorkspace,
    CLEANUP_FINALIZER, CLUSTER_ANNOTATION,
};

pub(crate) mod merge;
pub(crate) mod metadata;
pub(crate) mod related;

pub use metadata::{filter_annotations, filter_labels};

/// CLUSTER_PATH_ANNOTATION carries the workspace path on objects served
/// through the virtual workspace, when the platform provides it.
pub const CLUSTER_PATH_ANNOTATION: &str = "kcp.io/path";

/// SyncSide is one half of a sync pair: a plane-scoped client plus the
/// resource type on that plane.
#[derive(Clone)]
pub struct SyncSide {
    /// Client scoped to the plane (for the platform, to one logical cluster).
    pub client: kube::Client,
    /// Resource served on this side.
    pub resource: ApiResource,
    /// Namespaced reports the scope on this side.
    pub namespaced: bool,
}

impl SyncSide {
    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &self.resource)
            }
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.resource.group, &self.resource.version, &self.resource.kind)
    }
}

/// Destination describes how the engine locates and names the counterpart.
#[derive(Clone, Debug)]
pub enum Destination {
    /// The counterpart is found by identity labels and named through the
    /// publication's naming templates; primary objects.
    Mapped {
        /// Template for the destination namespace.
        namespace_template: String,
        /// Template for the destination name.
        name_template: String,
    },
    /// The counterpart has fully resolved coordinates; related objects.
    Named {
        /// Destination namespace.
        namespace: Option<String>,
        /// Destination name.
        name: String,
    },
}

/// ObjectSyncer synchronizes one object pair in one direction.
pub struct ObjectSyncer {
    /// Source side: where the spec originates.
    pub source: SyncSide,
    /// Destination side: where the copy is written.
    pub dest: SyncSide,
    /// How the destination is located and named.
    pub destination: Destination,
    /// Mutation chain for the source-to-destination direction.
    pub spec_mutations: Vec<ResourceMutation>,
    /// Mutation chain for the status flowing back.
    pub status_mutations: Vec<ResourceMutation>,
    /// Snapshot store shared with every other syncer of this agent.
    pub state: StateStore,
    /// Logical cluster of the pair on the platform.
    pub cluster: String,
    /// Agent identity stamped onto service-side copies.
    pub agent_name: String,
    /// Subresources of the source type, typically `status`.
    pub subresources: Vec<String>,
    /// Whether status flows destination to source.
    pub sync_status_back: bool,
    /// Whether the agent's finalizer is managed on the source object.
    pub manage_finalizer: bool,
    /// Whether the destination is on the service plane; controls identity
    /// stamping and the orientation of the mutation context.
    pub dest_is_service: bool,
    /// Workspace path exposed to naming and identity, when enabled.
    pub workspace_path: Option<String>,
}

impl ObjectSyncer {
    /// Process runs one reconcile pass for the source object.
    ///
    /// Returns `true` when an observable change was made and the caller
    /// should expect another pass once the watch catches up; `false` when
    /// both sides are in the desired terminal state for the current source.
    #[instrument(skip_all, fields(
        kind = self.source.resource.kind,
        cluster = self.cluster,
        namespace = source.namespace(),
        name = source.name_any(),
    ))]
    pub async fn process(&self, source: &DynamicObject) -> Result<bool> {
        let coords = RemoteCoordinates {
            cluster: self.cluster.clone(),
            namespace: source.namespace(),
            name: source.name_any(),
        };
        let dest_obj = self.find_destination(&coords).await?;

        if source.meta().deletion_timestamp.is_some() {
            return self.finalize(source, dest_obj).await;
        }

        if self.manage_finalizer && !source.finalizers().iter().any(|f| f == CLEANUP_FINALIZER) {
            debug!("installing cleanup finalizer");
            let mut finalizers = source.finalizers().to_vec();
            finalizers.push(CLEANUP_FINALIZER.to_string());
            let patch = json!({"metadata": {"finalizers": finalizers}});
            self.source
                .api(source.namespace().as_deref())
                .patch(&source.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            return Ok(true);
        }

        // Effective documents: the spec chain transforms the source, the
        // status chain transforms the destination's half of the exchange.
        let source_doc = serde_json::to_value(source)?;
        let dest_doc = dest_obj.as_ref().map(serde_json::to_value).transpose()?;
        let mctx = self.mutation_context(&source_doc, dest_doc.as_ref());
        let source_eff: DynamicObject =
            serde_json::from_value(mutation::apply(&self.spec_mutations, &source_doc, &mctx)?)?;
        let dest_eff: Option<DynamicObject> = match &dest_doc {
            Some(doc) => Some(serde_json::from_value(mutation::apply(
                &self.status_mutations,
                doc,
                &mctx,
            )?)?),
            None => None,
        };

        let Some(dest_cur) = dest_eff else {
            self.create_destination(&source_eff, &coords).await?;
            self.state
                .put(&source_eff, &self.state_key(&coords), &self.subresources)
                .await?;
            return Ok(true);
        };

        if dest_cur.meta().deletion_timestamp.is_some() {
            // The copy is going away; a fresh one is created next pass.
            return Ok(false);
        }

        let mut source_stripped = serde_json::to_value(&source_eff)?;
        strip_object(&mut source_stripped, &self.subresources);
        let dest_stripped = serde_json::to_value(&dest_cur)?;

        if self
            .sync_object(&coords, &source_eff, &source_stripped, &dest_cur, &dest_stripped)
            .await?
        {
            return Ok(true);
        }

        if self.sync_status_back && self.subresources.iter().any(|s| s == "status") {
            self.sync_status(source, &source_eff, &dest_cur).await?;
        }
        Ok(false)
    }

    fn mutation_context<'a>(
        &self,
        source_doc: &'a Value,
        dest_doc: Option<&'a Value>,
    ) -> MutationContext<'a> {
        if self.dest_is_service {
            MutationContext {
                local_object: dest_doc,
                remote_object: Some(source_doc),
            }
        } else {
            MutationContext {
                local_object: Some(source_doc),
                remote_object: dest_doc,
            }
        }
    }

    fn state_key(&self, coords: &RemoteCoordinates) -> StateKey {
        StateKey {
            cluster: coords.cluster.clone(),
            gvk: self.source.gvk(),
            namespace: coords.namespace.clone(),
            name: coords.name.clone(),
        }
    }

    /// Find_destination locates the counterpart, either by the identity
    /// label triple or by its resolved coordinates.
    pub(crate) async fn find_destination(
        &self,
        coords: &RemoteCoordinates,
    ) -> Result<Option<DynamicObject>> {
        match &self.destination {
            Destination::Named { namespace, name } => {
                Ok(self.dest.api(namespace.as_deref()).get_opt(name).await?)
            }
            Destination::Mapped { .. } => {
                let selector = format!(
                    "{}={},{}={},{}={}",
                    remote_cluster_label(),
                    coords.cluster,
                    remote_namespace_hash_label(),
                    hash20(coords.namespace_or_empty()),
                    remote_name_hash_label(),
                    hash20(&coords.name),
                );
                let list = Api::<DynamicObject>::all_with(self.dest.client.clone(), &self.dest.resource)
                    .list(&ListParams::default().labels(&selector))
                    .await?;
                match list.items.len() {
                    0 => Ok(None),
                    1 => Ok(list.items.into_iter().next()),
                    n => Err(Error::InvalidPublication(format!(
                        "{n} local objects carry the identity {selector}; refusing to sync"
                    ))),
                }
            }
        }
    }

    async fn finalize(&self, source: &DynamicObject, dest: Option<DynamicObject>) -> Result<bool> {
        if let Some(dest) = dest {
            if dest.meta().deletion_timestamp.is_none() {
                debug!(name = dest.name_any(), "deleting counterpart");
                self.dest
                    .api(dest.namespace().as_deref())
                    .delete(&dest.name_any(), &DeleteParams::default())
                    .await?;
            }
            // Wait for the counterpart to disappear.
            return Ok(true);
        }
        if self.manage_finalizer {
            let finalizers: Vec<String> = source
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != CLEANUP_FINALIZER)
                .cloned()
                .collect();
            if finalizers.len() != source.finalizers().len() {
                debug!("removing cleanup finalizer");
                let patch = json!({"metadata": {"finalizers": finalizers}});
                self.source
                    .api(source.namespace().as_deref())
                    .patch(&source.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn destination_coords(&self, coords: &RemoteCoordinates) -> (Option<String>, String) {
        match &self.destination {
            Destination::Named { namespace, name } => (namespace.clone(), name.clone()),
            Destination::Mapped {
                namespace_template,
                name_template,
            } => {
                let ns = self
                    .dest
                    .namespaced
                    .then(|| mapper::resolve(namespace_template, coords));
                (ns, mapper::resolve(name_template, coords))
            }
        }
    }

    async fn create_destination(
        &self,
        source_eff: &DynamicObject,
        coords: &RemoteCoordinates,
    ) -> Result<()> {
        let (ns, name) = self.destination_coords(coords);

        let mut doc = serde_json::to_value(source_eff)?;
        strip_object(&mut doc, &self.subresources);
        let mut obj: DynamicObject = serde_json::from_value(doc)?;
        obj.types = Some(TypeMeta {
            api_version: self.dest.resource.api_version.clone(),
            kind: self.dest.resource.kind.clone(),
        });
        obj.metadata.name = Some(name.clone());
        obj.metadata.namespace = ns.clone();
        obj.metadata.labels = Some(filter_labels(obj.labels()));
        obj.metadata.annotations = Some(filter_annotations(obj.annotations()));
        if self.dest_is_service {
            metadata::apply_identity(&mut obj, coords, &self.agent_name, self.workspace_path.as_deref());
        }

        if let Some(ns) = ns.as_deref() {
            ensure_namespace(&self.dest.client, ns).await?;
        }

        let api = self.dest.api(ns.as_deref());
        match api.create(&CREATE_PARAMS, &obj).await {
            Ok(_) => {
                info!(name, "created counterpart");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // An orphan with the expected name already exists; adopt it
                // by overwriting its identity and carry on.
                info!(name, "adopting existing counterpart");
                let mut existing = api.get(&name).await?;
                existing.metadata.managed_fields = None;
                if self.dest_is_service {
                    metadata::apply_identity(
                        &mut existing,
                        coords,
                        &self.agent_name,
                        self.workspace_path.as_deref(),
                    );
                }
                api.replace(&name, &CREATE_PARAMS, &existing).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Sync_object drives the destination towards the effective source via a
    /// three-way merge, falling back to a full update when no usable
    /// snapshot exists. Returns whether a write happened.
    async fn sync_object(
        &self,
        coords: &RemoteCoordinates,
        source_eff: &DynamicObject,
        source_stripped: &Value,
        dest: &DynamicObject,
        dest_stripped: &Value,
    ) -> Result<bool> {
        let key = self.state_key(coords);
        let Some(mut last) = self.state.get(&key).await? else {
            debug!("no usable snapshot, falling back to a full update");
            self.full_update(source_stripped, dest).await?;
            self.state.put(source_eff, &key, &self.subresources).await?;
            return Ok(true);
        };
        strip_object(&mut last, &self.subresources);

        let mut patch = merge::create_merge_patch(&last, source_stripped);
        if let Some(map) = patch.as_object_mut() {
            // Identity never moves; names, types and server bookkeeping are
            // not part of the spec diff.
            map.remove("metadata");
            map.remove("apiVersion");
            map.remove("kind");
        }
        let meta_patch = metadata_patch(&last, source_stripped, dest_stripped);
        if !merge::is_empty(&meta_patch) {
            if let Some(map) = patch.as_object_mut() {
                map.insert("metadata".to_string(), meta_patch);
            }
        }
        if merge::is_empty(&patch) {
            return Ok(false);
        }

        trace!(?patch, "applying merge patch to counterpart");
        self.dest
            .api(dest.namespace().as_deref())
            .patch(&dest.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        self.state.put(source_eff, &key, &self.subresources).await?;
        Ok(true)
    }

    async fn full_update(&self, source_stripped: &Value, dest: &DynamicObject) -> Result<()> {
        let mut next = dest.clone();
        next.metadata.managed_fields = None;

        if let Some(src) = source_stripped.as_object() {
            let data = match &mut next.data {
                Value::Object(map) => map,
                other => {
                    *other = Value::Object(Default::default());
                    other.as_object_mut().expect("just set to an object")
                }
            };
            for (k, v) in src {
                if matches!(k.as_str(), "apiVersion" | "kind" | "metadata") {
                    continue;
                }
                if self.subresources.iter().any(|s| s == k) {
                    continue;
                }
                data.insert(k.clone(), v.clone());
            }
            if let Some(src_meta) = src.get("metadata") {
                merge_filtered_metadata(&mut next.metadata, src_meta);
            }
        }

        debug!(name = next.name_any(), "replacing counterpart");
        self.dest
            .api(next.namespace().as_deref())
            .replace(&next.name_any(), &CREATE_PARAMS, &next)
            .await?;
        Ok(())
    }

    async fn sync_status(
        &self,
        source: &DynamicObject,
        source_eff: &DynamicObject,
        dest_eff: &DynamicObject,
    ) -> Result<()> {
        let dest_status = dest_eff.data.get("status").cloned().unwrap_or(Value::Null);
        let source_status = source_eff.data.get("status").cloned().unwrap_or(Value::Null);
        if dest_status == source_status {
            return Ok(());
        }

        debug!("status differs, updating source");
        let mut next = source.clone();
        match &mut next.data {
            Value::Object(map) => {
                map.insert("status".to_string(), dest_status);
            }
            other => *other = json!({"status": dest_status}),
        }
        self.source
            .api(source.namespace().as_deref())
            .replace_status(&source.name_any(), &CREATE_PARAMS, &next)
            .await?;
        Ok(())
    }
}

/// Metadata_patch performs the three-way reconciliation of labels and
/// annotations: anything present on the source that is missing or different
/// on the destination is (re)asserted, anything the source dropped since the
/// snapshot is removed. Reserved keys never cross planes.
fn metadata_patch(last: &Value, source: &Value, dest: &Value) -> Value {
    let mut out = serde_json::Map::new();
    for field in ["labels", "annotations"] {
        let pick = |doc: &Value| -> std::collections::BTreeMap<String, String> {
            let map = doc
                .get("metadata")
                .and_then(|m| m.get(field))
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            if field == "labels" {
                filter_labels(&map)
            } else {
                filter_annotations(&map)
            }
        };
        let last_m = pick(last);
        let source_m = pick(source);
        let dest_m = pick(dest);

        let mut patch = serde_json::Map::new();
        for k in last_m.keys() {
            if !source_m.contains_key(k) && dest_m.contains_key(k) {
                patch.insert(k.clone(), Value::Null);
            }
        }
        for (k, v) in &source_m {
            if dest_m.get(k) != Some(v) {
                patch.insert(k.clone(), Value::String(v.clone()));
            }
        }
        if !patch.is_empty() {
            out.insert(field.to_string(), Value::Object(patch));
        }
    }
    Value::Object(out)
}

/// Merge_filtered_metadata folds the source's filterable labels and
/// annotations into the destination metadata; used by the full-update
/// fallback when no snapshot exists.
fn merge_filtered_metadata(meta: &mut ObjectMeta, src_meta: &Value) {
    let pick = |field: &str| -> BTreeMap<String, String> {
        src_meta
            .get(field)
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    };
    let labels = filter_labels(&pick("labels"));
    if !labels.is_empty() {
        meta.labels.get_or_insert_default().extend(labels);
    }
    let annotations = filter_annotations(&pick("annotations"));
    if !annotations.is_empty() {
        meta.annotations.get_or_insert_default().extend(annotations);
    }
}

async fn ensure_namespace(client: &kube::Client, ns: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(ns).await?.is_some() {
        return Ok(());
    }
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(ns.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&CREATE_PARAMS, &namespace).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Selector_matches evaluates a label selector against a label map in
/// memory.
pub fn selector_matches(selector: &LabelSelector, labels: &std::collections::BTreeMap<String, String>) -> bool {
    if let Some(required) = &selector.match_labels {
        for (k, v) in required {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default();
        let current = labels.get(&expr.key);
        let ok = match expr.operator.as_str() {
            "In" => current.is_some_and(|v| values.iter().any(|x| x == v)),
            "NotIn" => !current.is_some_and(|v| values.iter().any(|x| x == v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Selector_string renders a label selector for server-side filtering.
/// Returns `None` for an empty selector (select everything).
pub fn selector_string(selector: &LabelSelector) -> Option<String> {
    let mut parts = Vec::new();
    for (k, v) in selector.match_labels.iter().flatten() {
        parts.push(format!("{k}={v}"));
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        match expr.operator.as_str() {
            "In" => parts.push(format!("{} in ({values})", expr.key)),
            "NotIn" => parts.push(format!("{} notin ({values})", expr.key)),
            "Exists" => parts.push(expr.key.clone()),
            "DoesNotExist" => parts.push(format!("!{}", expr.key)),
            _ => (),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

/// PrimarySyncer drives the full pipeline for one publication: the primary
/// object pair plus every declared related object.
pub struct PrimarySyncer {
    /// The publication this syncer serves.
    pub pr: Arc<v1alpha1::PublishedResource>,
    /// Service-cluster client.
    pub local: kube::Client,
    /// Virtual-workspace handle for platform-side clients.
    pub vw: Arc<VirtualWorkspace>,
    /// Projected resource on the platform side.
    pub platform_resource: ApiResource,
    /// Whether the platform-side type is namespaced.
    pub platform_namespaced: bool,
    /// Source resource on the service side.
    pub local_resource: ApiResource,
    /// Whether the service-side type is namespaced.
    pub local_namespaced: bool,
    /// Subresources of the published type.
    pub subresources: Vec<String>,
    /// Snapshot store.
    pub state: StateStore,
    /// Agent identity.
    pub agent_name: String,
}

impl PrimarySyncer {
    /// Process runs one pass for a platform primary object.
    pub async fn process(&self, remote: &DynamicObject) -> Result<bool> {
        let cluster = remote
            .annotations()
            .get(CLUSTER_ANNOTATION)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidPublication(format!(
                    "object {} carries no {CLUSTER_ANNOTATION} annotation",
                    remote.name_any(),
                ))
            })?;
        let client = self.vw.cluster_client(&cluster)?;
        let workspace_path = self.pr.spec.enable_workspace_paths.then(|| {
            remote
                .annotations()
                .get(CLUSTER_PATH_ANNOTATION)
                .cloned()
                .unwrap_or_else(|| cluster.clone())
        });

        let syncer = ObjectSyncer {
            source: SyncSide {
                client: client.clone(),
                resource: self.platform_resource.clone(),
                namespaced: self.platform_namespaced,
            },
            dest: SyncSide {
                client: self.local.clone(),
                resource: self.local_resource.clone(),
                namespaced: self.local_namespaced,
            },
            destination: Destination::Mapped {
                namespace_template: self.pr.spec.namespace_template().to_string(),
                name_template: self.pr.spec.name_template().to_string(),
            },
            spec_mutations: self
                .pr
                .spec
                .mutation
                .as_ref()
                .map(|m| m.spec.clone())
                .unwrap_or_default(),
            status_mutations: self
                .pr
                .spec
                .mutation
                .as_ref()
                .map(|m| m.status.clone())
                .unwrap_or_default(),
            state: self.state.clone(),
            cluster: cluster.clone(),
            agent_name: self.agent_name.clone(),
            subresources: self.subresources.clone(),
            sync_status_back: true,
            manage_finalizer: true,
            dest_is_service: true,
            workspace_path,
        };

        if syncer.process(remote).await? {
            return Ok(true);
        }
        if self.pr.spec.related.is_empty() || remote.meta().deletion_timestamp.is_some() {
            return Ok(false);
        }

        // Related objects only make sense once the local copy exists.
        let coords = RemoteCoordinates {
            cluster: cluster.clone(),
            namespace: remote.namespace(),
            name: remote.name_any(),
        };
        let Some(local_primary) = syncer.find_destination(&coords).await? else {
            return Ok(false);
        };

        let rctx = related::RelatedContext {
            pr: &self.pr,
            platform_client: client,
            platform_resource: &self.platform_resource,
            platform_namespaced: self.platform_namespaced,
            platform_primary: remote,
            local_client: self.local.clone(),
            local_primary: &local_primary,
            cluster,
            state: self.state.clone(),
            agent_name: self.agent_name.clone(),
        };
        related::process_related(&rctx).await
    }

    /// Matches_filter evaluates the publication's resource filter against a
    /// platform object; the namespace half of the filter needs an API call
    /// and lives with the caller.
    pub fn matches_filter(&self, obj: &DynamicObject) -> bool {
        match self.pr.spec.filter.as_ref().and_then(|f| f.resource.as_ref()) {
            Some(selector) => selector_matches(selector, obj.labels()),
            None => true,
        }
    }
}
