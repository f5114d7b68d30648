//! Related implements the auxiliary-object pipeline: for each declared
//! relation, resolve the origin and destination coordinates against the
//! primary pair and run a dedicated syncer per candidate.

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use serde_json::{json, Value};

use api::v1alpha1::{
    RelatedResourceKind, RelatedResourceOrigin, RelatedResourceSelectorRewrite,
    RelatedResourceSpec,
};

use crate::{
    mutation,
    prelude::*,
    related_annotation,
    state::StateStore,
    sync::{selector_string, Destination, ObjectSyncer, SyncSide},
};

/// RelatedContext carries the primary pair a relation hangs off of.
pub(crate) struct RelatedContext<'a> {
    pub pr: &'a v1alpha1::PublishedResource,
    pub platform_client: kube::Client,
    pub platform_resource: &'a ApiResource,
    pub platform_namespaced: bool,
    pub platform_primary: &'a DynamicObject,
    pub local_client: kube::Client,
    pub local_primary: &'a DynamicObject,
    pub cluster: String,
    pub state: StateStore,
    pub agent_name: String,
}

/// Process_related runs every relation of the publication; returns whether
/// any write happened.
pub(crate) async fn process_related(ctx: &RelatedContext<'_>) -> Result<bool> {
    let mut requeue = false;
    for rel in &ctx.pr.spec.related {
        requeue |= process_one(ctx, rel).await?;
    }
    Ok(requeue)
}

#[instrument(skip_all, fields(identifier = rel.identifier, origin = ?rel.origin))]
async fn process_one(ctx: &RelatedContext<'_>, rel: &RelatedResourceSpec) -> Result<bool> {
    let origin_is_platform = rel.origin == RelatedResourceOrigin::Platform;
    let (origin_client, origin_primary, dest_client, dest_primary) = if origin_is_platform {
        (
            ctx.platform_client.clone(),
            ctx.platform_primary,
            ctx.local_client.clone(),
            ctx.local_primary,
        )
    } else {
        (
            ctx.local_client.clone(),
            ctx.local_primary,
            ctx.platform_client.clone(),
            ctx.platform_primary,
        )
    };
    let origin_doc = serde_json::to_value(origin_primary)?;
    let dest_doc = serde_json::to_value(dest_primary)?;
    let resource = api_resource(rel.kind);

    let namespaces = resolve_namespaces(rel, &origin_client, &origin_doc, &dest_doc, origin_primary, dest_primary).await?;
    let mut candidates = Vec::new();
    for (origin_ns, dest_ns) in namespaces {
        let names = resolve_names(rel, &origin_client, &resource, &origin_ns, &origin_doc, &dest_doc).await?;
        for (origin_name, dest_name) in names {
            candidates.push((origin_ns.clone(), origin_name, dest_ns.clone(), dest_name));
        }
    }

    let multiple = candidates.len() > 1;
    let mut requeue = false;
    for (index, (origin_ns, origin_name, dest_ns, dest_name)) in candidates.iter().enumerate() {
        let api: Api<DynamicObject> =
            Api::namespaced_with(origin_client.clone(), origin_ns, &resource);
        let Some(origin_obj) = api.get_opt(origin_name).await? else {
            trace!(origin_ns, origin_name, "related source not present yet");
            continue;
        };

        let syncer = ObjectSyncer {
            source: SyncSide {
                client: origin_client.clone(),
                resource: resource.clone(),
                namespaced: true,
            },
            dest: SyncSide {
                client: dest_client.clone(),
                resource: resource.clone(),
                namespaced: true,
            },
            destination: Destination::Named {
                namespace: Some(dest_ns.clone()),
                name: dest_name.clone(),
            },
            spec_mutations: rel.mutation.as_ref().map(|m| m.spec.clone()).unwrap_or_default(),
            status_mutations: rel
                .mutation
                .as_ref()
                .map(|m| m.status.clone())
                .unwrap_or_default(),
            state: ctx.state.clone(),
            cluster: ctx.cluster.clone(),
            agent_name: ctx.agent_name.clone(),
            // Secrets and ConfigMaps serve no subresources.
            subresources: Vec::new(),
            sync_status_back: origin_is_platform,
            manage_finalizer: origin_is_platform,
            dest_is_service: origin_is_platform,
            workspace_path: None,
        };
        requeue |= syncer.process(&origin_obj).await?;

        requeue |= stamp_annotation(ctx, rel, index, multiple, dest_ns, dest_name).await?;
    }
    Ok(requeue)
}

/// Stamp_annotation records the destination coordinates of a synced related
/// object on the platform primary so tenants can discover the companion.
async fn stamp_annotation(
    ctx: &RelatedContext<'_>,
    rel: &RelatedResourceSpec,
    index: usize,
    multiple: bool,
    dest_ns: &str,
    dest_name: &str,
) -> Result<bool> {
    let key = if multiple {
        format!("{}.{index}", related_annotation(&rel.identifier))
    } else {
        related_annotation(&rel.identifier)
    };
    let value = json!({
        "apiVersion": "v1",
        "kind": rel.kind.kind(),
        "namespace": dest_ns,
        "name": dest_name,
    })
    .to_string();
    if ctx.platform_primary.annotations().get(&key) == Some(&value) {
        return Ok(false);
    }

    let api: Api<DynamicObject> = match ctx.platform_primary.namespace() {
        Some(ns) if ctx.platform_namespaced => {
            Api::namespaced_with(ctx.platform_client.clone(), &ns, ctx.platform_resource)
        }
        _ => Api::all_with(ctx.platform_client.clone(), ctx.platform_resource),
    };
    let patch = json!({"metadata": {"annotations": {key: value}}});
    api.patch(
        &ctx.platform_primary.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(true)
}

fn api_resource(kind: RelatedResourceKind) -> ApiResource {
    match kind {
        RelatedResourceKind::Secret => ApiResource::erase::<Secret>(&()),
        RelatedResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
    }
}

/// Resolve_namespaces produces the paired (origin, destination) namespaces.
///
/// Without a namespace locator both sides inherit their primary's namespace;
/// a cluster-scoped primary then makes the relation unresolvable.
async fn resolve_namespaces(
    rel: &RelatedResourceSpec,
    origin_client: &kube::Client,
    origin_doc: &Value,
    dest_doc: &Value,
    origin_primary: &DynamicObject,
    dest_primary: &DynamicObject,
) -> Result<Vec<(String, String)>> {
    let Some(locator) = &rel.object.namespace else {
        let origin_ns = origin_primary.namespace().ok_or_else(|| {
            Error::InvalidPublication(format!(
                "related resource {:?} on a cluster-scoped primary requires a namespace locator",
                rel.identifier,
            ))
        })?;
        let dest_ns = dest_primary.namespace().ok_or_else(|| {
            Error::InvalidPublication(format!(
                "related resource {:?} on a cluster-scoped primary requires a namespace locator",
                rel.identifier,
            ))
        })?;
        return Ok(vec![(origin_ns, dest_ns)]);
    };

    match (&locator.reference, &locator.selector, &locator.template) {
        (Some(reference), None, None) => {
            let origin = resolve_reference(reference, origin_doc)?;
            let dest = resolve_reference(reference, dest_doc)?;
            Ok(origin.zip(dest).into_iter().collect())
        }
        (None, Some(selector), None) => {
            // Selectors may match many namespaces; the rewrite pairs each
            // with its destination.
            let api: Api<Namespace> = Api::all(origin_client.clone());
            let mut lp = ListParams::default();
            if let Some(labels) = selector_string(&selector.label_selector) {
                lp = lp.labels(&labels);
            }
            let mut out = Vec::new();
            for ns in api.list(&lp).await? {
                let name = ns.metadata.name.clone().unwrap_or_default();
                let dest = apply_rewrite(&selector.rewrite, &name, dest_doc)?;
                out.push((name, dest));
            }
            Ok(out)
        }
        (None, None, Some(template)) => {
            let origin = render_template(&template.template, origin_doc, None)?;
            let dest = render_template(&template.template, dest_doc, None)?;
            Ok(vec![(origin, dest)])
        }
        _ => Err(Error::InvalidPublication(format!(
            "related resource {:?}: a locator must be exactly one of reference, selector or template",
            rel.identifier,
        ))),
    }
}

/// Resolve_names produces the paired (origin, destination) names within one
/// origin namespace.
async fn resolve_names(
    rel: &RelatedResourceSpec,
    origin_client: &kube::Client,
    resource: &ApiResource,
    origin_ns: &str,
    origin_doc: &Value,
    dest_doc: &Value,
) -> Result<Vec<(String, String)>> {
    let locator = &rel.object.name;
    match (&locator.reference, &locator.selector, &locator.template) {
        (Some(reference), None, None) => {
            let origin = resolve_reference(reference, origin_doc)?;
            let dest = resolve_reference(reference, dest_doc)?;
            Ok(origin.zip(dest).into_iter().collect())
        }
        (None, Some(selector), None) => {
            let api: Api<DynamicObject> =
                Api::namespaced_with(origin_client.clone(), origin_ns, resource);
            let mut lp = ListParams::default();
            if let Some(labels) = selector_string(&selector.label_selector) {
                lp = lp.labels(&labels);
            }
            let mut out = Vec::new();
            for obj in api.list(&lp).await? {
                let name = obj.name_any();
                let dest = apply_rewrite(&selector.rewrite, &name, dest_doc)?;
                out.push((name, dest));
            }
            Ok(out)
        }
        (None, None, Some(template)) => {
            let origin = render_template(&template.template, origin_doc, None)?;
            let dest = render_template(&template.template, dest_doc, None)?;
            Ok(vec![(origin, dest)])
        }
        _ => Err(Error::InvalidPublication(format!(
            "related resource {:?}: a locator must be exactly one of reference, selector or template",
            rel.identifier,
        ))),
    }
}

/// Resolve_reference reads a path out of a primary document. A missing path
/// means the relation is not resolvable yet, not an error.
pub(crate) fn resolve_reference(
    reference: &api::v1alpha1::RelatedResourceReference,
    doc: &Value,
) -> Result<Option<String>> {
    let Some(value) = mutation::get_path(doc, &reference.path) else {
        return Ok(None);
    };
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match &reference.regex {
        Some(rx) => Ok(Some(mutation::rewrite(rx, &raw)?)),
        None => Ok(Some(raw)),
    }
}

pub(crate) fn apply_rewrite(
    rewrite: &RelatedResourceSelectorRewrite,
    value: &str,
    primary_doc: &Value,
) -> Result<String> {
    match (&rewrite.regex, &rewrite.template) {
        (Some(rx), None) => mutation::rewrite(rx, value),
        (None, Some(template)) => render_template(&template.template, primary_doc, Some(value)),
        _ => Err(Error::InvalidPublication(
            "a selector rewrite must be exactly one of regex or template".into(),
        )),
    }
}

fn render_template(template: &str, primary_doc: &Value, value: Option<&str>) -> Result<String> {
    let mut tctx = tera::Context::new();
    tctx.insert("object", primary_doc);
    if let Some(value) = value {
        tctx.insert("value", value);
    }
    let out = tera::Tera::one_off(template, &tctx, false)?;
    Ok(out.trim().to_string())
}
