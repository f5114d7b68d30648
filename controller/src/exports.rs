//! Exports holds the rollup controller: it aggregates every ready
//! publication into the single platform export.
//!
//! The export's schema list only grows; removal is an admin operation.
//! Permission claims are derived from the declared related-resource kinds,
//! admin-added claims are preserved, and the final list is sorted so
//! successive reconciles are stable.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::runtime::{controller::Error as CtrlErr, reflector::ObjectRef};
use serde_json::json;
use tokio::{
    signal::unix::{signal, SignalKind},
    time::Duration,
};
use tokio_stream::wrappers::SignalStream;

use api::platform::{ApiExport, PermissionClaim};
use api::v1alpha1::PublishedResource;

use crate::{agent_name_label, prelude::*};

/// Controller is the export rollup controller; it runs a single worker to
/// serialize its mutations of the one export object.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let export_name = ctx.options.apiexport_ref.clone();
    let exports: Api<ApiExport> = Api::all(ctx.platform.clone());
    let ctlcfg = watcher::Config::default().fields(&format!("metadata.name={export_name}"));
    let mut prcfg = watcher::Config::default();
    if let Some(sel) = &ctx.options.published_resource_selector {
        prcfg = prcfg.labels(sel);
    }
    let prs: Api<PublishedResource> = Api::all(ctx.client.clone());
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);

    let ctl = Controller::new(exports, ctlcfg)
        .with_config(kube::runtime::controller::Config::default().concurrency(1))
        .watches(prs, prcfg, move |_pr| {
            Some(ObjectRef::<ApiExport>::new(&export_name))
        })
        .reconcile_all_on(sig)
        .graceful_shutdown_on(cancel.cancelled_owned());

    Ok(async move {
        info!("starting export rollup controller");
        ctl.run(reconcile, error_policy, ctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    match err {
                        CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                        CtrlErr::ReconcilerFailed(error, objref) => {
                            error!(%objref, %error, "reconcile error")
                        }
                        CtrlErr::QueueError(error) => error!(%error, "queue error"),
                        CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                    };
                }
                futures::future::ready(())
            })
            .await;
        debug!("export rollup controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(_export: Arc<ApiExport>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = err.to_string(), "rollup reconcile error");
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip_all, fields(export = export.name_any()))]
async fn reconcile(export: Arc<ApiExport>, ctx: Arc<Context>) -> Result<Action> {
    metrics::counter!("sync_agent_reconciles_total", "controller" => "exports").increment(1);
    let mut lp = ListParams::default();
    if let Some(sel) = &ctx.options.published_resource_selector {
        lp = lp.labels(sel);
    }
    let prs = Api::<PublishedResource>::all(ctx.client.clone()).list(&lp).await?;

    let schemas = rollup_schemas(&export, prs.items.iter());
    let claims = rollup_claims(&export, prs.items.iter());

    let annotated = export
        .annotations()
        .get(agent_name_label())
        .is_some_and(|a| a == &ctx.options.agent_name);
    let changed = schemas != export.spec.latest_resource_schemas
        || claims != export.spec.permission_claims
        || !annotated;
    if !changed {
        return Ok(DEFAULT_REQUEUE.clone());
    }

    debug!(
        schemas = schemas.len(),
        claims = claims.len(),
        "updating export"
    );
    let patch = json!({
        "metadata": {
            "annotations": {(agent_name_label()): ctx.options.agent_name},
        },
        "spec": {
            "latestResourceSchemas": schemas,
            "permissionClaims": claims,
        },
    });
    Api::<ApiExport>::all(ctx.platform.clone())
        .patch(&export.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(DEFAULT_REQUEUE.clone())
}

/// Rollup_schemas unions the export's schema list with every ready
/// publication's schema identifier. The list never shrinks; new entries are
/// appended in sorted order so repeated reconciles are stable.
fn rollup_schemas<'a, I>(export: &ApiExport, prs: I) -> Vec<String>
where
    I: Iterator<Item = &'a PublishedResource>,
{
    let mut out = export.spec.latest_resource_schemas.clone();
    let known: BTreeSet<&String> = out.iter().collect();
    let mut fresh: Vec<String> = prs
        .filter_map(|pr| pr.status.as_ref()?.resource_schema_name.clone())
        .filter(|name| !known.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    out.append(&mut fresh);
    out
}

/// Rollup_claims computes the permission claims for the declared related
/// kinds, adds `namespaces` when any related object exists, preserves every
/// pre-existing claim, deduplicates structurally and sorts by
/// (group, resource).
fn rollup_claims<'a, I>(export: &ApiExport, prs: I) -> Vec<PermissionClaim>
where
    I: Iterator<Item = &'a PublishedResource>,
{
    let mut resources = BTreeSet::new();
    for pr in prs {
        for rel in &pr.spec.related {
            resources.insert(rel.kind.plural().to_string());
        }
    }
    if !resources.is_empty() {
        resources.insert("namespaces".to_string());
    }

    let mut claims = export.spec.permission_claims.clone();
    for resource in resources {
        let claim = PermissionClaim {
            group: String::new(),
            resource,
            all: true,
        };
        if !claims.contains(&claim) {
            claims.push(claim);
        }
    }
    claims.sort_by(|a, b| (&a.group, &a.resource).cmp(&(&b.group, &b.resource)));
    claims.dedup_by(|a, b| a == b);
    claims
}
