//! Publications holds the controller for the PublishedResource CRD: it
//! derives the projected schema for each publication and installs it in the
//! platform.
//!
//! Installed schema objects are immutable. A publication whose projected
//! schema drifts from the installed one is effectively locked to the first
//! installed version and reports a warning event.

use std::sync::Arc;

use k8s_openapi::jiff::Timestamp;
use kube::runtime::controller::Error as CtrlErr;
use serde_json::json;
use tokio::{
    signal::unix::{signal, SignalKind},
    time::Duration,
};
use tokio_stream::wrappers::SignalStream;

use api::platform::ApiResourceSchema;
use api::v1alpha1::{PublishedResource, PublishedResourceStatus};

use crate::{
    agent_condition, agent_name_label, discovery, prelude::*, projection,
    EXPORT_GROUP_LABEL, SOURCE_GENERATION_ANNOTATION,
};

/// Controller is the schema publication controller.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let mut ctlcfg = watcher::Config::default();
    if let Some(sel) = &ctx.options.published_resource_selector {
        ctlcfg = ctlcfg.labels(sel);
    }
    let root: Api<PublishedResource> = Api::all(client);
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);

    Ok(async move {
        if let Err(e) = root.list(&ListParams::default().limit(1)).await {
            error!("PublishedResource CRD is not queryable ({e:?}); is the CRD installed?");
            return Err(Error::BadName("no CRD".into()));
        }

        let ctl = Controller::new(root, ctlcfg)
            .with_config(kube::runtime::controller::Config::default().concurrency(4))
            .reconcile_all_on(sig)
            .graceful_shutdown_on(cancel.cancelled_owned());
        info!("starting publication controller");

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
        debug!("publication controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<PublishedResource>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, pr), fields(
    name = pr.name_any(),
    generation = pr.metadata.generation,
))]
async fn reconcile(pr: Arc<PublishedResource>, ctx: Arc<Context>) -> Result<Action> {
    metrics::counter!("sync_agent_reconciles_total", "controller" => "publications").increment(1);
    // Deleting a publication neither uninstalls the schema nor touches any
    // synced data; there is nothing to do.
    if pr.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let oref = pr.object_ref(&());

    let src = &pr.spec.resource;
    let gvk = GroupVersionKind::gvk(&src.api_group, &src.version, &src.kind);
    info!(r#"reconciling publication "{}""#, pr.name_any());

    let crd = match discovery::discover(&ctx.client, &gvk).await {
        Ok(crd) => crd,
        Err(err @ Error::UnknownResource(_)) => {
            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "UnknownSourceResource".into(),
                        note: Some(format!("source GVK of `{}` cannot be resolved: {err}", pr.name_any())),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &oref,
                )
                .await
                .map_err(Error::Kube)?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    let export_group = ctx.options.apiexport_ref.as_str();
    let projected = projection::project(&pr, export_group, &crd)?;
    let mut schema = projection::resource_schema(&projected, &crd, export_group)?;
    schema
        .metadata
        .labels
        .get_or_insert_default()
        .insert(EXPORT_GROUP_LABEL.clone(), export_group.to_string());
    let annotations = schema.metadata.annotations.get_or_insert_default();
    annotations.insert(
        SOURCE_GENERATION_ANNOTATION.clone(),
        pr.metadata.generation.unwrap_or_default().to_string(),
    );
    annotations.insert(agent_name_label().to_string(), ctx.options.agent_name.clone());

    let schemas: Api<ApiResourceSchema> = Api::all(ctx.platform.clone());
    match schemas.get_opt(&projected.schema_name).await? {
        Some(existing) => {
            // Schema objects are immutable in the platform; never rewritten.
            if existing.spec != schema.spec {
                warn!(
                    schema = projected.schema_name,
                    "installed schema differs from the projected one; publication is locked to the installed version"
                );
                ctx.recorder
                    .publish(
                        &Event {
                            type_: EventType::Warning,
                            reason: "SchemaMismatch".into(),
                            note: Some(format!(
                                "installed schema `{}` is immutable and differs from the current projection",
                                projected.schema_name,
                            )),
                            action: "Reconcile".into(),
                            secondary: None,
                        },
                        &oref,
                    )
                    .await
                    .map_err(Error::Kube)?;
            }
        }
        None => {
            info!(schema = projected.schema_name, "installing schema");
            schemas.create(&CREATE_PARAMS, &schema).await?;
        }
    }

    let current = pr.status.as_ref().and_then(|s| s.resource_schema_name.as_deref());
    if current != Some(projected.schema_name.as_str()) {
        debug!("updating publication status");
        let status_update = Patch::Apply(json!({
            "apiVersion": PublishedResource::api_version(&()),
            "kind": PublishedResource::kind(&()),
            "status": PublishedResourceStatus {
                resource_schema_name: Some(projected.schema_name.clone()),
                conditions: vec![Condition {
                    message: "resource schema installed in the platform".into(),
                    observed_generation: pr.metadata.generation,
                    last_transition_time: meta::v1::Time(Timestamp::now()),
                    reason: "SchemaInstalled".into(),
                    status: "True".into(),
                    type_: agent_condition("SchemaReady"),
                }]
                .into(),
            },
        }));
        let prs: Api<PublishedResource> = Api::all(ctx.client.clone());
        prs.patch_status(&pr.name_any(), &PATCH_PARAMS, &status_update)
            .await?;
        return Ok(Action::requeue(Duration::from_millis(250)));
    }

    Ok(DEFAULT_REQUEUE.clone())
}
