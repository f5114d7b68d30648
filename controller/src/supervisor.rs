//! Supervisor watches the platform export for its virtual-workspace URL and
//! manages the endpoint client plus one sync controller per publication.
//!
//! Every managed component is single-use: once a sync controller's task has
//! ended, its handle is dead and a replacement is constructed. Teardown is
//! always awaited before a replacement starts.

use std::collections::HashMap;

use kube::runtime::{controller::Error as CtrlErr, reflector::ObjectRef};
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
    time::Duration,
};
use tokio_stream::wrappers::SignalStream;

use api::platform::ApiExport;
use api::v1alpha1::{PublishedResource, ResourceScope};

use crate::{
    agent_name_label, discovery, projection,
    prelude::*,
    remote_name_annotation, remote_namespace_annotation,
    state::StateStore,
    sync::{selector_matches, selector_string, PrimarySyncer},
    CLUSTER_ANNOTATION,
};

/// Parallel workers per sync controller.
const SYNC_WORKERS: u16 = 4;

/// VirtualWorkspace is the endpoint handle: a wildcard client watching every
/// consumer of the export, plus per-cluster clients for writes.
pub struct VirtualWorkspace {
    url: String,
    config: kube::Config,
    wildcard: kube::Client,
    clients: std::sync::Mutex<HashMap<String, kube::Client>>,
}

impl VirtualWorkspace {
    /// New builds the wildcard client for the endpoint URL.
    pub fn new(base: &kube::Config, url: &str) -> Result<Self> {
        let url = url.trim_end_matches('/').to_string();
        let wildcard = Self::client_for(base, &format!("{url}/clusters/*"))?;
        Ok(Self {
            url,
            config: base.clone(),
            wildcard,
            clients: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn client_for(base: &kube::Config, url: &str) -> Result<kube::Client> {
        let mut config = base.clone();
        config.cluster_url = url.parse::<http::Uri>()?;
        Ok(kube::Client::try_from(config)?)
    }

    /// Url is the endpoint URL this handle was built for.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wildcard is the client listing objects across all logical clusters.
    pub fn wildcard(&self) -> kube::Client {
        self.wildcard.clone()
    }

    /// Cluster_client returns a client scoped to one logical cluster,
    /// building and memoizing it on first use.
    pub fn cluster_client(&self, cluster: &str) -> Result<kube::Client> {
        if let Some(client) = self
            .clients
            .lock()
            .expect("client cache mutex is never poisoned")
            .get(cluster)
        {
            return Ok(client.clone());
        }
        let client = Self::client_for(&self.config, &format!("{}/clusters/{cluster}", self.url))?;
        self.clients
            .lock()
            .expect("client cache mutex is never poisoned")
            .insert(cluster.to_string(), client.clone());
        Ok(client)
    }
}

/// SyncWorker is one running per-publication sync controller.
struct SyncWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    fn finished(&self) -> bool {
        self.handle.is_finished()
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[derive(Default)]
struct SupervisorState {
    url: Option<String>,
    vw: Option<Arc<VirtualWorkspace>>,
    workers: HashMap<String, SyncWorker>,
}

struct SupervisorContext {
    ctx: Arc<Context>,
    platform_config: kube::Config,
    /// Long-lived root; sync controllers must outlive any one reconcile.
    root: CancellationToken,
    state: tokio::sync::Mutex<SupervisorState>,
}

/// Controller is the sync-controller supervisor.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(
    cancel: CancellationToken,
    ctx: Arc<Context>,
    platform_config: kube::Config,
) -> Result<ControllerFuture> {
    let export_name = ctx.options.apiexport_ref.clone();
    let exports: Api<ApiExport> = Api::all(ctx.platform.clone());
    let ctlcfg = watcher::Config::default().fields(&format!("metadata.name={export_name}"));
    let mut prcfg = watcher::Config::default();
    if let Some(sel) = &ctx.options.published_resource_selector {
        prcfg = prcfg.labels(sel);
    }
    let prs: Api<PublishedResource> = Api::all(ctx.client.clone());
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);

    let sctx = Arc::new(SupervisorContext {
        ctx,
        platform_config,
        root: cancel.clone(),
        state: tokio::sync::Mutex::new(SupervisorState::default()),
    });

    let ctl = Controller::new(exports, ctlcfg)
        .with_config(kube::runtime::controller::Config::default().concurrency(1))
        .watches(prs, prcfg, move |_pr| {
            Some(ObjectRef::<ApiExport>::new(&export_name))
        })
        .reconcile_all_on(sig)
        .graceful_shutdown_on(cancel.cancelled_owned());

    Ok(async move {
        info!("starting sync supervisor");
        ctl.run(reconcile, error_policy, sctx.clone())
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
        let mut state = sctx.state.lock().await;
        stop_all(&mut state).await;
        debug!("sync supervisor finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(_export: Arc<ApiExport>, err: &Error, _ctx: Arc<SupervisorContext>) -> Action {
    error!(error = err.to_string(), "supervisor reconcile error");
    Action::requeue(Duration::from_secs(5))
}

/// Export_url picks the endpoint URL out of the export status. More than one
/// URL means a sharded platform, which this agent does not support; the
/// first one wins.
fn export_url(export: &ApiExport) -> Option<&str> {
    let vws = export.status.as_ref().map(|s| s.virtual_workspaces.as_slice())?;
    if vws.len() > 1 {
        warn!(
            count = vws.len(),
            "export advertises multiple virtual workspace URLs, using the first"
        );
    }
    vws.first().map(|vw| vw.url.as_str())
}

#[instrument(skip_all, fields(export = export.name_any()))]
async fn reconcile(export: Arc<ApiExport>, sctx: Arc<SupervisorContext>) -> Result<Action> {
    let mut state = sctx.state.lock().await;
    match export_url(&export) {
        None => {
            if state.vw.is_some() {
                info!("virtual workspace URL gone, stopping sync controllers");
                stop_all(&mut state).await;
            }
        }
        Some(url) => {
            if state.url.as_deref() != Some(url) {
                if state.vw.is_some() {
                    info!(url, "virtual workspace URL changed, rebuilding");
                }
                stop_all(&mut state).await;
                let vw = Arc::new(VirtualWorkspace::new(&sctx.platform_config, url)?);
                state.url = Some(url.to_string());
                state.vw = Some(vw);
            }
            ensure_workers(&sctx, &mut state).await?;
        }
    }
    Ok(Action::requeue(Duration::from_secs(60)))
}

async fn stop_all(state: &mut SupervisorState) {
    for (key, worker) in state.workers.drain() {
        debug!(key, "stopping sync controller");
        worker.stop().await;
    }
    state.vw = None;
    state.url = None;
}

/// Worker_key identifies one generation of one publication; a spec change
/// produces a new key and therefore a fresh controller.
fn worker_key(pr: &PublishedResource) -> String {
    format!(
        "{}-{}",
        pr.uid().unwrap_or_default(),
        pr.resource_version().unwrap_or_default(),
    )
}

async fn ensure_workers(sctx: &Arc<SupervisorContext>, state: &mut SupervisorState) -> Result<()> {
    let Some(vw) = state.vw.clone() else {
        return Ok(());
    };
    let ctx = &sctx.ctx;
    let mut lp = ListParams::default();
    if let Some(sel) = &ctx.options.published_resource_selector {
        lp = lp.labels(sel);
    }
    let prs = Api::<PublishedResource>::all(ctx.client.clone()).list(&lp).await?;
    let desired: HashMap<String, PublishedResource> = prs
        .into_iter()
        .filter(|pr| pr.meta().deletion_timestamp.is_none())
        .filter(|pr| {
            pr.status
                .as_ref()
                .is_some_and(|s| s.resource_schema_name.is_some())
        })
        .map(|pr| (worker_key(&pr), pr))
        .collect();

    // Collect controllers whose publication changed or whose task died.
    let keys: Vec<String> = state.workers.keys().cloned().collect();
    for key in keys {
        let finished = state.workers.get(&key).is_some_and(SyncWorker::finished);
        if finished {
            warn!(key, "sync controller ended prematurely, collecting");
        }
        if finished || !desired.contains_key(&key) {
            if let Some(worker) = state.workers.remove(&key) {
                worker.stop().await;
            }
        }
    }

    for (key, pr) in desired {
        if state.workers.contains_key(&key) {
            continue;
        }
        info!(key, publication = pr.name_any(), "starting sync controller");
        match start_worker(sctx, vw.clone(), pr).await {
            Ok(worker) => {
                state.workers.insert(key, worker);
            }
            Err(err) => error!(%err, key, "failed to start sync controller"),
        }
    }
    Ok(())
}

struct SyncContext {
    syncer: Arc<PrimarySyncer>,
    vw: Arc<VirtualWorkspace>,
    recorder: kube::runtime::events::Recorder,
    publication_ref: k8s_openapi::api::core::v1::ObjectReference,
}

async fn start_worker(
    sctx: &Arc<SupervisorContext>,
    vw: Arc<VirtualWorkspace>,
    pr: PublishedResource,
) -> Result<SyncWorker> {
    let ctx = &sctx.ctx;
    let gvk = GroupVersionKind::gvk(
        &pr.spec.resource.api_group,
        &pr.spec.resource.version,
        &pr.spec.resource.kind,
    );
    let crd = discovery::discover(&ctx.client, &gvk).await?;
    let projected = projection::project(&pr, &ctx.options.apiexport_ref, &crd)?;

    let platform_ar = projected.api_resource();
    let local_ar = ApiResource::from_gvk_with_plural(&gvk, &crd.spec.names.plural);
    let platform_namespaced = projected.scope == ResourceScope::Namespaced;
    let local_namespaced = crd.spec.scope == "Namespaced";
    let subresources: Vec<String> = crd
        .spec
        .versions
        .first()
        .and_then(|v| v.subresources.as_ref())
        .map(|sub| {
            let mut out = Vec::new();
            if sub.status.is_some() {
                out.push("status".to_string());
            }
            if sub.scale.is_some() {
                out.push("scale".to_string());
            }
            out
        })
        .unwrap_or_default();

    // The endpoint must actually serve the projected resource before the
    // controller starts watching it.
    let probe: Api<DynamicObject> = Api::all_with(vw.wildcard(), &platform_ar);
    probe.list(&ListParams::default().limit(1)).await?;

    let syncer = Arc::new(PrimarySyncer {
        pr: Arc::new(pr.clone()),
        local: ctx.client.clone(),
        vw: vw.clone(),
        platform_resource: platform_ar.clone(),
        platform_namespaced,
        local_resource: local_ar.clone(),
        local_namespaced,
        subresources,
        state: StateStore::new_secret(ctx.client.clone(), ctx.options.namespace.clone()),
        agent_name: ctx.options.agent_name.clone(),
    });

    let mut platform_cfg = watcher::Config::default();
    if let Some(sel) = pr
        .spec
        .filter
        .as_ref()
        .and_then(|f| f.resource.as_ref())
        .and_then(selector_string)
    {
        platform_cfg = platform_cfg.labels(&sel);
    }
    let local_cfg = watcher::Config::default().labels(&format!(
        "{}={}",
        agent_name_label(),
        ctx.options.agent_name,
    ));

    let platform_api: Api<DynamicObject> = Api::all_with(vw.wildcard(), &platform_ar);
    let local_api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &local_ar);
    let map_ar = platform_ar.clone();

    let cancel = sctx.root.child_token();
    let stop = cancel.clone();
    let ctl = Controller::new_with(platform_api, platform_cfg, platform_ar)
        .with_config(kube::runtime::controller::Config::default().concurrency(SYNC_WORKERS))
        .watches_with(
            local_api,
            local_ar,
            local_cfg,
            move |obj: DynamicObject| -> Option<ObjectRef<DynamicObject>> {
                // Map a service-side copy back to its remote coordinates.
                let annotations = obj.annotations();
                let name = annotations.get(remote_name_annotation())?.clone();
                let namespace = annotations
                    .get(remote_namespace_annotation())
                    .filter(|ns| !ns.is_empty())
                    .cloned();
                let objref = ObjectRef::<DynamicObject>::new_with(&name, map_ar.clone());
                Some(match namespace {
                    Some(ns) => objref.within(&ns),
                    None => objref,
                })
            },
        )
        .graceful_shutdown_on(cancel.cancelled_owned());

    let sync_ctx = Arc::new(SyncContext {
        syncer,
        vw,
        recorder: ctx.recorder.clone(),
        publication_ref: pr.object_ref(&()),
    });
    let publication = pr.name_any();
    let handle = tokio::spawn(async move {
        ctl.run(sync_reconcile, sync_error_policy, sync_ctx)
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
        debug!(publication, "sync controller finished");
    });

    Ok(SyncWorker { cancel: stop, handle })
}

#[instrument(skip_all, fields(name = obj.name_any(), namespace = obj.namespace()))]
async fn sync_reconcile(obj: Arc<DynamicObject>, ctx: Arc<SyncContext>) -> Result<Action> {
    metrics::counter!("sync_agent_reconciles_total", "controller" => "sync").increment(1);
    if !ctx.syncer.matches_filter(&obj) {
        trace!("object does not match the publication filter");
        return Ok(Action::await_change());
    }
    if !matches_namespace_filter(&obj, &ctx).await? {
        trace!("namespace does not match the publication filter");
        return Ok(Action::await_change());
    }
    match ctx.syncer.process(&obj).await {
        // A change was made; run again once the watch has caught up.
        Ok(true) => Ok(Action::requeue(Duration::from_millis(250))),
        Ok(false) => Ok(DEFAULT_REQUEUE.clone()),
        Err(err @ (Error::InvalidPublication(_) | Error::InvalidMutation(_))) => {
            // Configuration errors are surfaced on the publication itself.
            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "SyncFailed".into(),
                        note: Some(format!("cannot sync `{}`: {err}", obj.name_any())),
                        action: "Sync".into(),
                        secondary: None,
                    },
                    &ctx.publication_ref,
                )
                .await
                .map_err(Error::Kube)?;
            Err(err)
        }
        Err(err) => Err(err),
    }
}

async fn matches_namespace_filter(obj: &DynamicObject, ctx: &SyncContext) -> Result<bool> {
    let Some(selector) = ctx
        .syncer
        .pr
        .spec
        .filter
        .as_ref()
        .and_then(|f| f.namespace.as_ref())
    else {
        return Ok(true);
    };
    let Some(ns) = obj.namespace() else {
        return Ok(true);
    };
    let Some(cluster) = obj.annotations().get(CLUSTER_ANNOTATION) else {
        return Ok(false);
    };
    let client = ctx.vw.cluster_client(cluster)?;
    let api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client);
    match api.get_opt(&ns).await? {
        Some(namespace) => Ok(selector_matches(selector, namespace.labels())),
        None => Ok(false),
    }
}

fn sync_error_policy(obj: Arc<DynamicObject>, err: &Error, _ctx: Arc<SyncContext>) -> Action {
    error!(
        error = err.to_string(),
        name = obj.name_any(),
        namespace = obj.namespace(),
        "sync reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}
