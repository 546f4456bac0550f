//! State Machine & Persistence (C6): the reconcile entry point, the
//! Idle/InProgress/Finished transitions, and the bootstrap that wires the
//! Kubernetes watch into the reconciler.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload, Registry};

use crate::config;
use crate::crd::{Sosreport, SosreportStatus};
use crate::error::Error;
use crate::gateway::Gateway;
use crate::scheduler::{self, SharedCaches};

const REQUEUE_AFTER: Duration = Duration::from_secs(30);
const ERROR_REQUEUE_AFTER: Duration = Duration::from_secs(15);

/// Handle onto the `EnvFilter` layer installed in `main.rs`, letting the
/// reconciler flip the global log level at runtime from the `debug` key in
/// the development config map.
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, Registry>>;

pub struct Context {
    pub client: Client,
    pub caches: SharedCaches,
    pub log_reload_handle: LogReloadHandle,
}

impl Context {
    pub fn new(client: Client, log_reload_handle: LogReloadHandle) -> Arc<Self> {
        Arc::new(Context {
            client,
            caches: scheduler::Caches::new(),
            log_reload_handle,
        })
    }
}

/// Adjusts the global log level from the effective config's `debug` flag.
/// Called every reconcile, matching the original's per-reconcile
/// `DynamicLogLevel.MinLevel` assignment.
fn apply_log_level(handle: &LogReloadHandle, debug: bool) {
    let level = if debug { "debug" } else { "info" };
    if let Err(e) = handle.reload(EnvFilter::new(level)) {
        warn!(error = %e, "failed to reload log level");
    }
}

/// One reconcile of one Sosreport. Idempotent: re-entering this function with
/// the same observed state is always safe, which is what lets spurious
/// watch re-deliveries and operator restarts both fall out of the same code
/// path.
pub async fn reconcile(request: Arc<Sosreport>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = request.name_any();
    let namespace = request.namespace().unwrap_or_else(|| "default".to_string());
    let gateway = Gateway::new(ctx.client.clone(), &namespace);

    let request = match gateway.get_request(&name).await {
        Ok(fresh) => Arc::new(fresh),
        Err(Error::Kube(kube::Error::Api(e))) if e.code == 404 => {
            debug!(namespace, name, "sosreport no longer exists, dropping");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if request.uid().is_none() {
        return Err(Error::MissingUid {
            namespace: namespace.clone(),
            name: name.clone(),
        });
    }

    if request.finished() {
        debug!(namespace, name, "sosreport already finished, no-op");
        return Ok(Action::await_change());
    }

    let config = config::effective_config(&ctx.client, &namespace).await;
    apply_log_level(&ctx.log_reload_handle, config.debug);

    if !scheduler::in_run_list(&ctx.caches, &request) && !request.in_progress() {
        reconcile_planning(&gateway, &ctx, &request, &name).await
    } else {
        reconcile_progress(&gateway, &ctx, &request, &name, &config, &namespace).await
    }
}

async fn reconcile_planning(
    gateway: &Gateway,
    ctx: &Context,
    request: &Sosreport,
    name: &str,
) -> Result<Action, Error> {
    match scheduler::plan(gateway, &ctx.caches, request).await? {
        Some(selected) => {
            info!(name, nodes = selected.len(), "starting sosreport jobs");
            let status = SosreportStatus {
                inprogress: true,
                finished: false,
                ..Default::default()
            };
            gateway.patch_status(name, &status).await?;
            Ok(Action::requeue(REQUEUE_AFTER))
        }
        None => {
            // empty selector: remain Idle, retry on the next reconcile.
            Ok(Action::requeue(REQUEUE_AFTER))
        }
    }
}

async fn reconcile_progress(
    gateway: &Gateway,
    ctx: &Context,
    request: &Sosreport,
    name: &str,
    config: &config::ReconcilerConfig,
    namespace: &str,
) -> Result<Action, Error> {
    let environment = config::environment_map(&ctx.client, namespace).await;
    let outcome = scheduler::progress(gateway, &ctx.caches, request, config, &environment).await?;

    if outcome.annotations_changed {
        let annotations = scheduler::annotations_for(&outcome);
        gateway.patch_annotations(name, &annotations).await?;
    }

    for (reason, message) in &outcome.events {
        gateway.emit_event(request, reason, message).await;
    }

    let status = SosreportStatus {
        finished: outcome.done,
        inprogress: !outcome.done,
        currentlyrunningnodes: outcome.running.iter().cloned().collect(),
        outstandingnodes: outcome.to_run.iter().cloned().collect(),
    };
    gateway.patch_status(name, &status).await?;

    if outcome.done {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(REQUEUE_AFTER))
    }
}

fn error_policy(_request: Arc<Sosreport>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "reconcile failed, backing off");
    Action::requeue(ERROR_REQUEUE_AFTER)
}

/// Starts the controller: watches Sosreport and the Jobs it owns, dispatching
/// every observed change to [`reconcile`].
pub async fn run(client: Client, log_reload_handle: LogReloadHandle) -> anyhow::Result<()> {
    let requests: Api<Sosreport> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());
    let ctx = Context::new(client, log_reload_handle);

    Controller::new(requests, watcher::Config::default())
        .owns(jobs, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}
