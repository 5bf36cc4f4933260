//! kube-rs glue: the reconcile entry points for Application and ApplicationConfig, the error
//! policy, and the controller loops that drive them.

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
    },
    Client, Resource,
};
use std::sync::Arc;
use tracing::*;

use crate::application_types::*;
use crate::change_filter::EventGate;
use crate::common::object_key;
use crate::config::ControllerConfig;
use crate::config_binding::ConfigConverger;
use crate::error::{Error, Stage};
use crate::pipeline::Orchestrator;
use crate::revision::{RevisionOutcome, RevisionTracker};
use crate::store::{kind_of, KubeStore, ObjectStore, StoredObject};

/// Shared by every reconcile of both controllers.
pub struct Context<S> {
    pub store: Arc<S>,
    pub orchestrator: Orchestrator<S>,
    pub tracker: RevisionTracker<S>,
    pub configs: ConfigConverger<S>,
    pub gate: EventGate,
    pub config: ControllerConfig,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(store: Arc<S>, config: ControllerConfig) -> Self {
        Context {
            orchestrator: Orchestrator::new(store.clone()),
            tracker: RevisionTracker::new(store.clone()),
            configs: ConfigConverger::new(store.clone()),
            gate: EventGate::new(),
            store,
            config,
        }
    }
}

fn identity<K: Resource>(obj: &K) -> Result<(String, String), Error> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    Ok((namespace, name))
}

pub async fn reconcile_application<S: ObjectStore>(
    app_from_cache: Arc<Application>,
    ctx: Arc<Context<S>>,
) -> Result<Action, Error> {
    let (namespace, name) = identity(app_from_cache.as_ref())?;
    let key = object_key(&namespace, &name);

    if app_from_cache.metadata.deletion_timestamp.is_some() {
        ctx.gate.forget(&app_from_cache);
        info!("{} is being deleted, end reconcile", key);
        return Ok(Action::await_change());
    }
    if !ctx.gate.admit_event(&app_from_cache) {
        info!("Only the revision number of {} changed, skip", key);
        return Ok(Action::requeue(ctx.config.requeue_after));
    }

    // The cached copy may be behind our own writes; converge from the stored object.
    let app = match ctx
        .store
        .get::<Application>(&namespace, &name)
        .await
        .map_err(|e| Error::store(Stage::Fetch, kind_of::<Application>(), &key, e))?
    {
        Some(app) => app,
        None => {
            ctx.gate.forget(&app_from_cache);
            info!("{} not found, end reconcile", key);
            return Ok(Action::await_change());
        }
    };

    let report = ctx.orchestrator.converge(&app).await?;
    info!(
        "Converged {}: state {:?}, {} stage(s) checked",
        key,
        report.state,
        report.writes.len()
    );

    match ctx.tracker.create_if_needed(&namespace, &name).await? {
        RevisionOutcome::Created { name: revision, .. } => info!("Recorded revision {}", revision),
        RevisionOutcome::CounterHealed { name: revision, .. } => {
            info!("Counter of {} moved to existing revision {}", key, revision)
        }
        RevisionOutcome::Unchanged { .. } => {}
    }

    Ok(Action::requeue(ctx.config.requeue_after))
}

pub async fn reconcile_config<S: ObjectStore>(
    cfg_from_cache: Arc<ApplicationConfig>,
    ctx: Arc<Context<S>>,
) -> Result<Action, Error> {
    let (namespace, name) = identity(cfg_from_cache.as_ref())?;
    let key = object_key(&namespace, &name);

    let cfg = match ctx
        .store
        .get::<ApplicationConfig>(&namespace, &name)
        .await
        .map_err(|e| Error::store(Stage::Fetch, kind_of::<ApplicationConfig>(), &key, e))?
    {
        Some(cfg) => cfg,
        None => {
            info!("{} not found, end reconcile", key);
            return Ok(Action::await_change());
        }
    };

    let outcome = ctx.configs.converge_config(&cfg).await?;
    info!("Config {} served from Secret {}", key, outcome.secret_name);
    Ok(Action::requeue(ctx.config.requeue_after))
}

pub fn error_policy<K, S>(_object: Arc<K>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(ctx.config.error_requeue_after)
}

pub fn report_controller_reconciled<K, QueueErr>(
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<Error, QueueErr>>,
) where
    K: Resource,
    QueueErr: std::error::Error,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "Failed to reconcile object",
            );
        }
    }
}

/// A deleted Application never reaches `reconcile_application`: the controller reports it as
/// missing from its cache instead. Drop its gate entry there.
pub fn forget_deleted<S, QueueErr>(
    ctx: &Context<S>,
    result: &Result<(ObjectRef<Application>, Action), controller::Error<Error, QueueErr>>,
) where
    QueueErr: std::error::Error,
{
    if let Err(controller::Error::ObjectNotFound(obj_ref)) = result {
        ctx.gate.forget_named(obj_ref.namespace.as_deref(), &obj_ref.name);
    }
}

fn scoped_api<K: StoredObject>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Runs both controllers until a shutdown signal arrives.
pub async fn run(client: Client, config: ControllerConfig) {
    let namespace = config.namespace.clone();
    let ns = namespace.as_deref();
    let ctx = Arc::new(Context::new(Arc::new(KubeStore::new(client.clone())), config));
    let gate_ctx = ctx.clone();

    let app_reconciler = Controller::new(scoped_api::<Application>(&client, ns), ListParams::default())
        .owns(scoped_api::<Deployment>(&client, ns), ListParams::default())
        .shutdown_on_signal()
        .run(
            reconcile_application::<KubeStore>,
            error_policy::<Application, KubeStore>,
            ctx.clone(),
        )
        .map(move |res| {
            forget_deleted(&gate_ctx, &res);
            report_controller_reconciled("application-reconciler", &res)
        });
    let cfg_reconciler = Controller::new(scoped_api::<ApplicationConfig>(&client, ns), ListParams::default())
        .owns(scoped_api::<Secret>(&client, ns), ListParams::default())
        .shutdown_on_signal()
        .run(
            reconcile_config::<KubeStore>,
            error_policy::<ApplicationConfig, KubeStore>,
            ctx,
        )
        .map(|res| report_controller_reconciled("application-config-reconciler", &res));

    match ns {
        Some(ns) => info!("running paas-controller in namespace {}", ns),
        None => info!("running paas-controller in all namespaces"),
    }
    futures::stream::select(app_reconciler, cfg_reconciler)
        .collect::<()>()
        .await;
    info!("controller terminated");
}
