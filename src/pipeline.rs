//! The staged upsert pipeline that derives an Application's infrastructure.
//!
//! Stages run in a fixed order and each one only starts once the previous stage's write has
//! returned. A stage whose precondition does not hold is skipped, and so is everything after
//! it, so no object ever exists without the objects it depends on.

use std::fmt;
use std::sync::Arc;
use tracing::*;

use crate::application_types::{Application, ApplicationSpec};
use crate::common::*;
use crate::error::{Error, Stage};
use crate::ownership::bind_owner;
use crate::resources::*;
use crate::store::{kind_of, ObjectStore, StoredObject};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Workload,
    NetworkEndpoint,
    Routing,
}

impl From<PipelineStage> for Stage {
    fn from(stage: PipelineStage) -> Stage {
        match stage {
            PipelineStage::Workload => Stage::Workload,
            PipelineStage::NetworkEndpoint => Stage::NetworkEndpoint,
            PipelineStage::Routing => Stage::Routing,
        }
    }
}

/// How far one pass got. Each state names the last stage that converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceState {
    NotReady,
    WorkloadReady,
    EndpointReady,
    RoutingReady,
}

impl ConvergenceState {
    pub fn next_stage(self) -> Option<PipelineStage> {
        match self {
            ConvergenceState::NotReady => Some(PipelineStage::Workload),
            ConvergenceState::WorkloadReady => Some(PipelineStage::NetworkEndpoint),
            ConvergenceState::EndpointReady => Some(PipelineStage::Routing),
            ConvergenceState::RoutingReady => None,
        }
    }

    pub fn advance(self) -> ConvergenceState {
        match self {
            ConvergenceState::NotReady => ConvergenceState::WorkloadReady,
            ConvergenceState::WorkloadReady => ConvergenceState::EndpointReady,
            ConvergenceState::EndpointReady | ConvergenceState::RoutingReady => ConvergenceState::RoutingReady,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingImage,
    NoPort,
    RoutingDisabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingImage => f.write_str("spec.image is empty"),
            SkipReason::NoPort => f.write_str("spec.port is 0"),
            SkipReason::RoutingDisabled => f.write_str("spec.routingEnabled is false"),
        }
    }
}

/// The spec-level condition for entering `stage`. That the previous stage converged is
/// guaranteed by [`ConvergenceState`], not checked here.
pub fn precondition(stage: PipelineStage, spec: &ApplicationSpec) -> Result<(), SkipReason> {
    match stage {
        PipelineStage::Workload if spec.image.is_empty() => Err(SkipReason::MissingImage),
        PipelineStage::NetworkEndpoint if spec.port == 0 => Err(SkipReason::NoPort),
        PipelineStage::Routing if !spec.routing_enabled => Err(SkipReason::RoutingDisabled),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub state: ConvergenceState,
    pub skipped: Option<(PipelineStage, SkipReason)>,
    pub writes: Vec<(PipelineStage, WriteOutcome)>,
}

impl ConvergenceReport {
    pub fn wrote_anything(&self) -> bool {
        self.writes.iter().any(|(_, o)| *o != WriteOutcome::Unchanged)
    }
}

pub struct Orchestrator<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> Orchestrator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Orchestrator { store }
    }

    pub async fn converge(&self, app: &Application) -> Result<ConvergenceReport, Error> {
        let namespace = app
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = app
            .metadata
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;

        let mut report = ConvergenceReport {
            state: ConvergenceState::NotReady,
            skipped: None,
            writes: Vec::new(),
        };
        while let Some(stage) = report.state.next_stage() {
            if let Err(reason) = precondition(stage, &app.spec) {
                info!("Skip {} stage for {}/{}: {}", Stage::from(stage), namespace, name, reason);
                report.skipped = Some((stage, reason));
                break;
            }
            let outcome = self.run_stage(stage, app, namespace, name).await?;
            report.writes.push((stage, outcome));
            report.state = report.state.advance();
        }
        Ok(report)
    }

    async fn run_stage(
        &self,
        stage: PipelineStage,
        app: &Application,
        namespace: &str,
        name: &str,
    ) -> Result<WriteOutcome, Error> {
        let spec = &app.spec;
        match stage {
            PipelineStage::Workload => {
                self.upsert::<Deployment>(
                    stage,
                    app,
                    namespace,
                    &workload_name(name),
                    || make_deployment(name, namespace),
                    |d| apply_workload_fields(d, name, spec),
                )
                .await
            }
            PipelineStage::NetworkEndpoint => {
                self.upsert::<Service>(
                    stage,
                    app,
                    namespace,
                    &network_endpoint_name(name),
                    || make_service(name, namespace),
                    |s| apply_service_fields(s, name, spec),
                )
                .await
            }
            PipelineStage::Routing => {
                self.upsert::<Ingress>(
                    stage,
                    app,
                    namespace,
                    &routing_name(name),
                    || make_ingress(name, namespace),
                    |i| apply_routing_rules(i, name, spec),
                )
                .await
            }
        }
    }

    /// Fetch `name`; mutate the stored copy, or a fresh object owned by `app` if there is none;
    /// write only when the result differs from what is stored.
    async fn upsert<K>(
        &self,
        stage: PipelineStage,
        app: &Application,
        namespace: &str,
        name: &str,
        make: impl FnOnce() -> K,
        apply: impl Fn(&mut K),
    ) -> Result<WriteOutcome, Error>
    where
        K: StoredObject + PartialEq,
    {
        let kind = kind_of::<K>();
        let key = object_key(namespace, name);
        let stage = Stage::from(stage);

        let existing = self
            .store
            .get::<K>(namespace, name)
            .await
            .map_err(|e| Error::store(stage, &kind, &key, e))?;

        match existing {
            Some(current) => {
                let mut desired = current.clone();
                apply(&mut desired);
                if desired == current {
                    return Ok(WriteOutcome::Unchanged);
                }
                self.store
                    .replace(namespace, name, &desired)
                    .await
                    .map_err(|e| Error::store(stage, &kind, &key, e))?;
                info!("Update {}: {}", kind, key);
                Ok(WriteOutcome::Updated)
            }
            None => {
                let mut obj = make();
                apply(&mut obj);
                bind_owner(app, &mut obj)?;
                self.store
                    .create(namespace, &obj)
                    .await
                    .map_err(|e| Error::store(stage, &kind, &key, e))?;
                info!("Create {}: {}", kind, key);
                Ok(WriteOutcome::Created)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_types::ApplicationDomain;
    use crate::error::ErrorKind;
    use crate::store::memory::{Fault, MemoryStore, Op};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::ObjectMeta;

    const NS: &str = "default";

    fn seeded(store: &MemoryStore, spec: ApplicationSpec) -> Application {
        store.seed(
            NS,
            &Application {
                metadata: ObjectMeta {
                    name: Some("shop".to_string()),
                    namespace: Some(NS.to_string()),
                    ..ObjectMeta::default()
                },
                spec,
            },
        )
    }

    fn full_spec() -> ApplicationSpec {
        ApplicationSpec {
            image: "nginx:1".to_string(),
            replicas: 2,
            port: 8080,
            routing_enabled: true,
            domains: vec![ApplicationDomain {
                host: "a.example.com".to_string(),
                tls_secret_name: None,
            }],
            ..ApplicationSpec::default()
        }
    }

    #[test]
    fn test_state_machine_walks_every_stage_once() {
        let mut state = ConvergenceState::NotReady;
        let mut stages = vec![];
        while let Some(stage) = state.next_stage() {
            stages.push(stage);
            state = state.advance();
        }
        assert_eq!(
            stages,
            vec![
                PipelineStage::Workload,
                PipelineStage::NetworkEndpoint,
                PipelineStage::Routing
            ]
        );
        assert_eq!(state, ConvergenceState::RoutingReady);
    }

    #[test]
    fn test_preconditions() {
        let spec = ApplicationSpec::default();
        assert_eq!(precondition(PipelineStage::Workload, &spec), Err(SkipReason::MissingImage));
        assert_eq!(precondition(PipelineStage::NetworkEndpoint, &spec), Err(SkipReason::NoPort));
        assert_eq!(precondition(PipelineStage::Routing, &spec), Err(SkipReason::RoutingDisabled));
        let spec = full_spec();
        assert_eq!(precondition(PipelineStage::Workload, &spec), Ok(()));
        assert_eq!(precondition(PipelineStage::NetworkEndpoint, &spec), Ok(()));
        assert_eq!(precondition(PipelineStage::Routing, &spec), Ok(()));
    }

    #[tokio::test]
    async fn test_no_image_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let app = seeded(&store, ApplicationSpec::default());
        let report = Orchestrator::new(store.clone()).converge(&app).await.unwrap();
        assert_eq!(report.state, ConvergenceState::NotReady);
        assert_eq!(report.skipped, Some((PipelineStage::Workload, SkipReason::MissingImage)));
        assert_eq!(store.total_objects(), 1);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_image_without_port_creates_only_workload() {
        let store = Arc::new(MemoryStore::new());
        let app = seeded(
            &store,
            ApplicationSpec {
                image: "nginx:1".to_string(),
                // Routing is ignored while the endpoint stage is skipped.
                routing_enabled: true,
                ..ApplicationSpec::default()
            },
        );
        let report = Orchestrator::new(store.clone()).converge(&app).await.unwrap();
        assert_eq!(report.state, ConvergenceState::WorkloadReady);
        assert_eq!(report.skipped, Some((PipelineStage::NetworkEndpoint, SkipReason::NoPort)));
        assert_eq!(store.count::<Deployment>(NS), 1);
        assert_eq!(store.count::<Service>(NS), 0);
        assert_eq!(store.count::<Ingress>(NS), 0);

        let deployment = store.fetch::<Deployment>(NS, "shop").unwrap();
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.ports, None);
    }

    #[tokio::test]
    async fn test_routing_disabled_creates_workload_and_endpoint() {
        let store = Arc::new(MemoryStore::new());
        let app = seeded(
            &store,
            ApplicationSpec {
                routing_enabled: false,
                ..full_spec()
            },
        );
        let report = Orchestrator::new(store.clone()).converge(&app).await.unwrap();
        assert_eq!(report.state, ConvergenceState::EndpointReady);
        assert_eq!(store.count::<Deployment>(NS), 1);
        assert_eq!(store.count::<Service>(NS), 1);
        assert_eq!(store.count::<Ingress>(NS), 0);

        let service = store.fetch::<Service>(NS, "shop").unwrap();
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[tokio::test]
    async fn test_full_spec_creates_all_three() {
        let store = Arc::new(MemoryStore::new());
        let app = seeded(&store, full_spec());
        let report = Orchestrator::new(store.clone()).converge(&app).await.unwrap();
        assert_eq!(report.state, ConvergenceState::RoutingReady);
        assert_eq!(report.skipped, None);
        assert_eq!(
            report.writes,
            vec![
                (PipelineStage::Workload, WriteOutcome::Created),
                (PipelineStage::NetworkEndpoint, WriteOutcome::Created),
                (PipelineStage::Routing, WriteOutcome::Created),
            ]
        );

        let deployment = store.fetch::<Deployment>(NS, "shop").unwrap();
        let pod_spec = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("nginx:1"));
        let owners = deployment.metadata.owner_references.unwrap();
        assert_eq!(owners[0].uid, app.metadata.uid.clone().unwrap());

        let ingress = store.fetch::<Ingress>(NS, "shop").unwrap();
        let rules = ingress.spec.unwrap().rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host.as_deref(), Some("a.example.com"));
        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "shop");
        assert_eq!(backend.port.as_ref().unwrap().number, Some(80));
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let app = seeded(&store, full_spec());
        let orchestrator = Orchestrator::new(store.clone());
        orchestrator.converge(&app).await.unwrap();
        let writes = store.write_count();
        let before = store.fetch::<Deployment>(NS, "shop");

        let report = orchestrator.converge(&app).await.unwrap();
        assert!(!report.wrote_anything());
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.fetch::<Deployment>(NS, "shop"), before);
    }

    #[tokio::test]
    async fn test_update_keeps_fields_it_does_not_manage() {
        let store = Arc::new(MemoryStore::new());
        let app = seeded(&store, full_spec());
        let mut existing = make_deployment("shop", NS);
        existing
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "web".to_string());
        existing.spec.as_mut().unwrap().revision_history_limit = Some(3);
        apply_workload_fields(
            &mut existing,
            "shop",
            &ApplicationSpec {
                image: "nginx:0".to_string(),
                ..ApplicationSpec::default()
            },
        );
        store.seed(NS, &existing);

        let report = Orchestrator::new(store.clone()).converge(&app).await.unwrap();
        assert_eq!(report.writes[0], (PipelineStage::Workload, WriteOutcome::Updated));
        let deployment = store.fetch::<Deployment>(NS, "shop").unwrap();
        assert_eq!(
            deployment.metadata.labels.unwrap().get("team").map(String::as_str),
            Some("web")
        );
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.revision_history_limit, Some(3));
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.template.spec.unwrap().containers[0].image.as_deref(),
            Some("nginx:1")
        );
    }

    #[tokio::test]
    async fn test_endpoint_failure_stops_the_pass() {
        let store = Arc::new(MemoryStore::new());
        let app = seeded(&store, full_spec());
        store.fail_next::<Service>(Op::Create, Fault::Unavailable);

        let err = Orchestrator::new(store.clone()).converge(&app).await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::NetworkEndpoint));
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("Service default/shop"));
        assert_eq!(store.count::<Deployment>(NS), 1);
        assert_eq!(store.count::<Ingress>(NS), 0);
    }

    #[tokio::test]
    async fn test_restart_marker_lands_on_pod_template() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(store.clone());
        let app = seeded(&store, full_spec());
        orchestrator.converge(&app).await.unwrap();

        let mut restarted = app.clone();
        restarted.spec.restart_marker = "2024-01-01T00:00:00Z".to_string();
        let report = orchestrator.converge(&restarted).await.unwrap();
        assert_eq!(report.writes[0], (PipelineStage::Workload, WriteOutcome::Updated));
        assert_eq!(report.writes[1], (PipelineStage::NetworkEndpoint, WriteOutcome::Unchanged));

        let deployment = store.fetch::<Deployment>(NS, "shop").unwrap();
        let annotations = deployment
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(
            annotations.get(RESTART_MARKER_ANNOTATION).map(String::as_str),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_domains_are_replaced_not_merged() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(store.clone());
        let mut spec = full_spec();
        spec.domains.push(ApplicationDomain {
            host: "b.example.com".to_string(),
            tls_secret_name: Some("b-tls".to_string()),
        });
        let app = seeded(&store, spec);
        orchestrator.converge(&app).await.unwrap();
        let ingress = store.fetch::<Ingress>(NS, "shop").unwrap().spec.unwrap();
        assert_eq!(ingress.rules.unwrap().len(), 2);
        assert_eq!(ingress.tls.unwrap()[0].secret_name.as_deref(), Some("b-tls"));

        let mut narrowed = app.clone();
        narrowed.spec.domains.remove(1);
        orchestrator.converge(&narrowed).await.unwrap();
        let ingress = store.fetch::<Ingress>(NS, "shop").unwrap().spec.unwrap();
        let hosts: Vec<_> = ingress
            .rules
            .unwrap()
            .into_iter()
            .filter_map(|r| r.host)
            .collect();
        assert_eq!(hosts, vec!["a.example.com".to_string()]);
        assert_eq!(ingress.tls, None);
    }

    #[tokio::test]
    async fn test_application_without_uid_cannot_own_children() {
        let store = Arc::new(MemoryStore::new());
        let mut app = seeded(&store, full_spec());
        app.metadata.uid = None;
        let err = Orchestrator::new(store.clone()).converge(&app).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingObjectKey);
        assert_eq!(store.count::<Deployment>(NS), 0);
    }
}
