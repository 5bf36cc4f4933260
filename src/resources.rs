use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as networkingv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

use crate::application_types::ApplicationSpec;
use crate::common::*;

/// The smallest Deployment that satisfies the API server; everything the Application spec
/// controls is filled in by [`apply_workload_fields`].
pub fn make_deployment(app_name: &str, namespace: &str) -> appsv1::Deployment {
    appsv1::Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name(app_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(app_name)),
            ..ObjectMeta::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            selector: metav1::LabelSelector {
                match_labels: Some(app_labels(app_name)),
                ..metav1::LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels(app_name)),
                    ..ObjectMeta::default()
                }),
                spec: Some(corev1::PodSpec {
                    containers: vec![corev1::Container {
                        name: app_name.to_string(),
                        ..corev1::Container::default()
                    }],
                    ..corev1::PodSpec::default()
                }),
            },
            ..appsv1::DeploymentSpec::default()
        }),
        ..appsv1::Deployment::default()
    }
}

/// Write the fields the Application owns onto a new or existing Deployment. Anything else on
/// the object (defaults filled in by the API server, edits by other tools) is left alone.
pub fn apply_workload_fields(deployment: &mut appsv1::Deployment, app_name: &str, spec: &ApplicationSpec) {
    let deployment_spec = deployment.spec.get_or_insert_with(appsv1::DeploymentSpec::default);
    deployment_spec.replicas = Some(spec.replicas.max(0));

    let template = &mut deployment_spec.template;
    let pod_spec = template.spec.get_or_insert_with(corev1::PodSpec::default);
    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(corev1::Container {
            name: app_name.to_string(),
            ..corev1::Container::default()
        });
    }
    let container = &mut pod_spec.containers[0];
    container.image = Some(spec.image.clone());

    if spec.port != 0 {
        container.ports = Some(vec![corev1::ContainerPort {
            name: Some(HTTP_PORT_NAME.to_string()),
            container_port: spec.port,
            protocol: Some("TCP".to_string()),
            ..corev1::ContainerPort::default()
        }]);
    }

    if !spec.config_ref.is_empty() {
        container.env_from = Some(vec![corev1::EnvFromSource {
            secret_ref: Some(corev1::SecretEnvSource {
                name: Some(spec.config_ref.clone()),
                ..corev1::SecretEnvSource::default()
            }),
            ..corev1::EnvFromSource::default()
        }]);
    }

    // A new marker changes the pod template, which makes the Deployment roll its pods.
    if !spec.restart_marker.is_empty() {
        template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(RESTART_MARKER_ANNOTATION.to_string(), spec.restart_marker.clone());
    }
}

pub fn make_service(app_name: &str, namespace: &str) -> corev1::Service {
    corev1::Service {
        metadata: ObjectMeta {
            name: Some(network_endpoint_name(app_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(app_name)),
            ..ObjectMeta::default()
        },
        ..corev1::Service::default()
    }
}

pub fn apply_service_fields(service: &mut corev1::Service, app_name: &str, spec: &ApplicationSpec) {
    let service_spec = service.spec.get_or_insert_with(corev1::ServiceSpec::default);
    service_spec.type_ = Some("ClusterIP".to_string());
    service_spec.selector = Some(app_labels(app_name));
    service_spec.ports = Some(vec![corev1::ServicePort {
        name: Some(HTTP_PORT_NAME.to_string()),
        protocol: Some("TCP".to_string()),
        port: EXPOSED_PORT,
        target_port: Some(IntOrString::Int(spec.port)),
        ..corev1::ServicePort::default()
    }]);
}

pub fn make_ingress(app_name: &str, namespace: &str) -> networkingv1::Ingress {
    networkingv1::Ingress {
        metadata: ObjectMeta {
            name: Some(routing_name(app_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(app_name)),
            ..ObjectMeta::default()
        },
        ..networkingv1::Ingress::default()
    }
}

/// Replace the Ingress rule set with one rule per domain. Nothing from the previous rule set
/// survives, so removed domains stop routing on the next pass.
pub fn apply_routing_rules(ingress: &mut networkingv1::Ingress, app_name: &str, spec: &ApplicationSpec) {
    let rules: Vec<networkingv1::IngressRule> = spec
        .domains
        .iter()
        .map(|domain| networkingv1::IngressRule {
            host: Some(domain.host.clone()),
            http: Some(networkingv1::HTTPIngressRuleValue {
                paths: vec![networkingv1::HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: networkingv1::IngressBackend {
                        service: Some(networkingv1::IngressServiceBackend {
                            name: network_endpoint_name(app_name),
                            port: Some(networkingv1::ServiceBackendPort {
                                number: Some(EXPOSED_PORT),
                                ..networkingv1::ServiceBackendPort::default()
                            }),
                        }),
                        ..networkingv1::IngressBackend::default()
                    },
                }],
            }),
        })
        .collect();

    let tls: Vec<networkingv1::IngressTLS> = spec
        .domains
        .iter()
        .filter_map(|domain| {
            domain.tls_secret_name.as_ref().map(|secret| networkingv1::IngressTLS {
                hosts: Some(vec![domain.host.clone()]),
                secret_name: Some(secret.clone()),
            })
        })
        .collect();

    let ingress_spec = ingress.spec.get_or_insert_with(networkingv1::IngressSpec::default);
    // The API server drops empty lists, so store None to keep passes comparable.
    ingress_spec.rules = if rules.is_empty() { None } else { Some(rules) };
    ingress_spec.tls = if tls.is_empty() { None } else { Some(tls) };
}

pub fn secret_data(entries: &BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    entries
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone().into_bytes())))
        .collect()
}

pub fn make_config_secret(
    config_name: &str,
    namespace: &str,
    secret_name: &str,
    entries: &BTreeMap<String, String>,
) -> corev1::Secret {
    corev1::Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(config_name)),
            ..ObjectMeta::default()
        },
        data: Some(secret_data(entries)),
        type_: Some("Opaque".to_string()),
        ..corev1::Secret::default()
    }
}
