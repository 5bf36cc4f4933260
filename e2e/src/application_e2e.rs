use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{api::Api, discovery::Discovery, Client};
use paas_controller::application_types::*;
use paas_controller::common::REVISION_NUMBER_ANNOTATION;
use paas_controller::revision::revision_history;
use paas_controller::store::KubeStore;
use std::time::Duration;
use tokio::time::sleep;

use crate::common::*;

const TIMEOUT: Duration = Duration::from_secs(240);

pub fn application(image: &str) -> String {
    format!(
        "
    apiVersion: paas.anvil.dev/v1
    kind: Application
    metadata:
        name: shop
        namespace: default
    spec:
        image: {}
        replicas: 2
        port: 80
        routingEnabled: true
        domains:
            - host: shop.example.com
    ",
        image
    )
}

pub fn application_config(db_host: &str) -> String {
    format!(
        "
    apiVersion: paas.anvil.dev/v1
    kind: ApplicationConfig
    metadata:
        name: shop
        namespace: default
    spec:
        entries:
            DB_HOST: {}
            LOG_FORMAT: json
    ",
        db_host
    )
}

fn revision_number(app: &Application) -> Option<String> {
    app.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_NUMBER_ANNOTATION).cloned())
}

async fn wait_for_image(client: &Client, image: &str) -> Result<(), Error> {
    let deploy_api: Api<Deployment> = Api::default_namespaced(client.clone());
    wait_for(&format!("Deployment with image {}", image), TIMEOUT, || {
        let deploy_api = deploy_api.clone();
        async move {
            let deployment = match deploy_api.get_opt("shop").await? {
                Some(d) => d,
                None => return Ok(None),
            };
            let spec = deployment
                .spec
                .ok_or_else(|| Error::Inconsistent("Deployment".to_string()))?;
            let current = spec
                .template
                .spec
                .and_then(|p| p.containers.into_iter().next())
                .and_then(|c| c.image);
            if current.as_deref() != Some(image) {
                return Ok(None);
            }
            if spec.replicas != Some(2) {
                return Err(Error::Inconsistent("Deployment replicas".to_string()));
            }
            Ok::<_, Error>(Some(()))
        }
    })
    .await
}

async fn wait_for_revision(client: &Client, number: &str) -> Result<(), Error> {
    let app_api: Api<Application> = Api::default_namespaced(client.clone());
    let rev_api: Api<ApplicationRevision> = Api::default_namespaced(client.clone());
    wait_for(&format!("revision {}", number), TIMEOUT, || {
        let app_api = app_api.clone();
        let rev_api = rev_api.clone();
        async move {
            let app = app_api.get("shop").await?;
            if revision_number(&app).as_deref() != Some(number) {
                return Ok(None);
            }
            Ok::<_, Error>(rev_api.get_opt(&format!("shop-v{}", number)).await?.map(|_| ()))
        }
    })
    .await
}

pub async fn application_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client.clone()).run().await?;

    apply(&application("nginx:1.25"), client.clone(), &discovery).await?;
    wait_for_image(&client, "nginx:1.25").await?;

    let svc_api: Api<Service> = Api::default_namespaced(client.clone());
    let svc = wait_for("Service", TIMEOUT, || {
        let svc_api = svc_api.clone();
        async move { Ok::<_, Error>(svc_api.get_opt("shop").await?) }
    })
    .await?;
    let port = svc
        .spec
        .and_then(|s| s.ports)
        .and_then(|p| p.into_iter().next())
        .ok_or_else(|| Error::Inconsistent("Service".to_string()))?;
    if port.port != 80 || port.target_port != Some(IntOrString::Int(80)) {
        return Err(Error::Inconsistent("Service port".to_string()));
    }

    let ing_api: Api<Ingress> = Api::default_namespaced(client.clone());
    let ingress = wait_for("Ingress", TIMEOUT, || {
        let ing_api = ing_api.clone();
        async move { Ok::<_, Error>(ing_api.get_opt("shop").await?) }
    })
    .await?;
    let host = ingress
        .spec
        .and_then(|s| s.rules)
        .and_then(|r| r.into_iter().next())
        .and_then(|r| r.host);
    if host.as_deref() != Some("shop.example.com") {
        return Err(Error::Inconsistent("Ingress host".to_string()));
    }

    wait_for_revision(&client, "1").await?;

    apply(&application("nginx:1.26"), client.clone(), &discovery).await?;
    wait_for_image(&client, "nginx:1.26").await?;
    wait_for_revision(&client, "2").await?;

    // The counter bump must not feed back into further revisions.
    sleep(Duration::from_secs(30)).await;
    let store = KubeStore::new(client.clone());
    let history = revision_history(&store, "default", "shop")
        .await
        .map_err(|e| Error::Inconsistent(format!("ApplicationRevision history: {}", e)))?;
    let numbers: Vec<u64> = history.iter().map(|(n, _)| *n).collect();
    if numbers != vec![1, 2] {
        println!("Found revisions {:?}, expected [1, 2]", numbers);
        return Err(Error::Inconsistent("ApplicationRevision history".to_string()));
    }
    if history[1].1.spec.app.image != "nginx:1.26" {
        return Err(Error::Inconsistent("ApplicationRevision snapshot".to_string()));
    }

    println!("Application e2e test passed.");
    Ok(())
}

pub async fn application_config_e2e_test() -> Result<(), Error> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client.clone()).run().await?;

    apply(&application("nginx:1.25"), client.clone(), &discovery).await?;
    apply(&application_config("db"), client.clone(), &discovery).await?;

    let app_api: Api<Application> = Api::default_namespaced(client.clone());
    let first_ref = wait_for("configRef", TIMEOUT, || {
        let app_api = app_api.clone();
        async move {
            let app = app_api.get("shop").await?;
            Ok::<_, Error>(Some(app.spec.config_ref).filter(|r| !r.is_empty()))
        }
    })
    .await?;

    let secret_api: Api<Secret> = Api::default_namespaced(client.clone());
    if secret_api.get_opt(&first_ref).await?.is_none() {
        return Err(Error::Inconsistent("config Secret".to_string()));
    }

    let deploy_api: Api<Deployment> = Api::default_namespaced(client.clone());
    wait_for("envFrom", TIMEOUT, || {
        let deploy_api = deploy_api.clone();
        let first_ref = first_ref.clone();
        async move {
            let deployment = deploy_api.get("shop").await?;
            let env_from = deployment
                .spec
                .and_then(|s| s.template.spec)
                .and_then(|p| p.containers.into_iter().next())
                .and_then(|c| c.env_from)
                .unwrap_or_default();
            let bound = env_from
                .iter()
                .filter_map(|e| e.secret_ref.as_ref())
                .any(|s| s.name.as_deref() == Some(first_ref.as_str()));
            Ok::<_, Error>(if bound { Some(()) } else { None })
        }
    })
    .await?;

    apply(&application_config("db2"), client.clone(), &discovery).await?;
    let second_ref = wait_for("new configRef", TIMEOUT, || {
        let app_api = app_api.clone();
        let first_ref = first_ref.clone();
        async move {
            let app = app_api.get("shop").await?;
            Ok::<_, Error>(Some(app.spec.config_ref).filter(|r| !r.is_empty() && *r != first_ref))
        }
    })
    .await?;

    // Content-addressed: the old Secret stays, the new one is added.
    if secret_api.get_opt(&first_ref).await?.is_none() || secret_api.get_opt(&second_ref).await?.is_none() {
        return Err(Error::Inconsistent("config Secrets".to_string()));
    }

    println!("Application config e2e test passed.");
    Ok(())
}
