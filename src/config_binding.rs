//! Turns an ApplicationConfig into a content-addressed Secret and points the Application of the
//! same name at it.
//!
//! Each distinct set of entries gets its own Secret named after the hash of the entries, so pods
//! still running against an older config keep reading the content they started with. Old
//! Secrets are left in place.

use std::sync::Arc;
use tracing::*;

use crate::application_types::{Application, ApplicationConfig};
use crate::common::*;
use crate::error::{Error, Stage};
use crate::ownership::bind_owner;
use crate::pipeline::WriteOutcome;
use crate::resources::{make_config_secret, secret_data};
use crate::revision::canonical_hash;
use crate::store::{kind_of, ObjectStore};
use k8s_openapi::api::core::v1::Secret;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOutcome {
    pub secret_name: String,
    pub secret: WriteOutcome,
    /// `None` when there is no Application to bind to yet.
    pub binding: Option<WriteOutcome>,
}

pub struct ConfigConverger<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> ConfigConverger<S> {
    pub fn new(store: Arc<S>) -> Self {
        ConfigConverger { store }
    }

    pub async fn converge_config(&self, cfg: &ApplicationConfig) -> Result<ConfigOutcome, Error> {
        let namespace = cfg
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = cfg
            .metadata
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;

        let hash = canonical_hash(&cfg.spec.entries).map_err(|e| Error::Serialization {
            stage: Stage::ConfigSecret,
            kind: kind_of::<ApplicationConfig>(),
            key: object_key(namespace, name),
            source: e,
        })?;
        let secret_name = config_secret_name(name, &hash);
        let secret = self.converge_secret(cfg, namespace, name, &secret_name).await?;
        let binding = self.bind_config_ref(namespace, name, &secret_name).await?;

        Ok(ConfigOutcome {
            secret_name,
            secret,
            binding,
        })
    }

    async fn converge_secret(
        &self,
        cfg: &ApplicationConfig,
        namespace: &str,
        config_name: &str,
        secret_name: &str,
    ) -> Result<WriteOutcome, Error> {
        let key = object_key(namespace, secret_name);
        let secret_kind = kind_of::<Secret>();
        let existing = self
            .store
            .get::<Secret>(namespace, secret_name)
            .await
            .map_err(|e| Error::store(Stage::ConfigSecret, &secret_kind, &key, e))?;

        match existing {
            Some(current) => {
                let data = secret_data(&cfg.spec.entries);
                if current.data.as_ref() == Some(&data) {
                    return Ok(WriteOutcome::Unchanged);
                }
                // Same name means same hash, so only an outside edit gets us here.
                let mut desired = current;
                desired.data = Some(data);
                desired.string_data = None;
                self.store
                    .replace(namespace, secret_name, &desired)
                    .await
                    .map_err(|e| Error::store(Stage::ConfigSecret, &secret_kind, &key, e))?;
                info!("Update Secret: {}", key);
                Ok(WriteOutcome::Updated)
            }
            None => {
                let mut secret = make_config_secret(config_name, namespace, secret_name, &cfg.spec.entries);
                bind_owner(cfg, &mut secret)?;
                self.store
                    .create(namespace, &secret)
                    .await
                    .map_err(|e| Error::store(Stage::ConfigSecret, &secret_kind, &key, e))?;
                info!("Create Secret: {}", key);
                Ok(WriteOutcome::Created)
            }
        }
    }

    async fn bind_config_ref(
        &self,
        namespace: &str,
        app_name: &str,
        secret_name: &str,
    ) -> Result<Option<WriteOutcome>, Error> {
        let key = object_key(namespace, app_name);
        let app_kind = kind_of::<Application>();
        let app = self
            .store
            .get::<Application>(namespace, app_name)
            .await
            .map_err(|e| Error::store(Stage::ConfigBinding, &app_kind, &key, e))?;

        let mut app = match app {
            Some(app) => app,
            None => {
                info!("No Application {} to bind config to yet", key);
                return Ok(None);
            }
        };
        if app.spec.config_ref == secret_name {
            return Ok(Some(WriteOutcome::Unchanged));
        }
        app.spec.config_ref = secret_name.to_string();
        self.store
            .replace(namespace, app_name, &app)
            .await
            .map_err(|e| Error::store(Stage::ConfigBinding, &app_kind, &key, e))?;
        info!("Bind Application {} to config {}", key, secret_name);
        Ok(Some(WriteOutcome::Updated))
    }
}
