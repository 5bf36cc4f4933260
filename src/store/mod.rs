//! Access to the cluster's object store.
//!
//! Every component takes an `Arc<S: ObjectStore>` at construction instead of building its own
//! client, so the whole convergence core runs unchanged against the API server ([`KubeStore`])
//! or an in-memory double in tests.

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use core::fmt::Debug;
use kube::{
    api::{Api, ListParams, PostParams},
    Client, Resource,
};
use kube_core::{ErrorResponse, NamespaceResourceScope};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("update conflict: {0}")]
    Conflict(String),
    #[error("failed to decode object: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("API request failed: {0}")]
    Api(#[source] kube::Error),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube_client::Error::Api(ErrorResponse { ref reason, .. }) if reason == "AlreadyExists" => {
                StoreError::AlreadyExists
            }
            kube_client::Error::Api(ErrorResponse { ref reason, .. }) if reason == "NotFound" => {
                StoreError::NotFound
            }
            kube_client::Error::Api(ErrorResponse {
                ref reason,
                ref message,
                code,
                ..
            }) if reason == "Conflict" || code == 409 => StoreError::Conflict(message.clone()),
            kube_client::Error::SerdeError(e) => StoreError::Decode(e),
            other => StoreError::Api(other),
        }
    }
}

/// Namespaced object kinds the controller reads and writes.
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

pub fn kind_of<K: StoredObject>() -> String {
    K::kind(&()).into_owned()
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Not-found is `Ok(None)`; callers decide whether absence is an error.
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn create<K: StoredObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;

    /// Full update. Fails with `Conflict` if `obj` carries a stale resource version.
    async fn replace<K: StoredObject>(&self, namespace: &str, name: &str, obj: &K) -> Result<K, StoreError>;

    async fn list<K: StoredObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create<K: StoredObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace<K: StoredObject>(&self, namespace: &str, name: &str, obj: &K) -> Result<K, StoreError> {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), obj).await?)
    }

    async fn list<K: StoredObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError> {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        Ok(api.list(&lp).await?.items)
    }
}
