// In-memory ObjectStore used by the unit tests. It hands out uids and resource versions,
// bumps generation on spec changes, rejects duplicate creates and stale updates, and can be
// told to fail the next request of a given kind.

use super::{kind_of, ObjectStore, StoreError, StoredObject};
use async_trait::async_trait;
use kube_core::ErrorResponse;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Create,
    Replace,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Unavailable,
}

impl Fault {
    fn into_error(self) -> StoreError {
        match self {
            Fault::Conflict => StoreError::Conflict("injected conflict".to_string()),
            Fault::Unavailable => StoreError::Api(kube_client::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "injected outage".to_string(),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: Op,
    pub kind: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    next_uid: u64,
    writes: Vec<WriteRecord>,
    faults: Vec<(Op, String, Fault)>,
}

impl Inner {
    fn take_fault(&mut self, op: Op, kind: &str) -> Option<StoreError> {
        let pos = self
            .faults
            .iter()
            .position(|(o, k, _)| *o == op && k == kind)?;
        let (_, _, fault) = self.faults.remove(pos);
        Some(fault.into_error())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key_of(kind: &str, namespace: &str, name: &str) -> Key {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

fn encode<K: StoredObject>(obj: &K) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(StoreError::Decode)
}

fn decode<K: StoredObject>(value: &Value) -> Result<K, StoreError> {
    serde_json::from_value(value.clone()).map_err(StoreError::Decode)
}

// Everything except metadata and status, which is what the API server's generation tracks.
fn desired_part(value: &Value) -> Value {
    let mut v = value.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    v
}

fn labels_match(value: &Value, selector: &str) -> bool {
    let labels = &value["metadata"]["labels"];
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels[k].as_str() == Some(v),
            None => !labels[term].is_null(),
        })
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Make the next `op` on `K` fail with `fault`.
    pub fn fail_next<K: StoredObject>(&self, op: Op, fault: Fault) {
        self.inner.lock().faults.push((op, kind_of::<K>(), fault));
    }

    /// Insert an object directly, as an external actor would. Not counted as a write.
    pub fn seed<K: StoredObject>(&self, namespace: &str, obj: &K) -> K {
        let mut inner = self.inner.lock();
        let stored = Self::insert_new(&mut inner, namespace, obj).expect("seed object");
        decode(&stored).expect("decode seeded object")
    }

    pub fn fetch<K: StoredObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock();
        inner
            .objects
            .get(&key_of(&kind_of::<K>(), namespace, name))
            .map(|v| decode(v).expect("decode stored object"))
    }

    pub fn all<K: StoredObject>(&self, namespace: &str) -> Vec<K> {
        let kind = kind_of::<K>();
        let inner = self.inner.lock();
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| decode(v).expect("decode stored object"))
            .collect()
    }

    pub fn count<K: StoredObject>(&self, namespace: &str) -> usize {
        self.all::<K>(namespace).len()
    }

    pub fn total_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Remove an object, as an external retention policy or a user would.
    pub fn remove<K: StoredObject>(&self, namespace: &str, name: &str) -> bool {
        self.inner
            .lock()
            .objects
            .remove(&key_of(&kind_of::<K>(), namespace, name))
            .is_some()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    fn insert_new<K: StoredObject>(inner: &mut Inner, namespace: &str, obj: &K) -> Result<Value, StoreError> {
        let name = obj.meta().name.clone().expect("object without .metadata.name");
        let key = key_of(&kind_of::<K>(), namespace, &name);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        inner.next_uid += 1;
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(format!("uid-{}", inner.next_uid));
        meta.resource_version = Some("1".to_string());
        meta.generation = Some(1);
        let value = encode(&obj)?;
        inner.objects.insert(key, value.clone());
        Ok(value)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_fault(Op::Get, &kind) {
            return Err(err);
        }
        inner
            .objects
            .get(&key_of(&kind, namespace, name))
            .map(decode)
            .transpose()
    }

    async fn create<K: StoredObject>(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_fault(Op::Create, &kind) {
            return Err(err);
        }
        let stored = Self::insert_new(&mut inner, namespace, obj)?;
        inner.writes.push(WriteRecord {
            op: Op::Create,
            kind,
            name: obj.meta().name.clone().unwrap_or_default(),
        });
        decode(&stored)
    }

    async fn replace<K: StoredObject>(&self, namespace: &str, name: &str, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_fault(Op::Replace, &kind) {
            return Err(err);
        }
        let key = key_of(&kind, namespace, name);
        let current = inner.objects.get(&key).cloned().ok_or(StoreError::NotFound)?;
        let current_obj: K = decode(&current)?;
        let current_rv = current_obj.meta().resource_version.clone();
        if let Some(rv) = obj.meta().resource_version.as_ref() {
            if Some(rv) != current_rv.as_ref() {
                return Err(StoreError::Conflict(format!(
                    "{} {}/{} has resourceVersion {:?}, update carried {}",
                    kind, namespace, name, current_rv, rv
                )));
            }
        }

        let mut updated = obj.clone();
        let next_rv = current_rv
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let generation = current_obj.meta().generation.unwrap_or(1);
        let spec_changed = desired_part(&encode(obj)?) != desired_part(&current);
        let meta = updated.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.uid = current_obj.meta().uid.clone();
        meta.resource_version = Some(next_rv.to_string());
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });

        let value = encode(&updated)?;
        inner.objects.insert(key, value.clone());
        inner.writes.push(WriteRecord {
            op: Op::Replace,
            kind,
            name: name.to_string(),
        });
        decode(&value)
    }

    async fn list<K: StoredObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.inner.lock();
        if let Some(err) = inner.take_fault(Op::List, &kind) {
            return Err(err);
        }
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, label_selector))
            .map(|(_, v)| decode(v))
            .collect()
    }
}
