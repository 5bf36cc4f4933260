//! Revision history for Applications.
//!
//! Every pass ends with [`RevisionTracker::create_if_needed`]. It hashes the Application spec
//! and the spec of the ApplicationConfig with the same name, compares both hashes with the
//! latest recorded revision, and records a new immutable `ApplicationRevision` named
//! `{app}-v{N}` only when one of them moved. The latest `N` lives in the
//! [`REVISION_NUMBER_ANNOTATION`] on the Application.
//!
//! Creating the revision and bumping the annotation are two separate writes. If the bump fails
//! the next pass computes the same candidate name, finds the revision already there, and bumps
//! the counter then; nothing is rolled back.

pub mod hash;

use std::sync::Arc;
use tracing::*;

use crate::application_types::*;
use crate::common::*;
use crate::error::{Error, Stage};
use crate::store::{kind_of, ObjectStore, StoreError};
use kube::api::ObjectMeta;

pub use hash::canonical_hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionOutcome {
    /// A new revision was written and the counter now points at it.
    Created { number: u64, name: String },
    /// The candidate revision was already present from an earlier pass whose counter bump did
    /// not land; only the counter was moved.
    CounterHealed { number: u64, name: String },
    Unchanged { number: u64 },
}

pub struct RevisionTracker<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> RevisionTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        RevisionTracker { store }
    }

    pub async fn create_if_needed(&self, namespace: &str, app_name: &str) -> Result<RevisionOutcome, Error> {
        let key = object_key(namespace, app_name);

        let mut app = self
            .store
            .get::<Application>(namespace, app_name)
            .await
            .map_err(|e| Error::store(Stage::Revision, kind_of::<Application>(), &key, e))?
            .ok_or_else(|| {
                Error::store(Stage::Revision, kind_of::<Application>(), &key, StoreError::NotFound)
            })?;

        let cfg = self
            .store
            .get::<ApplicationConfig>(namespace, app_name)
            .await
            .map_err(|e| Error::store(Stage::Revision, kind_of::<ApplicationConfig>(), &key, e))?;
        if cfg.is_none() {
            info!("No ApplicationConfig for {}, revision carries an empty config", key);
        }

        let current = current_revision_number(&app, &key)?;
        let candidate = current
            .checked_add(1)
            .ok_or_else(|| Error::RevisionNumberExhausted {
                stage: Stage::Revision,
                key: key.clone(),
                value: current,
            })?;
        let candidate_name = revision_name(app_name, candidate);

        let app_hash = canonical_hash(&app.spec).map_err(|e| Error::Serialization {
            stage: Stage::Revision,
            kind: kind_of::<Application>(),
            key: key.clone(),
            source: e,
        })?;
        let cfg_spec = cfg.map(|c| c.spec);
        let cfg_hash = match &cfg_spec {
            Some(spec) => canonical_hash(spec).map_err(|e| Error::Serialization {
                stage: Stage::Revision,
                kind: kind_of::<ApplicationConfig>(),
                key: key.clone(),
                source: e,
            })?,
            None => String::new(),
        };

        let previous = if current > 0 {
            let prev_name = revision_name(app_name, current);
            let prev = self
                .store
                .get::<ApplicationRevision>(namespace, &prev_name)
                .await
                .map_err(|e| {
                    Error::store(
                        Stage::Revision,
                        kind_of::<ApplicationRevision>(),
                        object_key(namespace, &prev_name),
                        e,
                    )
                })?;
            if prev.is_none() {
                info!("Previous revision {} is gone, comparing against nothing", prev_name);
            }
            prev
        } else {
            None
        };

        let changed = match &previous {
            None => true,
            Some(prev) => prev.spec.app_hash != app_hash || prev.spec.cfg_hash != cfg_hash,
        };
        if !changed {
            return Ok(RevisionOutcome::Unchanged { number: current });
        }

        let revision = ApplicationRevision {
            metadata: ObjectMeta {
                name: Some(candidate_name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    [(REVISION_APPLICATION_LABEL.to_string(), app_name.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: ApplicationRevisionSpec {
                app: app.spec.clone(),
                cfg: cfg_spec.unwrap_or_default(),
                app_hash,
                cfg_hash,
            },
        };

        info!("Save new revision: {}", candidate_name);
        let healed = match self.store.create(namespace, &revision).await {
            Ok(_) => false,
            Err(StoreError::AlreadyExists) => {
                info!(
                    "Revision {} already exists, moving the counter to it",
                    candidate_name
                );
                true
            }
            Err(e) => {
                return Err(Error::store(
                    Stage::Revision,
                    kind_of::<ApplicationRevision>(),
                    object_key(namespace, &candidate_name),
                    e,
                ))
            }
        };

        app.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(REVISION_NUMBER_ANNOTATION.to_string(), candidate.to_string());
        self.store
            .replace(namespace, app_name, &app)
            .await
            .map_err(|e| Error::store(Stage::Revision, kind_of::<Application>(), &key, e))?;

        Ok(if healed {
            RevisionOutcome::CounterHealed {
                number: candidate,
                name: candidate_name,
            }
        } else {
            RevisionOutcome::Created {
                number: candidate,
                name: candidate_name,
            }
        })
    }
}

/// Reads the revision counter. Absent means no revision yet; anything unparsable is an error,
/// since treating it as zero would hand out a revision name that is already taken.
pub fn current_revision_number(app: &Application, key: &str) -> Result<u64, Error> {
    match app
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_NUMBER_ANNOTATION))
    {
        None => Ok(0),
        Some(value) => value
            .parse::<u64>()
            .map_err(|e| Error::MalformedRevisionNumber {
                stage: Stage::Revision,
                key: key.to_string(),
                value: value.clone(),
                source: e,
            }),
    }
}

/// All recorded revisions of an Application, oldest first.
pub async fn revision_history<S: ObjectStore>(
    store: &S,
    namespace: &str,
    app_name: &str,
) -> Result<Vec<(u64, ApplicationRevision)>, Error> {
    let selector = format!("{}={}", REVISION_APPLICATION_LABEL, app_name);
    let revisions = store
        .list::<ApplicationRevision>(namespace, &selector)
        .await
        .map_err(|e| {
            Error::store(
                Stage::Revision,
                kind_of::<ApplicationRevision>(),
                object_key(namespace, app_name),
                e,
            )
        })?;
    let mut numbered: Vec<(u64, ApplicationRevision)> = revisions
        .into_iter()
        .filter_map(|rev| {
            let number = revision_number(app_name, rev.metadata.name.as_deref()?)?;
            Some((number, rev))
        })
        .collect();
    numbered.sort_by_key(|(number, _)| *number);
    Ok(numbered)
}
