//! Keeps the revision counter bump from feeding back into the controller.
//!
//! The tracker's annotation write is itself an update event on the Application. [`admit`]
//! recognises an event whose only difference is that annotation; [`EventGate`] remembers what
//! was last seen per object so the predicate has something to diff against.

use crate::application_types::Application;
use crate::common::REVISION_NUMBER_ANNOTATION;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

type Annotations = BTreeMap<String, String>;

/// Keys added, removed, or changed between `old` and `new`.
pub fn annotation_diff(old: &Annotations, new: &Annotations) -> BTreeSet<String> {
    let mut touched = BTreeSet::new();
    for (key, value) in old {
        if new.get(key) != Some(value) {
            touched.insert(key.clone());
        }
    }
    for key in new.keys() {
        if !old.contains_key(key) {
            touched.insert(key.clone());
        }
    }
    touched
}

/// Whether an update from `old` to `new` annotations should start a convergence pass.
/// Only a diff consisting of exactly the revision number key is suppressed.
pub fn admit(old: Option<&Annotations>, new: Option<&Annotations>) -> bool {
    let (old, new) = match (old, new) {
        (Some(old), Some(new)) => (old, new),
        _ => return true,
    };
    let touched = annotation_diff(old, new);
    !(touched.len() == 1 && touched.contains(REVISION_NUMBER_ANNOTATION))
}

#[derive(Debug, Clone, PartialEq)]
struct Seen {
    generation: Option<i64>,
    annotations: Option<Annotations>,
}

type GateKey = (Option<String>, String);

fn gate_key(app: &Application) -> GateKey {
    (
        app.metadata.namespace.clone(),
        app.metadata.name.clone().unwrap_or_default(),
    )
}

/// Last observed generation and annotations per Application, keyed by namespace and name.
#[derive(Default)]
pub struct EventGate {
    seen: Mutex<HashMap<GateKey, Seen>>,
}

impl EventGate {
    pub fn new() -> Self {
        EventGate::default()
    }

    /// Records `app` as the latest observation and reports whether it warrants a pass.
    pub fn admit_event(&self, app: &Application) -> bool {
        let current = Seen {
            generation: app.metadata.generation,
            annotations: app.metadata.annotations.clone(),
        };
        let key = gate_key(app);
        let mut seen = self.seen.lock();
        let decision = match seen.get(&key) {
            None => true,
            Some(last) if last.generation != current.generation => true,
            Some(last) => admit(last.annotations.as_ref(), current.annotations.as_ref()),
        };
        seen.insert(key, current);
        decision
    }

    pub fn forget(&self, app: &Application) {
        self.seen.lock().remove(&gate_key(app));
    }

    /// Drops the entry for an object known only by reference, e.g. one the controller could no
    /// longer find in its cache.
    pub fn forget_named(&self, namespace: Option<&str>, name: &str) {
        self.seen
            .lock()
            .remove(&(namespace.map(str::to_string), name.to_string()));
    }

    pub fn tracked(&self) -> usize {
        self.seen.lock().len()
    }
}
