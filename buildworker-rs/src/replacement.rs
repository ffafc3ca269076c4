//! Replacement policy for immutable resources.
//!
//! When a resource already exists, its previous and desired specs are
//! compared field by field. Changes under one of the resource's
//! [`replace_on_changes`](ResourceOptions::replace_on_changes) paths force a
//! replacement, everything else is updated in place.
//!
//! The compute instance is registered with its bootstrap document as the only
//! trigger, and with `delete_before_replace` set: the old instance has to
//! release its network interface before a new one can bind to it. This
//! accepts a short outage during every replacement.

use serde_json::Value;
use thiserror::Error;

use crate::provider::ResourceOptions;

/// Outcome of comparing a resource's previous spec with its desired spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    Unchanged,
    UpdateInPlace {
        changed: Vec<String>,
    },
    Replace {
        /// Changed paths that are replacement triggers.
        triggers: Vec<String>,
        changed: Vec<String>,
    },
}

impl Diff {
    pub fn is_replace(&self) -> bool {
        matches!(self, Diff::Replace { .. })
    }
}

/// Dotted paths of all leaves that differ between `old` and `new`.
///
/// Objects are descended into. Any other value, arrays included, is compared
/// as a whole. Paths are reported in key order.
pub fn changed_paths(old: &Value, new: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_changes("", old, new, &mut out);
    out
}

fn collect_changes(prefix: &str, old: &Value, new: &Value, out: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
            keys.sort();
            keys.dedup();

            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };

                match (old.get(key), new.get(key)) {
                    (Some(o), Some(n)) => collect_changes(&path, o, n, out),
                    _ => out.push(path),
                }
            }
        }
        (old, new) if old != new => out.push(prefix.to_string()),
        _ => (),
    }
}

/// Whether a change at `path` touches the field at `trigger`.
fn touches(path: &str, trigger: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner
            .strip_prefix(outer)
            .map_or(false, |rest| rest.is_empty() || rest.starts_with('.'))
    };

    path.is_empty() || nested(trigger, path) || nested(path, trigger)
}

pub fn diff(options: &ResourceOptions, old: &Value, new: &Value) -> Diff {
    let changed = changed_paths(old, new);
    if changed.is_empty() {
        return Diff::Unchanged;
    }

    let triggers: Vec<String> = changed
        .iter()
        .filter(|path| {
            options
                .replace_on_changes
                .iter()
                .any(|trigger| touches(path, trigger))
        })
        .cloned()
        .collect();

    if triggers.is_empty() {
        Diff::UpdateInPlace { changed }
    } else {
        Diff::Replace { triggers, changed }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Create,
    Update,
    Delete,
}

/// Provider operations realizing `diff`, in execution order.
pub fn replacement_steps(options: &ResourceOptions, diff: &Diff) -> Vec<Step> {
    match diff {
        Diff::Unchanged => vec![],
        Diff::UpdateInPlace { .. } => vec![Step::Update],
        Diff::Replace { .. } if options.delete_before_replace => vec![Step::Delete, Step::Create],
        Diff::Replace { .. } => vec![Step::Create, Step::Delete],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Absent,
    Creating,
    Running,
    PendingReplace,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    CreateRequested,
    Created,
    ContentChanged,
    DeleteRequested,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition: {event:?} in state {state:?}")]
pub struct TransitionError {
    pub state: InstanceState,
    pub event: LifecycleEvent,
}

/// Lifecycle of a compute instance across replacements.
///
/// ```text
/// Absent -> Creating -> Running -> PendingReplace -> Deleting -> Creating -> Running
///                          \-----------------------> Deleting -> Absent
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLifecycle {
    state: InstanceState,
    replacing: bool,
}

impl Default for InstanceLifecycle {
    fn default() -> Self {
        InstanceLifecycle::new()
    }
}

impl InstanceLifecycle {
    pub fn new() -> Self {
        InstanceLifecycle {
            state: InstanceState::Absent,
            replacing: false,
        }
    }

    /// An instance that already exists.
    pub fn running() -> Self {
        InstanceLifecycle {
            state: InstanceState::Running,
            replacing: false,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn transition(&mut self, event: LifecycleEvent) -> Result<InstanceState, TransitionError> {
        use InstanceState as S;
        use LifecycleEvent as E;

        let next = match (self.state, event) {
            (S::Absent, E::CreateRequested) => S::Creating,
            (S::Creating, E::Created) => {
                self.replacing = false;
                S::Running
            }
            (S::Running, E::ContentChanged) => {
                self.replacing = true;
                S::PendingReplace
            }
            (S::Running, E::DeleteRequested) | (S::PendingReplace, E::DeleteRequested) => {
                S::Deleting
            }
            (S::Deleting, E::Deleted) if self.replacing => S::Creating,
            (S::Deleting, E::Deleted) => S::Absent,
            (state, event) => return Err(TransitionError { state, event }),
        };

        self.state = next;
        Ok(next)
    }

    /// Feed the outcome of a spec comparison into the lifecycle. Only a
    /// replacement moves a running instance.
    pub fn observe(&mut self, diff: &Diff) -> Result<InstanceState, TransitionError> {
        if diff.is_replace() {
            self.transition(LifecycleEvent::ContentChanged)
        } else {
            Ok(self.state)
        }
    }
}
