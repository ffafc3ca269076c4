//! In-process resource provider.
//!
//! Keeps a table of "provisioned" resources and fabricates the attributes a
//! cloud provider would assign: identifiers, public addresses and
//! administrative key pairs. The table can be persisted to a JSON state file,
//! so that subsequent runs see previously created resources and apply the
//! replacement policy to them.
//!
//! In [`Mode::Preview`] nothing is mutated, and attributes of resources which
//! do not exist yet are reported as unknown.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use buildworker_rs::output::Resolved;
use buildworker_rs::provider::{
    LookupRequest, Provider, ProviderError, ResourceOptions, ResourceOutputs, ResourceRequest,
};
use buildworker_rs::replacement::{self, Diff, InstanceLifecycle, LifecycleEvent, Step};
use buildworker_rs::resources::{attr, ResourceKind};

/// Documentation range (RFC 5737) used for fabricated public addresses.
const ADDRESS_PREFIX: &str = "198.51.100";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode state file {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Preview,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub name: String,
    pub spec: Value,
    pub options: ResourceOptions,
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Resources in creation order.
    pub resources: Vec<ResourceRecord>,
    pub addresses_allocated: u32,
}

impl State {
    fn position(&self, kind: ResourceKind, name: &str) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.kind == kind && r.name == name)
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&ResourceRecord> {
        self.position(kind, name).map(|i| &self.resources[i])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Replace,
    Unchanged,
    Delete,
    Read,
    /// Preview of an existing resource whose new spec is not known yet.
    Deferred,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Unchanged => "unchanged",
            Action::Delete => "delete",
            Action::Read => "read",
            Action::Deferred => "deferred",
        };
        f.pad(s)
    }
}

/// One action taken (or, in preview, planned) by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: ResourceKind,
    pub name: String,
    pub action: Action,
    /// Changed spec paths, for updates and replacements.
    pub changed: Vec<String>,
    /// Provider operations of a replacement, in execution order.
    pub steps: Vec<Step>,
}

impl JournalEntry {
    fn new(kind: ResourceKind, name: &str, action: Action) -> Self {
        JournalEntry {
            kind,
            name: name.to_string(),
            action,
            changed: Vec::new(),
            steps: Vec::new(),
        }
    }
}

pub struct LocalProvider {
    mode: Mode,
    state_file: Option<PathBuf>,
    state: Mutex<State>,
    journal: Mutex<Vec<JournalEntry>>,
    zones: BTreeSet<(String, String)>,
}

impl LocalProvider {
    /// A provider with empty, in-memory state.
    pub fn new(mode: Mode) -> Self {
        LocalProvider {
            mode,
            state_file: None,
            state: Mutex::new(State::default()),
            journal: Mutex::new(Vec::new()),
            zones: BTreeSet::new(),
        }
    }

    /// A provider backed by the state file at `path`. A missing file is
    /// treated as empty state.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(mode: Mode, path: impl AsRef<std::path::Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StateError::Decode {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                event!(Level::DEBUG, "No state file yet, starting empty");
                State::default()
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };

        Ok(LocalProvider {
            state_file: Some(path),
            state: Mutex::new(state),
            ..LocalProvider::new(mode)
        })
    }

    /// Make a pre-existing DNS zone available to lookups.
    pub fn with_zone(mut self, resource_group_name: &str, zone_name: &str) -> Self {
        self.zones
            .insert((resource_group_name.to_string(), zone_name.to_string()));
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub async fn state(&self) -> State {
        self.state.lock().await.clone()
    }

    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().await.clone()
    }

    async fn persist(&self, state: &State) -> Result<(), StateError> {
        let Some(path) = self.state_file.as_ref() else {
            return Ok(());
        };
        if self.mode == Mode::Preview {
            return Ok(());
        }

        let encoded = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(path, encoded)
            .await
            .map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;

        event!(Level::TRACE, path = %path.display(), resources = state.resources.len(), "Persisted state");
        Ok(())
    }

    /// Delete every recorded resource, in reverse creation order.
    pub async fn destroy(&self) -> Result<Vec<JournalEntry>, StateError> {
        self.delete_where(|_| true).await
    }

    /// Delete recorded resources that are not in `keep`, in reverse creation
    /// order. Used to drop resources a plan no longer declares.
    pub async fn prune(
        &self,
        keep: &BTreeSet<(ResourceKind, String)>,
    ) -> Result<Vec<JournalEntry>, StateError> {
        self.delete_where(|r| !keep.contains(&(r.kind, r.name.clone())))
            .await
    }

    #[instrument(skip_all)]
    async fn delete_where(
        &self,
        select: impl Fn(&ResourceRecord) -> bool,
    ) -> Result<Vec<JournalEntry>, StateError> {
        let mut state = self.state.lock().await;

        let entries: Vec<JournalEntry> = state
            .resources
            .iter()
            .rev()
            .filter(|r| select(r))
            .map(|r| JournalEntry::new(r.kind, &r.name, Action::Delete))
            .collect();

        for entry in &entries {
            event!(Level::INFO, kind = %entry.kind, name = %entry.name, "Deleting resource");
        }

        if self.mode == Mode::Apply {
            state.resources.retain(|r| !select(r));
            self.persist(&state).await?;
        }

        self.journal.lock().await.extend(entries.iter().cloned());
        Ok(entries)
    }
}

fn rejected(request: &ResourceRequest, message: impl fmt::Display) -> ProviderError {
    ProviderError::Rejected {
        kind: request.kind,
        name: request.name.clone(),
        message: message.to_string(),
    }
}

/// Attribute names a provider assigns on creation, besides id and name.
fn assigned_attributes(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::PublicAddress => &[attr::IP_ADDRESS],
        ResourceKind::KeyPair => &[attr::PUBLIC_KEY_OPENSSH, attr::PRIVATE_KEY_OPENSSH],
        ResourceKind::DnsRecord => &[attr::FQDN],
        _ => &[],
    }
}

/// Attributes of a resource that does not exist yet.
fn unknown_attributes(request: &ResourceRequest) -> BTreeMap<String, Resolved<Value>> {
    let mut attributes = BTreeMap::from([
        (attr::ID.to_string(), Resolved::Unknown),
        (attr::NAME.to_string(), Resolved::Known(json!(request.name))),
    ]);
    for name in assigned_attributes(request.kind) {
        attributes.insert(name.to_string(), Resolved::Unknown);
    }
    attributes
}

fn known_attributes(attributes: &BTreeMap<String, Value>) -> BTreeMap<String, Resolved<Value>> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), Resolved::Known(v.clone())))
        .collect()
}

fn generate_key_pair(request: &ResourceRequest) -> Result<(String, String), ProviderError> {
    let private = ssh_key::PrivateKey::random(&mut rand_core::OsRng, ssh_key::Algorithm::Ed25519)
        .map_err(|e| rejected(request, format!("key generation failed: {e}")))?;
    let public = private
        .public_key()
        .to_openssh()
        .map_err(|e| rejected(request, format!("public key encoding failed: {e}")))?;
    let private = private
        .to_openssh(ssh_key::LineEnding::LF)
        .map_err(|e| rejected(request, format!("private key encoding failed: {e}")))?;

    Ok((public, private.to_string()))
}

/// Fabricate the attributes of a newly created resource.
fn fabricate(
    state: &mut State,
    request: &ResourceRequest,
    spec: &Value,
) -> Result<BTreeMap<String, Value>, ProviderError> {
    let mut attributes = BTreeMap::from([
        (
            attr::ID.to_string(),
            json!(format!("/local/{}/{}/{}", request.kind, request.name, Uuid::new_v4())),
        ),
        (attr::NAME.to_string(), json!(request.name)),
    ]);

    match request.kind {
        ResourceKind::PublicAddress => {
            let host = state.addresses_allocated % 254 + 1;
            state.addresses_allocated += 1;
            attributes.insert(
                attr::IP_ADDRESS.to_string(),
                json!(format!("{ADDRESS_PREFIX}.{host}")),
            );
        }
        ResourceKind::KeyPair => {
            let (public, private) = generate_key_pair(request)?;
            attributes.insert(attr::PUBLIC_KEY_OPENSSH.to_string(), json!(public));
            attributes.insert(attr::PRIVATE_KEY_OPENSSH.to_string(), json!(private));
        }
        ResourceKind::DnsRecord => {
            let field = |name: &str| spec.get(name).and_then(Value::as_str).unwrap_or_default();
            attributes.insert(
                attr::FQDN.to_string(),
                json!(format!(
                    "{}.{}",
                    field("relative_record_set_name"),
                    field("zone_name")
                )),
            );
        }
        _ => (),
    }

    Ok(attributes)
}

impl LocalProvider {
    fn preview(
        &self,
        state: &State,
        request: &ResourceRequest,
    ) -> (JournalEntry, BTreeMap<String, Resolved<Value>>) {
        let record = match state.get(request.kind, &request.name) {
            Some(record) => record,
            None => {
                return (
                    JournalEntry::new(request.kind, &request.name, Action::Create),
                    unknown_attributes(request),
                )
            }
        };

        let spec = match &request.spec {
            Resolved::Known(spec) => spec,
            Resolved::Unknown => {
                // A replaceable resource may get new attributes:
                let attributes = if request.options.replace_on_changes.is_empty() {
                    known_attributes(&record.attributes)
                } else {
                    unknown_attributes(request)
                };
                return (
                    JournalEntry::new(request.kind, &request.name, Action::Deferred),
                    attributes,
                );
            }
        };

        let diff = replacement::diff(&request.options, &record.spec, spec);
        let mut entry = JournalEntry::new(request.kind, &request.name, Action::Unchanged);
        let attributes = match &diff {
            Diff::Unchanged => known_attributes(&record.attributes),
            Diff::UpdateInPlace { changed } => {
                entry.action = Action::Update;
                entry.changed = changed.clone();
                known_attributes(&record.attributes)
            }
            Diff::Replace { triggers, .. } => {
                entry.action = Action::Replace;
                entry.changed = triggers.clone();
                entry.steps = replacement::replacement_steps(&request.options, &diff);
                unknown_attributes(request)
            }
        };

        (entry, attributes)
    }

    fn apply(
        &self,
        state: &mut State,
        request: &ResourceRequest,
    ) -> Result<(JournalEntry, BTreeMap<String, Value>), ProviderError> {
        let spec = match &request.spec {
            Resolved::Known(spec) => spec,
            Resolved::Unknown => {
                return Err(rejected(request, "spec depends on values that are not known"))
            }
        };
        let now = Utc::now();

        let index = match state.position(request.kind, &request.name) {
            Some(index) => index,
            None => {
                let attributes = fabricate(state, request, spec)?;
                state.resources.push(ResourceRecord {
                    kind: request.kind,
                    name: request.name.clone(),
                    spec: spec.clone(),
                    options: request.options.clone(),
                    attributes: attributes.clone(),
                    created_at: now,
                    updated_at: now,
                });
                return Ok((
                    JournalEntry::new(request.kind, &request.name, Action::Create),
                    attributes,
                ));
            }
        };

        let diff = replacement::diff(&request.options, &state.resources[index].spec, spec);
        let mut entry = JournalEntry::new(request.kind, &request.name, Action::Unchanged);

        match &diff {
            Diff::Unchanged => (),
            Diff::UpdateInPlace { changed } => {
                let record = &mut state.resources[index];
                record.spec = spec.clone();
                record.options = request.options.clone();
                record.updated_at = now;

                entry.action = Action::Update;
                entry.changed = changed.clone();
            }
            Diff::Replace { triggers, .. } => {
                let steps = replacement::replacement_steps(&request.options, &diff);
                let attributes = self.replace(state, request, &diff, &steps, spec)?;
                state.resources[index] = ResourceRecord {
                    kind: request.kind,
                    name: request.name.clone(),
                    spec: spec.clone(),
                    options: request.options.clone(),
                    attributes,
                    created_at: now,
                    updated_at: now,
                };

                entry.action = Action::Replace;
                entry.changed = triggers.clone();
                entry.steps = steps;
            }
        }

        Ok((entry, state.resources[index].attributes.clone()))
    }

    /// Run the steps of a replacement and return the new resource's
    /// attributes.
    fn replace(
        &self,
        state: &mut State,
        request: &ResourceRequest,
        diff: &Diff,
        steps: &[Step],
        spec: &Value,
    ) -> Result<BTreeMap<String, Value>, ProviderError> {
        let delete_first = request.options.delete_before_replace;
        let mut lifecycle = InstanceLifecycle::running();
        let lifecycle_error = |e: replacement::TransitionError| {
            ProviderError::State(format!("{} `{}`: {e}", request.kind, request.name))
        };

        if delete_first {
            lifecycle.observe(diff).map_err(lifecycle_error)?;
        }

        let mut attributes = None;
        for step in steps {
            match step {
                Step::Delete => {
                    if delete_first {
                        lifecycle
                            .transition(LifecycleEvent::DeleteRequested)
                            .map_err(lifecycle_error)?;
                        lifecycle
                            .transition(LifecycleEvent::Deleted)
                            .map_err(lifecycle_error)?;
                    }
                    event!(Level::INFO, kind = %request.kind, name = %request.name, "Deleted replaced resource");
                }
                Step::Create => {
                    attributes = Some(fabricate(state, request, spec)?);
                    if delete_first {
                        lifecycle
                            .transition(LifecycleEvent::Created)
                            .map_err(lifecycle_error)?;
                    }
                    event!(Level::INFO, kind = %request.kind, name = %request.name, "Created replacement resource");
                }
                Step::Update => (),
            }
        }

        attributes.ok_or_else(|| rejected(request, "replacement did not create a resource"))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    #[instrument(skip(self, request), fields(kind = %request.kind, name = %request.name))]
    async fn register(&self, request: ResourceRequest) -> Result<ResourceOutputs, ProviderError> {
        let mut state = self.state.lock().await;

        let (entry, attributes) = match self.mode {
            Mode::Preview => self.preview(&state, &request),
            Mode::Apply => {
                let (entry, attributes) = self.apply(&mut state, &request)?;
                if entry.action != Action::Unchanged {
                    self.persist(&state)
                        .await
                        .map_err(|e| ProviderError::State(e.to_string()))?;
                }
                (entry, known_attributes(&attributes))
            }
        };

        event!(
            Level::INFO,
            action = %entry.action,
            changed = ?entry.changed,
            "Registered resource"
        );
        self.journal.lock().await.push(entry);

        Ok(ResourceOutputs {
            kind: request.kind,
            name: request.name,
            attributes,
        })
    }

    #[instrument(skip(self, request), fields(kind = %request.kind, name = %request.name))]
    async fn lookup(&self, request: LookupRequest) -> Result<ResourceOutputs, ProviderError> {
        let field = |name: &str| {
            request
                .query
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let key = (field("resource_group_name"), field("zone_name"));

        if request.kind != ResourceKind::DnsZone || !self.zones.contains(&key) {
            return Err(ProviderError::NotFound {
                kind: request.kind,
                name: request.name,
            });
        }

        let (resource_group_name, zone_name) = key;
        self.journal
            .lock()
            .await
            .push(JournalEntry::new(request.kind, &request.name, Action::Read));

        Ok(ResourceOutputs {
            kind: request.kind,
            name: request.name,
            attributes: BTreeMap::from([
                (
                    attr::ID.to_string(),
                    Resolved::Known(json!(format!(
                        "/local/dns_zone/{resource_group_name}/{zone_name}"
                    ))),
                ),
                (attr::NAME.to_string(), Resolved::Known(json!(zone_name))),
            ]),
        })
    }
}
