//! Interface to the cloud provider.
//!
//! The provider is an external collaborator: given a resource kind, a name
//! and a resolved spec, it makes the resource exist and reports its output
//! attributes. Implementations are expected to honor the
//! [`ResourceOptions`] of a request when a resource already exists with a
//! different spec.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::output::Resolved;
use crate::resources::ResourceKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOptions {
    /// Dotted spec paths. A change under any of them forces the resource to
    /// be replaced; all other changes are applied in place.
    pub replace_on_changes: Vec<String>,

    /// Delete the existing resource before creating its replacement, instead
    /// of the other way around.
    pub delete_before_replace: bool,
}

#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub kind: ResourceKind,
    pub name: String,
    /// Unknown when some input is not known yet (preview only).
    pub spec: Resolved<serde_json::Value>,
    pub options: ResourceOptions,
}

#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub kind: ResourceKind,
    pub name: String,
    pub query: serde_json::Value,
}

/// Output attributes of a created, updated or looked-up resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutputs {
    pub kind: ResourceKind,
    pub name: String,
    pub attributes: BTreeMap<String, Resolved<serde_json::Value>>,
}

impl ResourceOutputs {
    pub fn attribute(&self, name: &str) -> Option<&Resolved<serde_json::Value>> {
        self.attributes.get(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{kind} `{name}` was rejected: {message}")]
    Rejected {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("{kind} `{name}` does not exist")]
    NotFound { kind: ResourceKind, name: String },

    #[error("provider state error: {0}")]
    State(String),
}

#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Create the resource, or bring an existing one in line with
    /// `request.spec`, and report its output attributes.
    async fn register(&self, request: ResourceRequest) -> Result<ResourceOutputs, ProviderError>;

    /// Read an existing resource which is not managed by this run.
    async fn lookup(&self, request: LookupRequest) -> Result<ResourceOutputs, ProviderError>;
}
