//! Registration of declared resources against a [`Provider`].
//!
//! The planner declares resources with specs that may still depend on
//! deferred values. Each registration is driven by its own task: it waits for
//! the spec to settle, hands it to the provider and publishes the reported
//! attributes as an [`Output`]. Ordering between resources follows from the
//! data dependencies between their specs alone.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{event, instrument, Level};

use crate::output::{DependencyError, Output, Resolved};
use crate::provider::{LookupRequest, Provider, ResourceOptions, ResourceOutputs, ResourceRequest};
use crate::resources::{attr, ResourceKind};

/// A resource registered on a [`Stack`].
#[derive(Debug, Clone)]
pub struct Resource {
    kind: ResourceKind,
    name: String,
    outputs: Output<ResourceOutputs>,
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Logical name the resource was declared with.
    pub fn logical_name(&self) -> &str {
        &self.name
    }

    pub fn outputs(&self) -> &Output<ResourceOutputs> {
        &self.outputs
    }

    /// A single output attribute, decoded as `T`.
    pub fn output<T>(&self, attribute: &'static str) -> Output<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let resource = format!("{} `{}`", self.kind, self.name);
        self.outputs.and_then(move |outputs| match outputs.attribute(attribute) {
            None => Output::failed(DependencyError::MissingAttribute {
                resource,
                attribute: attribute.to_string(),
            }),
            Some(Resolved::Unknown) => Output::unknown(),
            Some(Resolved::Known(value)) => match serde_json::from_value(value.clone()) {
                Ok(value) => Output::known(value),
                Err(e) => Output::failed(DependencyError::MalformedAttribute {
                    resource,
                    attribute: attribute.to_string(),
                    message: e.to_string(),
                }),
            },
        })
    }

    /// Provider-assigned identifier.
    pub fn id(&self) -> Output<String> {
        self.output(attr::ID)
    }

    /// Name of the resource as reported by the provider.
    pub fn name(&self) -> Output<String> {
        self.output(attr::NAME)
    }
}

/// The set of resources of one provisioning run.
pub struct Stack {
    provider: Arc<dyn Provider>,
    resources: Vec<Resource>,
}

impl Stack {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Stack {
            provider,
            resources: Vec::new(),
        }
    }

    /// Declared resources, in registration order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Declare a managed resource.
    ///
    /// Must be called from within a tokio runtime. The provider is invoked as
    /// soon as `spec` settles, whether or not anyone reads the returned
    /// resource's outputs.
    pub fn register<S>(
        &mut self,
        kind: ResourceKind,
        name: &str,
        spec: Output<S>,
        options: ResourceOptions,
    ) -> Resource
    where
        S: Serialize + Clone + Send + Sync + 'static,
    {
        let provider = self.provider.clone();
        let resource_name = name.to_string();

        let task = tokio::spawn(async move {
            let spec = match spec.resolve().await? {
                Resolved::Known(spec) => Resolved::Known(serde_json::to_value(&spec).map_err(
                    |e| DependencyError::Derivation {
                        what: "resource spec",
                        message: e.to_string(),
                    },
                )?),
                Resolved::Unknown => Resolved::Unknown,
            };

            let request = ResourceRequest {
                kind,
                name: resource_name.clone(),
                spec,
                options,
            };
            provider
                .register(request)
                .await
                .map_err(|e| DependencyError::ResourceFailed {
                    resource: resource_name,
                    message: e.to_string(),
                })
        });

        self.track(kind, name, task)
    }

    /// Read a resource that exists independently of this stack.
    pub fn lookup<Q: Serialize>(&mut self, kind: ResourceKind, name: &str, query: &Q) -> Resource {
        let query = match serde_json::to_value(query) {
            Ok(query) => query,
            Err(e) => {
                let resource = Resource {
                    kind,
                    name: name.to_string(),
                    outputs: Output::failed(DependencyError::Derivation {
                        what: "lookup query",
                        message: e.to_string(),
                    }),
                };
                self.resources.push(resource.clone());
                return resource;
            }
        };

        let provider = self.provider.clone();
        let resource_name = name.to_string();

        let task = tokio::spawn(async move {
            let request = LookupRequest {
                kind,
                name: resource_name.clone(),
                query,
            };
            provider
                .lookup(request)
                .await
                .map_err(|e| DependencyError::ResourceFailed {
                    resource: resource_name,
                    message: e.to_string(),
                })
        });

        self.track(kind, name, task)
    }

    fn track(
        &mut self,
        kind: ResourceKind,
        name: &str,
        task: tokio::task::JoinHandle<Result<ResourceOutputs, DependencyError>>,
    ) -> Resource {
        event!(Level::DEBUG, %kind, name, "Registered resource");

        let resource_name = name.to_string();
        let outputs = Output::from_future(async move {
            match task.await {
                Ok(Ok(outputs)) => Ok(Resolved::Known(outputs)),
                Ok(Err(e)) => Err(e),
                Err(join_error) => Err(DependencyError::TaskLost {
                    resource: resource_name,
                    message: join_error.to_string(),
                }),
            }
        });

        let resource = Resource {
            kind,
            name: name.to_string(),
            outputs,
        };
        self.resources.push(resource.clone());
        resource
    }

    /// Wait for every registration to finish.
    ///
    /// All resources are awaited, even after a failure. The first failure in
    /// registration order is returned.
    #[instrument(skip(self), fields(resources = self.resources.len()))]
    pub async fn settle(&self) -> Result<(), DependencyError> {
        let mut first_error = None;

        for resource in &self.resources {
            if let Err(e) = resource.outputs.resolve().await {
                event!(
                    Level::WARN,
                    kind = %resource.kind,
                    name = %resource.name,
                    "Resource failed: {e}"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                event!(Level::INFO, "All resources settled");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::provider::ProviderError;

    /// Echoes the spec back as the `spec` attribute.
    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn register(&self, request: ResourceRequest) -> Result<ResourceOutputs, ProviderError> {
            if request.name == "broken" {
                return Err(ProviderError::Rejected {
                    kind: request.kind,
                    name: request.name,
                    message: "quota exceeded".into(),
                });
            }

            let mut attributes = BTreeMap::new();
            attributes.insert(attr::ID.to_string(), Resolved::Known(json!(format!("/id/{}", request.name))));
            attributes.insert(attr::NAME.to_string(), Resolved::Known(json!(request.name)));
            attributes.insert("spec".to_string(), request.spec);
            attributes.insert("pending".to_string(), Resolved::Unknown);
            Ok(ResourceOutputs {
                kind: request.kind,
                name: request.name,
                attributes,
            })
        }

        async fn lookup(&self, request: LookupRequest) -> Result<ResourceOutputs, ProviderError> {
            Err(ProviderError::NotFound {
                kind: request.kind,
                name: request.name,
            })
        }
    }

    fn stack() -> Stack {
        Stack::new(Arc::new(EchoProvider))
    }

    #[tokio::test]
    async fn specs_flow_into_outputs() {
        let mut stack = stack();
        let group = stack.register(
            ResourceKind::ResourceGroup,
            "rg",
            Output::known(json!({"location": "westeurope"})),
            ResourceOptions::default(),
        );
        let dependent = stack.register(
            ResourceKind::PublicAddress,
            "pip",
            group.name().map(|rg| json!({"resource_group_name": rg})),
            ResourceOptions::default(),
        );

        let spec: Value = dependent.output("spec").resolve().await.unwrap().known().unwrap();
        assert_eq!(spec, json!({"resource_group_name": "rg"}));
        assert_eq!(
            group.id().resolve().await.unwrap(),
            Resolved::Known("/id/rg".to_string())
        );
        stack.settle().await.unwrap();
        assert_eq!(stack.resources().len(), 2);
    }

    #[tokio::test]
    async fn attribute_errors() {
        let mut stack = stack();
        let group = stack.register(
            ResourceKind::ResourceGroup,
            "rg",
            Output::known(json!({})),
            ResourceOptions::default(),
        );

        assert!(matches!(
            group.output::<String>("nope").resolve().await,
            Err(DependencyError::MissingAttribute { .. })
        ));
        assert!(matches!(
            group.output::<u32>(attr::NAME).resolve().await,
            Err(DependencyError::MalformedAttribute { .. })
        ));
        assert_eq!(
            group.output::<String>("pending").resolve().await.unwrap(),
            Resolved::Unknown
        );
    }

    #[tokio::test]
    async fn failures_propagate_to_dependents_and_settle() {
        let mut stack = stack();
        let broken = stack.register(
            ResourceKind::ResourceGroup,
            "broken",
            Output::known(json!({})),
            ResourceOptions::default(),
        );
        let dependent = stack.register(
            ResourceKind::VirtualNetwork,
            "vnet",
            broken.name().map(|rg| json!({"resource_group_name": rg})),
            ResourceOptions::default(),
        );

        assert!(matches!(
            dependent.id().resolve().await,
            Err(DependencyError::ResourceFailed { ref resource, .. }) if resource == "broken"
        ));
        assert!(stack.settle().await.is_err());
    }

    #[tokio::test]
    async fn lookup_failure_is_reported() {
        let mut stack = stack();
        let zone = stack.lookup(
            ResourceKind::DnsZone,
            "zone",
            &json!({"zone_name": "infra.example.com"}),
        );
        assert!(zone.name().resolve().await.is_err());
    }
}
