//! In-process simulated provider.
//!
//! Resources exist only as entries in a map. Every created resource gets a
//! physical id with a random suffix, and its outputs echo the resolved
//! properties plus `id`, `name`, `arn` and `urn`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::graph::Outputs;
use crate::planner::OperationKind;

use super::{Provider, ProviderRequest};

/// Simulated provider backed by memory.
#[derive(Debug, Default)]
pub struct LocalProvider {
    resources: Mutex<HashMap<String, Outputs>>,
    latency: Option<Duration>,
}

impl LocalProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds artificial latency to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of resources currently alive.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn outputs_for(request: &ProviderRequest, physical_id: &str) -> Outputs {
        let mut outputs = Outputs::new(physical_id);
        outputs.attributes.extend(
            request
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let resource_type = &request.id.resource_type;
        outputs
            .attributes
            .insert(String::from("id"), Value::String(physical_id.to_string()));
        outputs
            .attributes
            .entry(String::from("name"))
            .or_insert_with(|| Value::String(physical_id.to_string()));
        outputs.attributes.insert(
            String::from("arn"),
            Value::String(format!("arn:converge:{resource_type}:{physical_id}")),
        );
        outputs.attributes.insert(
            String::from("urn"),
            Value::String(format!("urn:converge::{resource_type}::{}", request.id.name)),
        );
        outputs
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn apply(&self, request: &ProviderRequest) -> Result<Outputs, ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);

        match request.operation {
            OperationKind::Create => {
                let suffix = Uuid::new_v4().simple().to_string();
                let physical_id = format!("{}-{}", request.id.name, &suffix[..7]);
                let outputs = Self::outputs_for(request, &physical_id);
                debug!("local: created {} as {physical_id}", request.id);
                resources.insert(physical_id, outputs.clone());
                Ok(outputs)
            }
            OperationKind::Update => {
                let physical_id = request.physical_id.clone().ok_or_else(|| {
                    ProviderError::rejected(400, format!("update of {} without a physical id", request.id))
                })?;
                let outputs = Self::outputs_for(request, &physical_id);
                debug!("local: updated {} ({physical_id})", request.id);
                resources.insert(physical_id, outputs.clone());
                Ok(outputs)
            }
            OperationKind::Delete => {
                let physical_id = request.physical_id.clone().unwrap_or_default();
                // Deleting something already gone is not an error.
                let outputs = resources
                    .remove(&physical_id)
                    .unwrap_or_else(|| Outputs::new(physical_id.clone()));
                debug!("local: deleted {} ({physical_id})", request.id);
                Ok(outputs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn props(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_echoes_properties() {
        let provider = LocalProvider::new();
        let id = ResourceId::new("todo-table", "aws:dynamodb:Table");
        let outputs = provider
            .apply(&ProviderRequest::create(id, props(json!({"hashKey": "id"}))))
            .await
            .unwrap();

        assert!(outputs.physical_id.starts_with("todo-table-"));
        assert_eq!(outputs.get("hashKey"), Some(json!("id")));
        assert_eq!(outputs.get("name"), Some(json!(outputs.physical_id.clone())));
        assert!(outputs.get("arn").is_some());
        assert_eq!(provider.resource_count(), 1);
    }

    #[tokio::test]
    async fn test_declared_name_is_kept() {
        let provider = LocalProvider::new();
        let id = ResourceId::new("t", "aws:dynamodb:Table");
        let outputs = provider
            .apply(&ProviderRequest::create(id, props(json!({"name": "todos"}))))
            .await
            .unwrap();
        assert_eq!(outputs.get("name"), Some(json!("todos")));
    }

    #[tokio::test]
    async fn test_update_keeps_physical_id_and_delete_removes() {
        let provider = LocalProvider::new();
        let id = ResourceId::new("fn", "aws:lambda:Function");
        let created = provider
            .apply(&ProviderRequest::create(id.clone(), props(json!({"memory": 128}))))
            .await
            .unwrap();

        let updated = provider
            .apply(&ProviderRequest::update(
                id.clone(),
                created.physical_id.clone(),
                props(json!({"memory": 256})),
                props(json!({"memory": 128})),
            ))
            .await
            .unwrap();
        assert_eq!(updated.physical_id, created.physical_id);
        assert_eq!(updated.get("memory"), Some(json!(256)));

        provider
            .apply(&ProviderRequest::delete(id, created.physical_id, BTreeMap::new()))
            .await
            .unwrap();
        assert_eq!(provider.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_update_without_physical_id_is_rejected() {
        let provider = LocalProvider::new();
        let mut request = ProviderRequest::create(ResourceId::new("x", "t"), BTreeMap::new());
        request.operation = OperationKind::Update;

        let err = provider.apply(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 400, .. }));
    }
}
