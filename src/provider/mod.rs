//! Provider module.
//!
//! Providers carry out a single resource operation against whatever backs
//! the resource type. The engine never talks to a cloud API directly:
//! - [`LocalProvider`] simulates resources in-process
//! - [`HttpProvider`] forwards operations to a provider plugin over HTTP
//! - [`ProviderRegistry`] routes resource types to providers

mod http;
mod local;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::graph::{Outputs, ResourceId};
use crate::planner::OperationKind;

pub use http::HttpProvider;
pub use local::LocalProvider;
pub use registry::ProviderRegistry;

/// A single operation for a provider to carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// What to do.
    pub operation: OperationKind,
    /// Which resource.
    pub id: ResourceId,
    /// Physical id of the existing resource, for updates and deletes.
    pub physical_id: Option<String>,
    /// Resolved desired properties; empty for deletes.
    pub properties: BTreeMap<String, Value>,
    /// Last applied properties, for updates and deletes.
    pub previous: Option<BTreeMap<String, Value>>,
}

/// Something that can apply resource operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Applies one operation and reports the resulting outputs.
    ///
    /// For deletes the outputs are those of the removed resource.
    async fn apply(&self, request: &ProviderRequest) -> Result<Outputs, ProviderError>;
}

impl ProviderRequest {
    /// Request to create a resource.
    #[must_use]
    pub fn create(id: ResourceId, properties: BTreeMap<String, Value>) -> Self {
        Self {
            operation: OperationKind::Create,
            id,
            physical_id: None,
            properties,
            previous: None,
        }
    }

    /// Request to update a resource in place.
    #[must_use]
    pub fn update(
        id: ResourceId,
        physical_id: String,
        properties: BTreeMap<String, Value>,
        previous: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            operation: OperationKind::Update,
            id,
            physical_id: Some(physical_id),
            properties,
            previous: Some(previous),
        }
    }

    /// Request to delete a resource.
    #[must_use]
    pub fn delete(id: ResourceId, physical_id: String, previous: BTreeMap<String, Value>) -> Self {
        Self {
            operation: OperationKind::Delete,
            id,
            physical_id: Some(physical_id),
            properties: BTreeMap::new(),
            previous: Some(previous),
        }
    }
}
