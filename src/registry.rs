//! The workflow registry: binding CRUD and schema synchronization.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::binding::{BindingId, BindingUpdate, WorkflowBinding};
use crate::client::WorkflowClient;
use crate::error::{Result, VolleyError};
use crate::store::Store;

/// Registry of workflow bindings.
///
/// Bindings are read-mostly: while any batch referencing a binding is
/// non-terminal, every mutation (`sync`, `update`, `delete`) is rejected
/// with the in-use error, so a running batch always sees the schema and
/// credential it started with.
pub struct WorkflowRegistry<S, C> {
    store: Arc<S>,
    client: C,
    /// Deadline for schema fetches
    timeout: Duration,
}

impl<S, C> WorkflowRegistry<S, C>
where
    S: Store,
    C: WorkflowClient,
{
    pub fn new(store: Arc<S>, client: C, timeout: Duration) -> Self {
        Self {
            store,
            client,
            timeout,
        }
    }

    /// Register a binding, validating the endpoint by fetching its schema.
    #[tracing::instrument(skip(self, credential))]
    pub async fn create(
        &self,
        name: String,
        description: Option<String>,
        base_url: String,
        credential: String,
    ) -> Result<WorkflowBinding> {
        let schema = self
            .client
            .fetch_schema(&base_url, &credential, self.timeout)
            .await?;

        let binding = WorkflowBinding {
            id: BindingId::new(),
            name,
            description,
            base_url,
            credential,
            schema: Some(schema),
            synced_at: Some(Utc::now()),
            active: true,
            created_at: Utc::now(),
        };
        self.store.insert_binding(binding.clone()).await?;
        tracing::info!(binding_id = %binding.id, "binding created");
        Ok(binding)
    }

    /// Refetch the schema and replace the cached copy.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self, id: BindingId) -> Result<WorkflowBinding> {
        let mut binding = self.store.binding(id).await?;
        if self.store.binding_in_use(id).await? {
            return Err(VolleyError::BindingInUse(id));
        }

        let schema = self
            .client
            .fetch_schema(&binding.base_url, &binding.credential, self.timeout)
            .await?;
        binding.schema = Some(schema);
        binding.synced_at = Some(Utc::now());
        self.store.update_binding(binding.clone()).await?;
        tracing::info!(binding_id = %id, "binding schema synced");
        Ok(binding)
    }

    pub async fn update(&self, id: BindingId, update: BindingUpdate) -> Result<WorkflowBinding> {
        let mut binding = self.store.binding(id).await?;
        if self.store.binding_in_use(id).await? {
            return Err(VolleyError::BindingInUse(id));
        }

        if let Some(name) = update.name {
            binding.name = name;
        }
        if let Some(description) = update.description {
            binding.description = description;
        }
        if let Some(credential) = update.credential {
            binding.credential = credential;
        }
        if let Some(active) = update.active {
            binding.active = active;
        }
        self.store.update_binding(binding.clone()).await?;
        Ok(binding)
    }

    pub async fn delete(&self, id: BindingId) -> Result<()> {
        // Existence first so a missing binding is not reported as in use.
        self.store.binding(id).await?;
        if self.store.binding_in_use(id).await? {
            return Err(VolleyError::BindingInUse(id));
        }
        self.store.remove_binding(id).await?;
        tracing::info!(binding_id = %id, "binding deleted");
        Ok(())
    }

    pub async fn get(&self, id: BindingId) -> Result<WorkflowBinding> {
        self.store.binding(id).await
    }

    pub async fn list(&self) -> Result<Vec<WorkflowBinding>> {
        self.store.bindings().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchId, BatchState};
    use crate::binding::{ParameterSchema, ParameterSpec, ParameterType};
    use crate::client::{MockWorkflowClient, SchemaFetchError};
    use crate::store::in_memory::InMemoryStore;

    fn schema(names: &[&str]) -> ParameterSchema {
        ParameterSchema {
            parameters: names
                .iter()
                .map(|name| ParameterSpec {
                    name: name.to_string(),
                    kind: ParameterType::String,
                    required: true,
                    description: None,
                    default: None,
                    options: Vec::new(),
                })
                .collect(),
        }
    }

    fn registry(
        store: Arc<InMemoryStore>,
        client: MockWorkflowClient,
    ) -> WorkflowRegistry<InMemoryStore, MockWorkflowClient> {
        WorkflowRegistry::new(store, client, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn create_caches_schema_and_sync_timestamp() {
        let store = Arc::new(InMemoryStore::new());
        let client = MockWorkflowClient::new().with_schema(schema(&["q"]));
        let registry = registry(store.clone(), client);

        let binding = registry
            .create(
                "search".to_string(),
                None,
                "https://workflows.example.com/v1".to_string(),
                "key".to_string(),
            )
            .await
            .unwrap();

        assert!(binding.synced_at.is_some());
        assert_eq!(binding.schema.as_ref().unwrap().parameters.len(), 1);

        let stored = registry.get(binding.id).await.unwrap();
        assert_eq!(stored.schema, binding.schema);
    }

    #[tokio::test]
    async fn create_surfaces_auth_and_unreachable() {
        let store = Arc::new(InMemoryStore::new());
        let client = MockWorkflowClient::new();
        client.set_schema_result(Err(SchemaFetchError::Auth("HTTP 401".to_string())));
        let registry = registry(store.clone(), client.clone());

        let err = registry
            .create("a".to_string(), None, "u".to_string(), "k".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::Auth(_)));
        assert!(registry.list().await.unwrap().is_empty());

        client.set_schema_result(Err(SchemaFetchError::Unreachable("refused".to_string())));
        let err = registry
            .create("a".to_string(), None, "u".to_string(), "k".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::Unreachable(_)));
    }

    #[tokio::test]
    async fn sync_replaces_the_cached_schema() {
        let store = Arc::new(InMemoryStore::new());
        let client = MockWorkflowClient::new().with_schema(schema(&["q"]));
        let registry = registry(store.clone(), client.clone());

        let binding = registry
            .create("a".to_string(), None, "u".to_string(), "k".to_string())
            .await
            .unwrap();

        client.set_schema_result(Ok(schema(&["q", "depth"])));
        let synced = registry.sync(binding.id).await.unwrap();
        assert_eq!(synced.schema.unwrap().parameters.len(), 2);
        assert!(synced.synced_at.unwrap() >= binding.synced_at.unwrap());
    }

    async fn attach_batch(store: &InMemoryStore, binding_id: BindingId, state: BatchState) -> BatchId {
        let batch = Batch {
            id: BatchId::new(),
            binding_id,
            source_file_ref: "batch_data.xlsx".to_string(),
            created_at: Utc::now(),
            state,
            concurrency_limit: 1,
            max_attempts: 1,
            result_template: None,
            started_at: None,
            finished_at: None,
        };
        let id = batch.id;
        store.insert_batch(batch, Vec::new(), Vec::new()).await.unwrap();
        id
    }

    #[tokio::test]
    async fn mutations_are_rejected_while_a_batch_is_live() {
        let store = Arc::new(InMemoryStore::new());
        let client = MockWorkflowClient::new().with_schema(schema(&["q"]));
        let registry = registry(store.clone(), client);

        let binding = registry
            .create("a".to_string(), None, "u".to_string(), "k".to_string())
            .await
            .unwrap();
        attach_batch(&store, binding.id, BatchState::Running).await;

        assert!(matches!(
            registry.delete(binding.id).await,
            Err(VolleyError::BindingInUse(_))
        ));
        assert!(matches!(
            registry.sync(binding.id).await,
            Err(VolleyError::BindingInUse(_))
        ));
        assert!(matches!(
            registry
                .update(binding.id, BindingUpdate::default())
                .await,
            Err(VolleyError::BindingInUse(_))
        ));
    }

    #[tokio::test]
    async fn delete_succeeds_once_batches_settle() {
        let store = Arc::new(InMemoryStore::new());
        let client = MockWorkflowClient::new().with_schema(schema(&["q"]));
        let registry = registry(store.clone(), client);

        let binding = registry
            .create("a".to_string(), None, "u".to_string(), "k".to_string())
            .await
            .unwrap();
        attach_batch(&store, binding.id, BatchState::Completed).await;

        registry.delete(binding.id).await.unwrap();
        assert!(matches!(
            registry.get(binding.id).await,
            Err(VolleyError::BindingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_changes_only_the_given_fields() {
        let store = Arc::new(InMemoryStore::new());
        let client = MockWorkflowClient::new().with_schema(schema(&["q"]));
        let registry = registry(store.clone(), client);

        let binding = registry
            .create("old".to_string(), None, "u".to_string(), "k".to_string())
            .await
            .unwrap();

        let updated = registry
            .update(
                binding.id,
                BindingUpdate {
                    name: Some("new".to_string()),
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "new");
        assert!(!updated.active);
        assert_eq!(updated.credential, "k");
        assert_eq!(updated.schema, binding.schema);
    }
}
