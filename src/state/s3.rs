//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for teams sharing a stack. The run lock is taken with
//! conditional writes: `If-None-Match: *` to create it, `If-Match` on the
//! read ETag to take over an expired one or refresh our own.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated, unreadable_conflict};
use super::store::StateStore;
use super::types::StackState;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy)]
enum WriteCondition<'a> {
    /// The key must not exist.
    Absent,
    /// The object must still have this ETag.
    Matches(&'a str),
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_object_tagged(key).await?.map(|(content, _)| content))
    }

    /// Gets an object from S3 along with its ETag.
    async fn get_object_tagged(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(String::from);
                let bytes = response.body.collect().await.map_err(|e| {
                    ConvergeError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ConvergeError::State(StateError::corrupted(format!(
                        "Invalid UTF-8 in S3 object: {e}"
                    )))
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ConvergeError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Puts an object only if `condition` holds. Returns false if it did not.
    async fn put_object_if(&self, key: &str, content: &str, condition: WriteCondition<'_>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");
        let request = match condition {
            WriteCondition::Absent => request.if_none_match("*"),
            WriteCondition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if precondition_failed(e.raw_response().map(|r| r.status().as_u16())) => {
                debug!("Conditional put of {key} refused ({condition:?})");
                Ok(false)
            }
            Err(e) => Err(ConvergeError::State(StateError::s3(format!(
                "S3 conditional put error: {e}"
            )))),
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(ConvergeError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize: {e}")))
        })?;
        self.put_object(key, &content).await
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock_tagged().await?.map(|(lock, _)| lock))
    }

    async fn read_lock_tagged(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some((content, etag)) = self.get_object_tagged(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock_info = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })?;
        Ok(Some((lock_info, etag)))
    }

    /// The error for a run that lost the race for the lock.
    async fn current_conflict(&self) -> ConvergeError {
        let held = self.read_lock().await.ok().flatten();
        ConvergeError::State(held.as_ref().map_or_else(unreadable_conflict, LockInfo::conflict))
    }
}

/// S3 answers 412 to a failed precondition and 409 when a concurrent
/// conditional write to the same key won.
const fn precondition_failed(status: Option<u16>) -> bool {
    matches!(status, Some(409 | 412))
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: StackState = serde_json::from_str(&json).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse state: {e}")))
        })?;

        info!(
            "Loaded state for stack: {}/{}",
            state.project, state.environment
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state to s3://{}/{key}", self.bucket);
        self.put_json(&key, state).await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        let lock_key = self.key(LOCK_KEY);

        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&lock_key).await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, run_id: &str, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let lock_info = LockInfo::new(run_id, &holder_or_generated(holder));
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        if !self.put_object_if(&key, &content, WriteCondition::Absent).await? {
            let existing = match self.read_lock_tagged().await {
                Ok(existing) => existing,
                Err(e) => {
                    warn!("Lock object exists but is unreadable: {e}");
                    return Err(ConvergeError::State(unreadable_conflict()));
                }
            };

            let acquired = match existing {
                Some((existing, _)) if !existing.is_expired() => {
                    return Err(ConvergeError::State(existing.conflict()));
                }
                Some((existing, Some(etag))) => {
                    warn!(
                        "Taking over expired lock held by {} (run {})",
                        existing.holder, existing.run_id
                    );
                    self.put_object_if(&key, &content, WriteCondition::Matches(&etag))
                        .await?
                }
                Some((_, None)) => {
                    return Err(ConvergeError::State(StateError::LockFailed {
                        message: String::from("expired lock object has no ETag"),
                    }));
                }
                // Released since the first attempt.
                None => self.put_object_if(&key, &content, WriteCondition::Absent).await?,
            };
            if !acquired {
                return Err(self.current_conflict().await);
            }
        }

        info!(
            "Acquired state lock {} for {run_id} (expires in {LOCK_EXPIRY_SECS}s)",
            lock_info.lock_id
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<()> {
        let Some((mut existing, etag)) = self.read_lock_tagged().await? else {
            return Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Lock {lock_id} is no longer held"),
            }));
        };
        if existing.lock_id != lock_id {
            return Err(ConvergeError::State(existing.conflict()));
        }

        existing.refresh();
        let content = serde_json::to_string_pretty(&existing).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        let key = self.key(LOCK_KEY);
        let Some(etag) = etag else {
            return self.put_object(&key, &content).await;
        };
        if self.put_object_if(&key, &content, WriteCondition::Matches(&etag)).await? {
            Ok(())
        } else {
            Err(self.current_conflict().await)
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRECONDITION_FAILED: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <Error><Code>PreconditionFailed</Code>\
        <Message>At least one of the pre-conditions you specified did not hold</Message></Error>";

    fn store_for(server: &MockServer) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .build();
        S3StateStore::with_client(Client::from_conf(config), "state-bucket", None)
    }

    fn lock_body(lock: &LockInfo) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("ETag", "\"v1\"")
            .set_body_raw(serde_json::to_string(lock).unwrap(), "application/json")
    }

    #[tokio::test]
    async fn test_lock_is_created_only_if_absent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/state-bucket/state.lock"))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v1\""))
            .expect(1)
            .mount(&server)
            .await;

        let lock = store_for(&server).acquire_lock("run-1", "me").await.unwrap();
        assert_eq!(lock.run_id, "run-1");
    }

    #[tokio::test]
    async fn test_existing_lock_refuses_second_run() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/state-bucket/state.lock"))
            .respond_with(ResponseTemplate::new(412).set_body_raw(PRECONDITION_FAILED, "application/xml"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/state-bucket/state.lock"))
            .respond_with(lock_body(&LockInfo::new("run-1", "other")))
            .mount(&server)
            .await;

        let err = store_for(&server).acquire_lock("run-2", "me").await.unwrap_err();
        match err {
            ConvergeError::State(StateError::ConcurrentRun { run_id, holder, .. }) => {
                assert_eq!(run_id, "run-1");
                assert_eq!(holder, "other");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lock_is_replaced_by_etag() {
        let server = MockServer::start().await;
        let mut stale = LockInfo::new("run-old", "gone");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);

        Mock::given(method("PUT"))
            .and(path("/state-bucket/state.lock"))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(412).set_body_raw(PRECONDITION_FAILED, "application/xml"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/state-bucket/state.lock"))
            .respond_with(lock_body(&stale))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/state-bucket/state.lock"))
            .and(header("if-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v2\""))
            .expect(1)
            .mount(&server)
            .await;

        let lock = store_for(&server).acquire_lock("run-new", "me").await.unwrap();
        assert_eq!(lock.run_id, "run-new");
    }

    #[test]
    fn test_precondition_statuses() {
        assert!(precondition_failed(Some(412)));
        assert!(precondition_failed(Some(409)));
        assert!(!precondition_failed(Some(403)));
        assert!(!precondition_failed(None));
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("todo-app/prod/")), "todo-app/prod/");
        assert_eq!(normalize_prefix(Some("/todo-app")), "todo-app/");
    }
}
