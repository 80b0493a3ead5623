//! S3 (and S3-compatible) remote store on top of `object_store`.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use lcbackup_core::{Deadline, S3Credentials, S3Settings};

use super::remote::{RemoteError, RemoteStore, RemoteStoreFactory};

/// Blocking facade over an async [`ObjectStore`].
///
/// Calls block on the injected runtime handle, so they must be made from a
/// thread that is not a runtime worker (runner threads, `spawn_blocking`).
#[derive(Debug, Clone)]
pub struct S3RemoteStore {
    bucket: String,
    store: Arc<dyn ObjectStore>,
    handle: Handle,
}

impl S3RemoteStore {
    /// Build the S3 client from validated step settings.
    pub fn from_settings(settings: &S3Settings, handle: Handle) -> Result<Self, RemoteError> {
        settings
            .validate()
            .map_err(|e| RemoteError::Config(e.to_string()))?;

        let mut builder = match &settings.credentials {
            S3Credentials::Ambient => AmazonS3Builder::from_env(),
            S3Credentials::Static {
                access_key_id,
                secret_access_key,
            } => AmazonS3Builder::new()
                .with_access_key_id(access_key_id)
                .with_secret_access_key(secret_access_key),
        }
        .with_bucket_name(&settings.bucket)
        .with_region(&settings.region);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(proxy) = &settings.proxy_url {
            builder = builder.with_proxy_url(proxy);
        }

        let store = builder
            .build()
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        Ok(Self::with_store(settings.bucket.clone(), Arc::new(store), handle))
    }

    pub fn with_store(bucket: impl Into<String>, store: Arc<dyn ObjectStore>, handle: Handle) -> Self {
        Self {
            bucket: bucket.into(),
            store,
            handle,
        }
    }

    fn block_on<T>(
        &self,
        deadline: Deadline,
        fut: impl Future<Output = Result<T, object_store::Error>>,
        map: impl FnOnce(object_store::Error) -> RemoteError,
    ) -> Result<T, RemoteError> {
        if deadline.is_expired() {
            return Err(RemoteError::Timeout);
        }
        match self
            .handle
            .block_on(async { tokio::time::timeout(deadline.remaining(), fut).await })
        {
            Ok(result) => result.map_err(map),
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}

/// Builds an [`S3RemoteStore`] per step instance remote.
#[derive(Debug, Clone)]
pub struct S3RemoteStoreFactory {
    handle: Handle,
}

impl S3RemoteStoreFactory {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl RemoteStoreFactory for S3RemoteStoreFactory {
    fn open(&self, settings: &S3Settings) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        Ok(Arc::new(S3RemoteStore::from_settings(settings, self.handle.clone())?))
    }
}

impl RemoteStore for S3RemoteStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self), fields(bucket = %self.bucket), err)]
    fn head_bucket(&self, deadline: Deadline) -> Result<(), RemoteError> {
        self.block_on(deadline, self.store.list_with_delimiter(None), |e| {
            RemoteError::Unreachable(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self, content), fields(bucket = %self.bucket, size = content.len()), err)]
    fn put_object(&self, key: &str, content: Bytes, deadline: Deadline) -> Result<(), RemoteError> {
        let path = ObjectPath::from(key);
        let result = self.block_on(deadline, self.store.put(&path, PutPayload::from(content)), |e| {
            RemoteError::Transfer(e.to_string())
        })?;
        debug!(key, e_tag = ?result.e_tag, "object uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use object_store::memory::InMemory;

    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn put_lands_in_the_bucket() {
        let rt = runtime();
        let backing = Arc::new(InMemory::new());
        let remote = S3RemoteStore::with_store("backups", backing.clone(), rt.handle().clone());
        let deadline = Deadline::after(Duration::from_secs(5));

        remote.head_bucket(deadline).unwrap();
        remote
            .put_object("lifecycle/a.mbz", Bytes::from_static(b"archive"), deadline)
            .unwrap();

        let stored = rt
            .block_on(async {
                backing
                    .get(&ObjectPath::from("lifecycle/a.mbz"))
                    .await
                    .unwrap()
                    .bytes()
                    .await
            })
            .unwrap();
        assert_eq!(stored, Bytes::from_static(b"archive"));
    }

    #[test]
    fn expired_deadline_is_a_timeout() {
        let rt = runtime();
        let remote = S3RemoteStore::with_store("backups", Arc::new(InMemory::new()), rt.handle().clone());
        let expired = Deadline::at(std::time::Instant::now() - Duration::from_millis(1));
        assert_eq!(remote.head_bucket(expired), Err(RemoteError::Timeout));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let rt = runtime();
        let settings = S3Settings {
            bucket: String::new(),
            region: "eu-west-1".to_string(),
            credentials: S3Credentials::Ambient,
            endpoint: None,
            proxy_url: None,
            key_prefix: String::new(),
        };
        assert!(matches!(
            S3RemoteStore::from_settings(&settings, rt.handle().clone()),
            Err(RemoteError::Config(_))
        ));
        assert!(matches!(
            S3RemoteStoreFactory::new(rt.handle().clone()).open(&settings),
            Err(RemoteError::Config(_))
        ));
    }

    #[test]
    fn factory_builds_a_client_for_the_instance_bucket() {
        let rt = runtime();
        let settings = S3Settings {
            bucket: "faculty-science".to_string(),
            region: "eu-west-1".to_string(),
            credentials: S3Credentials::Static {
                access_key_id: "AKIA".to_string(),
                secret_access_key: "secret".to_string(),
            },
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            proxy_url: None,
            key_prefix: String::new(),
        };
        let remote = S3RemoteStoreFactory::new(rt.handle().clone()).open(&settings).unwrap();
        assert_eq!(remote.bucket(), "faculty-science");
    }
}
