//! S3-compatible object store adapter.
//!
//! Wraps the `object_store` crate's AWS backend. A configured endpoint
//! switches to path-style addressing over plain HTTP, which is what
//! LocalStack and MinIO deployments expect.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::ObjectStore as _;

use echodb_core::config::StoreConfig;
use echodb_core::{Error, Result};

use crate::ObjectStore;

/// Adapter over an S3-compatible bucket.
pub struct S3Store {
    inner: Arc<AmazonS3>,
    bucket: String,
}

impl S3Store {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(true)
                .with_virtual_hosted_style_request(false);
        }

        let inner = builder.build().map_err(|e| Error::Configuration {
            message: format!("failed to build S3 client for {}: {}", config.bucket, e),
        })?;

        Ok(Self {
            inner: Arc::new(inner),
            bucket: config.bucket.clone(),
        })
    }

    fn unavailable(&self, op: &str, key: &str, source: object_store::Error) -> Error {
        Error::store_unavailable(
            format!("{} {} in bucket {}", op, key, self.bucket),
            Some(Box::new(source)),
        )
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = Path::from(key);
        self.inner
            .put(&path, data)
            .await
            .map_err(|e| self.unavailable("put", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = Path::from(key);
        match self.inner.get(&path).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| self.unavailable("get", key, e))?;
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(self.unavailable("get", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = Path::from(key);
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(self.unavailable("delete", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::from(prefix);
        let metas: Vec<_> = self
            .inner
            .list(Some(&path))
            .try_collect()
            .await
            .map_err(|e| self.unavailable("list", prefix, e))?;
        Ok(metas.into_iter().map(|m| m.location.to_string()).collect())
    }

    async fn head(&self, key: &str) -> Result<bool> {
        let path = Path::from(key);
        match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.unavailable("head", key, e)),
        }
    }
}
