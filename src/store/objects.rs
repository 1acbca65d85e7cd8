//! Object store creation for the SlateDB-backed store.

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use tracing::info;

use crate::config::ObjectStoreType;
use crate::error::ConfigError;

/// Build the object store described by `config`.
///
/// # Errors
///
/// Returns an error if:
/// - The data directory cannot be created (for local filesystem)
/// - The S3 configuration is rejected by the builder
pub fn create_object_store(config: &ObjectStoreType) -> Result<Arc<dyn ObjectStore>, ConfigError> {
    match config {
        ObjectStoreType::Local { path } => {
            std::fs::create_dir_all(path).map_err(|e| {
                ConfigError::ObjectStore(format!("Failed to create data directory: {e}"))
            })?;

            let store = LocalFileSystem::new_with_prefix(path)
                .map_err(|e| ConfigError::ObjectStore(e.to_string()))?;
            info!(path = %path, "Using local filesystem object store");
            Ok(Arc::new(store))
        }
        ObjectStoreType::InMemory => {
            info!("Using in-memory object store");
            Ok(Arc::new(InMemory::new()))
        }
        ObjectStoreType::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            use object_store::aws::AmazonS3Builder;

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(region);

            if let Some(ep) = endpoint {
                builder = builder.with_endpoint(ep).with_allow_http(true);
            }

            if let (Some(key), Some(secret)) = (access_key_id, secret_access_key) {
                builder = builder
                    .with_access_key_id(key)
                    .with_secret_access_key(secret);
            }

            let store = builder.build().map_err(|e| {
                ConfigError::ObjectStore(format!("Failed to create S3 object store: {e}"))
            })?;

            info!(bucket = %bucket, region = %region, "Using S3 object store");
            Ok(Arc::new(store))
        }
    }
}
