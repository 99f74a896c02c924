//! Backend selection for the object store

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ClientOptions, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Where objects live
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    /// Process memory, lost on exit
    #[default]
    Memory,
    /// A directory on local disk
    Local { path: PathBuf },
    /// S3 or an S3-compatible service such as MinIO
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        region: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to create storage directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to build object store: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl ObjectStoreConfig {
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>, BuildError> {
        match self {
            ObjectStoreConfig::Memory => {
                info!("using in-memory object store");
                Ok(Arc::new(InMemory::new()))
            }
            ObjectStoreConfig::Local { path } => {
                info!(path = %path.display(), "using local object store");
                std::fs::create_dir_all(path).map_err(|source| BuildError::CreateDir {
                    path: path.clone(),
                    source,
                })?;
                Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
            }
            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let region = region.as_deref().unwrap_or("us-east-1");
                info!(endpoint = %endpoint, bucket = %bucket, region, "using S3 object store");

                let client_options = ClientOptions::new()
                    .with_timeout(Duration::from_secs(30))
                    .with_allow_http(endpoint.starts_with("http://"));
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_client_options(client_options);
                if !endpoint.is_empty() {
                    builder = builder.with_endpoint(endpoint);
                }
                Ok(Arc::new(builder.build()?))
            }
        }
    }
}
