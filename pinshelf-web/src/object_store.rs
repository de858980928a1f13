//! Object store client
//!
//! Stored image bytes live in an S3-compatible bucket, keyed by the image's
//! identity as `"{slug}.{ext}"`. The client works against AWS as well as
//! R2/MinIO-style endpoints via the custom endpoint + path-style options.

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, warn};

use pinshelf_common::model::{ImageExt, ImageSlug};

use crate::config::ObjectStoreSettings;

/// Deterministic object key for an image identity.
pub fn object_key(slug: &ImageSlug, ext: &ImageExt) -> String {
    format!("{slug}.{ext}")
}

#[derive(Clone)]
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
}

impl ObjectStore {
    pub async fn new(settings: &ObjectStoreSettings) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);
        if let Some(ref endpoint_url) = settings.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        info!(
            bucket = %settings.bucket,
            region = %settings.region,
            "Object store client initialized"
        );

        Ok(Self {
            client,
            bucket: settings.bucket.clone(),
            public_base_url: settings.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Public URL an object is served from.
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url)
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        let size_bytes = bytes.len();
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .context("Failed to upload object to store")?;

        debug!(key, size_bytes, "Object uploaded");
        Ok(())
    }

    /// Delete an object. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object from store")?;

        debug!(key, "Object deleted");
        Ok(())
    }

    /// Check whether an object exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    warn!(key, error = %e, "Object existence check failed");
                    Err(e).context("Failed to check object existence")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_joins_slug_and_ext() {
        let slug = ImageSlug::parse("sunset-beach").unwrap();
        let ext = ImageExt::parse(".JPG").unwrap();
        assert_eq!(object_key(&slug, &ext), "sunset-beach.jpg");
    }
}
