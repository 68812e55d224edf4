// SPDX-License-Identifier: GPL-2.0-or-later

use async_trait::async_trait;
use common::{ArcMsgLogger, LogLevel, MsgLogger, S3Config};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::OnceCell;

pub type ArcObjectStore = Arc<dyn ObjectStore + Send + Sync>;

/// Object storage seam. Absent an object-store endpoint everything
/// degrades to local-only behavior; failures are logged and reported as
/// `false`, never as errors.
#[async_trait]
pub trait ObjectStore {
    async fn upload(&self, local: &Path, key: &str) -> bool;
    async fn download(&self, key: &str, local: &Path) -> bool;

    /// Time-limited read URL, or `None` when the store cannot mint one and
    /// the caller should stream the file itself.
    async fn presign(&self, key: &str, ttl_sec: u64) -> Option<String>;
}

/// Picks the store implementation from the environment.
#[must_use]
pub fn new_object_store(s3: Option<&S3Config>, logger: ArcMsgLogger) -> ArcObjectStore {
    match s3 {
        Some(config) => Arc::new(S3Store::new(config, logger)),
        None => {
            logger.log(
                LogLevel::Info,
                "no object store endpoint configured, using local storage mode",
            );
            Arc::new(LocalStore {})
        }
    }
}

/// Local-only mode: the cache directory IS the storage.
pub struct LocalStore;

#[async_trait]
impl ObjectStore for LocalStore {
    async fn upload(&self, _local: &Path, _key: &str) -> bool {
        true
    }

    async fn download(&self, _key: &str, local: &Path) -> bool {
        local.exists()
    }

    async fn presign(&self, _key: &str, _ttl_sec: u64) -> Option<String> {
        None
    }
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    logger: ArcMsgLogger,
    bucket_ensured: OnceCell<()>,
}

impl S3Store {
    #[must_use]
    pub fn new(config: &S3Config, logger: ArcMsgLogger) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "env",
        );
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(conf),
            bucket: config.bucket.clone(),
            logger,
            bucket_ensured: OnceCell::new(),
        }
    }

    /// Head-or-create, once per process.
    async fn ensure_bucket(&self) {
        self.bucket_ensured
            .get_or_init(|| async {
                if self
                    .client
                    .head_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .is_ok()
                {
                    return;
                }
                if let Err(e) = self
                    .client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                {
                    self.logger
                        .log(LogLevel::Error, &format!("create bucket: {e}"));
                }
            })
            .await;
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload(&self, local: &Path, key: &str) -> bool {
        self.ensure_bucket().await;
        let body = match aws_sdk_s3::primitives::ByteStream::from_path(local).await {
            Ok(v) => v,
            Err(e) => {
                self.logger
                    .log(LogLevel::Error, &format!("read upload source: {e}"));
                return false;
            }
        };
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                self.logger.log(LogLevel::Error, &format!("upload: {e}"));
                false
            }
        }
    }

    async fn download(&self, key: &str, local: &Path) -> bool {
        self.ensure_bucket().await;
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(v) => v,
            Err(e) => {
                self.logger.log(LogLevel::Error, &format!("download: {e}"));
                return false;
            }
        };
        let bytes = match object.body.collect().await {
            Ok(v) => v.into_bytes(),
            Err(e) => {
                self.logger
                    .log(LogLevel::Error, &format!("download body: {e}"));
                return false;
            }
        };
        if let Err(e) = tokio::fs::write(local, &bytes).await {
            self.logger
                .log(LogLevel::Error, &format!("write download target: {e}"));
            return false;
        }
        true
    }

    async fn presign(&self, key: &str, ttl_sec: u64) -> Option<String> {
        self.ensure_bucket().await;
        let config =
            aws_sdk_s3::presigning::PresigningConfig::expires_in(Duration::from_secs(ttl_sec))
                .ok()?;
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
        {
            Ok(req) => Some(req.uri().to_string()),
            Err(e) => {
                self.logger.log(LogLevel::Error, &format!("presign: {e}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DummyLogger;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn local_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore {};

        // Upload is a no-op that reports success.
        assert!(store.upload(&dir.path().join("missing"), "key").await);

        // Download succeeds only when the target already exists.
        let existing = dir.path().join("clip.mp4");
        std::fs::write(&existing, b"x").unwrap();
        assert!(store.download("key", &existing).await);
        assert!(!store.download("key", &dir.path().join("absent")).await);

        // No presigned URLs in local mode.
        assert_eq!(None, store.presign("key", 3600).await);
    }

    #[tokio::test]
    async fn store_selection() {
        // Local store never presigns, which the handler relies on.
        let local = new_object_store(None, DummyLogger::new());
        assert_eq!(None, local.presign("k", 1).await);

        // An endpoint selects the object-store client. Construction alone,
        // no network.
        let _s3 = new_object_store(
            Some(&S3Config {
                endpoint: "http://127.0.0.1:9000".to_owned(),
                bucket: "clips".to_owned(),
                access_key: "a".to_owned(),
                secret_key: "s".to_owned(),
                region: "us-east-1".to_owned(),
            }),
            DummyLogger::new(),
        );
    }
}
