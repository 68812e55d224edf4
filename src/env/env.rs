// SPDX-License-Identifier: GPL-2.0-or-later

use common::{EnvConfig, S3Config};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use thiserror::Error;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_S3_BUCKET: &str = "subscrub";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_S3_CREDENTIAL: &str = "minioadmin";

/// Main config, resolved from the process environment. `S3_ENDPOINT` being
/// absent activates local-only storage mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvConf {
    port: u16,
    cache_dir: PathBuf,
    allowed_origins: Vec<String>,
    s3: Option<S3Config>,
}

#[derive(Debug, Error)]
pub enum EnvConfigNewError {
    #[error("parse PORT: {0}")]
    ParsePort(std::num::ParseIntError),

    #[error("create cache dir: {0} {1}")]
    CreateCacheDir(PathBuf, std::io::Error),

    #[error("canonicalize path: {0:?} {1}")]
    Canonicalize(PathBuf, std::io::Error),
}

impl EnvConf {
    pub fn new() -> Result<Self, EnvConfigNewError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    fn from_vars(vars: &HashMap<String, String>) -> Result<Self, EnvConfigNewError> {
        use EnvConfigNewError::*;
        let get = |key: &str| vars.get(key).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(v) => v.parse().map_err(ParsePort)?,
            None => DEFAULT_PORT,
        };

        let cache_dir = PathBuf::from(
            get("CACHE_DIR")
                .map_or(DEFAULT_CACHE_DIR, String::as_str),
        );
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| CreateCacheDir(cache_dir.clone(), e))?;
        let cache_dir = cache_dir
            .canonicalize()
            .map_err(|e| Canonicalize(cache_dir, e))?;

        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let s3 = get("S3_ENDPOINT").map(|endpoint| S3Config {
            endpoint: endpoint.clone(),
            bucket: get("S3_BUCKET")
                .map_or(DEFAULT_S3_BUCKET, String::as_str)
                .to_owned(),
            access_key: get("S3_ACCESS_KEY")
                .map_or(DEFAULT_S3_CREDENTIAL, String::as_str)
                .to_owned(),
            secret_key: get("S3_SECRET_KEY")
                .map_or(DEFAULT_S3_CREDENTIAL, String::as_str)
                .to_owned(),
            region: get("S3_REGION")
                .map_or(DEFAULT_S3_REGION, String::as_str)
                .to_owned(),
        });

        Ok(Self {
            port,
            cache_dir,
            allowed_origins,
            s3,
        })
    }
}

impl EnvConfig for EnvConf {
    fn port(&self) -> u16 {
        self.port
    }
    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
    fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }
    fn s3(&self) -> Option<&S3Config> {
        self.s3.as_ref()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn defaults() {
        let temp_dir = TempDir::new().unwrap();
        let cache = temp_dir.path().join("cache");
        let conf = EnvConf::from_vars(&vars(&[(
            "CACHE_DIR",
            cache.to_str().unwrap(),
        )]))
        .unwrap();

        assert_eq!(DEFAULT_PORT, conf.port());
        assert!(conf.allowed_origins().is_empty());
        assert!(conf.s3().is_none());
        assert!(conf.cache_dir().exists());
    }

    #[test]
    fn s3_mode() {
        let temp_dir = TempDir::new().unwrap();
        let cache = temp_dir.path().join("cache");
        let conf = EnvConf::from_vars(&vars(&[
            ("CACHE_DIR", cache.to_str().unwrap()),
            ("PORT", "9000"),
            ("ALLOWED_ORIGINS", "http://a, http://b"),
            ("S3_ENDPOINT", "http://minio:9000"),
            ("S3_BUCKET", "videos"),
        ]))
        .unwrap();

        assert_eq!(9000, conf.port());
        assert_eq!(&["http://a".to_owned(), "http://b".to_owned()], conf.allowed_origins());
        let s3 = conf.s3().unwrap();
        assert_eq!("http://minio:9000", s3.endpoint);
        assert_eq!("videos", s3.bucket);
        assert_eq!(DEFAULT_S3_CREDENTIAL, s3.access_key);
    }
}
