use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Where converted images are uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    S3,
    /// Copy into a local directory and hand out `file://` URLs
    Local,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(StoreBackend::S3),
            "local" | "file" => Ok(StoreBackend::Local),
            _ => Err(anyhow::anyhow!("Invalid store backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StoreBackend,
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub path_style: bool,
    /// Base for public object URLs, e.g. a CDN in front of the bucket
    pub public_base_url: Option<String>,
    /// Prepended to every object key
    pub key_prefix: Option<String>,
    /// Target directory for the local backend
    pub local_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::S3,
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "pixflow-images".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: false,
            public_base_url: None,
            key_prefix: None,
            local_dir: PathBuf::from("./data/uploaded"),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            backend: match env::var("PIXFLOW_STORE") {
                Ok(value) => value.parse()?,
                Err(_) => defaults.backend,
            },
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or(defaults.region),
            bucket: env::var("S3_BUCKET").unwrap_or(defaults.bucket),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or(defaults.access_key),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or(defaults.secret_key),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            public_base_url: env::var("S3_PUBLIC_BASE_URL").ok(),
            key_prefix: env::var("S3_KEY_PREFIX").ok().filter(|p| !p.is_empty()),
            local_dir: env::var("PIXFLOW_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_dir),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            path_style: true,
            ..Self::default()
        }
    }

    pub fn for_local(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: StoreBackend::Local,
            local_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == StoreBackend::S3 && self.bucket.trim().is_empty() {
            anyhow::bail!("S3 bucket name cannot be empty");
        }
        Ok(())
    }

    /// Public URL of an object in the configured bucket
    pub fn public_url(&self, key: &str) -> String {
        if let Some(base) = &self.public_base_url {
            return format!("{}/{}", base.trim_end_matches('/'), key);
        }
        match &self.endpoint {
            Some(endpoint) if self.path_style => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key)
            }
            Some(endpoint) => match endpoint.split_once("://") {
                Some((scheme, host)) => format!(
                    "{}://{}.{}/{}",
                    scheme,
                    self.bucket,
                    host.trim_end_matches('/'),
                    key
                ),
                None => format!("{}/{}/{}", endpoint, self.bucket, key),
            },
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert_eq!(config.bucket, "test-bucket");
        assert!(config.path_style);
        assert_eq!(
            config.public_url("cat-converted.png"),
            "http://localhost:9000/test-bucket/cat-converted.png"
        );
    }

    #[test]
    fn test_public_url_on_aws() {
        let config = StorageConfig {
            region: "eu-west-1".to_string(),
            bucket: "images".to_string(),
            ..StorageConfig::default()
        };
        assert_eq!(
            config.public_url("a.png"),
            "https://images.s3.eu-west-1.amazonaws.com/a.png"
        );
    }

    #[test]
    fn test_public_base_url_wins() {
        let config = StorageConfig {
            public_base_url: Some("https://cdn.example.com/".to_string()),
            ..StorageConfig::for_minio("http://localhost:9000", "b")
        };
        assert_eq!(config.public_url("x/a.png"), "https://cdn.example.com/x/a.png");
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!("LOCAL".parse::<StoreBackend>().unwrap(), StoreBackend::Local);
        assert!("gcs".parse::<StoreBackend>().is_err());
    }
}
