//! Uploader stage

use crate::stage::{Outcome, Processor};
use crate::storage::{content_type_for, object_key, ObjectStore, PutOptions};
use async_trait::async_trait;
use pixflow_common::{ErrorInfo, ErrorKind, Stage, WorkItem};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    key_prefix: Option<String>,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, key_prefix: Option<String>) -> Self {
        Self { store, key_prefix }
    }

    fn fail(item: WorkItem, kind: ErrorKind, message: String) -> Outcome {
        Outcome::Fail(item.fail(ErrorInfo::new(Stage::Uploader, kind, message)))
    }
}

#[async_trait]
impl Processor for Uploader {
    fn stage(&self) -> Stage {
        Stage::Uploader
    }

    #[instrument(skip(self, item, _cancel), fields(url = %item.url))]
    async fn process(&self, mut item: WorkItem, _cancel: &CancellationToken) -> Outcome {
        let Some(path) = item.local_output_path.clone() else {
            return Self::fail(item, ErrorKind::Permanent, "no converted file to upload".to_string());
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                let message = format!("cannot read {}: {}", path.display(), e);
                return Self::fail(item, ErrorKind::LocalIo, message);
            }
        };

        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            let message = format!("{} has no file name", path.display());
            return Self::fail(item, ErrorKind::LocalIo, message);
        };
        let key = object_key(self.key_prefix.as_deref(), &file_name);
        let options = PutOptions {
            content_type: Some(content_type_for(&path).to_string()),
            content_hash: item.content_hash,
        };

        match self.store.put_object(&key, data, options).await {
            Ok(remote_url) => {
                info!(key = %key, remote_url = %remote_url, "Uploaded");
                item.remote_url = Some(remote_url);
                Outcome::Forward(item)
            }
            Err(e) => Self::fail(item, ErrorKind::Permanent, e.to_string()),
        }
    }
}
