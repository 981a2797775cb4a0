//! Remote store that streams files to a backup server over HTTP.
//!
//! Routes:
//! - `POST   /api/backups`          create (or confirm) a container
//! - `POST   /api/files/upload`     stream one object, optionally zstd-compressed
//! - `DELETE /api/files?backup=&path=` remove one object

use super::{object_key, RemoteError, RemoteStore};
use crate::model::Backup;
use async_compression::tokio::bufread::ZstdEncoder;
use async_trait::async_trait;
use reqwest::{Body, Method, RequestBuilder, StatusCode};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Only compress files smaller than 500 MB to avoid memory issues
const MAX_COMPRESS_SIZE: u64 = 500 * 1024 * 1024;

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
    agent_id: String,
}

impl HttpStore {
    pub fn new(url: &str, token: &str, agent_id: &str) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            agent_id: agent_id.to_string(),
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    fn request(&self, method: Method, route: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(route))
            .header("x-agent-id", &self.agent_id);
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }
}

/// Map a response status to a result. `tolerated` is a non-2xx status that
/// still means the operation's goal holds.
fn check(
    status: StatusCode,
    operation: &'static str,
    key: String,
    tolerated: Option<StatusCode>,
) -> Result<(), RemoteError> {
    if status.is_success() || Some(status) == tolerated {
        Ok(())
    } else {
        Err(RemoteError::Rejected {
            operation,
            key,
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn create_container(&self, backup: &Backup) -> Result<(), RemoteError> {
        let response = self
            .request(Method::POST, "/api/backups")
            .json(&json!({ "name": backup.container() }))
            .send()
            .await?;

        check(
            response.status(),
            "create container",
            backup.container().to_string(),
            Some(StatusCode::CONFLICT),
        )?;
        info!(backup = %backup.name, "Remote container ready");
        Ok(())
    }

    async fn upload_file(&self, backup: &Backup, path: &Path) -> Result<(), RemoteError> {
        let key = object_key(backup, path)?;
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let request = self
            .request(Method::POST, "/api/files/upload")
            .header("x-backup", backup.container())
            .header("x-relative-path", &key)
            .header("x-total-size", size.to_string());

        let request = if size < MAX_COMPRESS_SIZE {
            let compressed = ZstdEncoder::with_quality(
                BufReader::new(file),
                async_compression::Level::Default,
            );
            request
                .header("content-encoding", "zstd")
                .body(Body::wrap_stream(ReaderStream::new(compressed)))
        } else {
            request.body(Body::wrap_stream(ReaderStream::new(file)))
        };

        let response = request.send().await?;
        check(response.status(), "upload", key.clone(), None)?;

        debug!(bytes = size, key = %key, backup = %backup.name, "Uploaded file");
        Ok(())
    }

    async fn remove_file(&self, backup: &Backup, path: &Path) -> Result<(), RemoteError> {
        let key = object_key(backup, path)?;
        let response = self
            .request(Method::DELETE, "/api/files")
            .query(&[("backup", backup.container()), ("path", key.as_str())])
            .send()
            .await?;

        check(response.status(), "remove", key, Some(StatusCode::NOT_FOUND))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let store = HttpStore::new("http://backup.local:3000/", "", "agent-01").unwrap();
        assert_eq!(store.url("/api/files"), "http://backup.local:3000/api/files");
    }

    #[test]
    fn test_status_check_tolerates_only_the_given_status() {
        assert!(check(StatusCode::OK, "upload", "a.jpg".into(), None).is_ok());
        assert!(check(StatusCode::NOT_FOUND, "remove", "a.jpg".into(), Some(StatusCode::NOT_FOUND)).is_ok());

        let err = check(StatusCode::NOT_FOUND, "upload", "a.jpg".into(), None).unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 404, .. }));

        let err = check(StatusCode::CONFLICT, "remove", "a.jpg".into(), Some(StatusCode::NOT_FOUND))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_upload_outside_root_fails_before_network() {
        let store = HttpStore::new("http://127.0.0.1:9", "", "agent-01").unwrap();
        let backup = Backup::new("photos", "/data/photos");

        let err = store
            .upload_file(&backup, Path::new("/etc/hosts"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::OutsideRoot(_)));
    }
}
