//! Google Cloud Storage backend.
//!
//! Talks to the GCS JSON API directly. Object generations are the version
//! tokens:
//! - create uses `ifGenerationMatch=0` (only if absent)
//! - replace and delete use `ifGenerationMatch=<generation>`
//! - a failed precondition comes back as HTTP 412
//! - an upload answered with 404 means the bucket itself is missing
//!
//! The record timestamp is the object's `updated` field, assigned by the
//! server, so heartbeat freshness does not depend on the writer's clock.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, Url};
use secrecy::SecretString;
use serde::Deserialize;

use super::{ObjectMeta, StorageBackend};
use crate::error::{Error, Result};
use crate::gcp::{MetadataClient, bearer};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// How requests to the storage API are authorized.
pub enum GcsAuth {
    /// No `Authorization` header (local emulators).
    Anonymous,
    /// A fixed bearer token.
    Static(SecretString),
    /// Access tokens from the GCE metadata server.
    Metadata(Arc<MetadataClient>),
}

/// Options for [`GcsBackend::new`].
#[derive(Default)]
pub struct GcsOptions {
    /// Base URL of the API, e.g. a fake-gcs-server instance.
    pub endpoint: Option<String>,
    /// Static bearer token; when absent the metadata server is used, unless
    /// the endpoint is plain `http://`.
    pub token: Option<SecretString>,
}

pub struct GcsBackend {
    http: reqwest::Client,
    endpoint: Url,
    bucket: String,
    auth: GcsAuth,
}

/// How a conditional upload ended, short of a transport error.
enum Upload {
    Written(ObjectResource),
    PreconditionFailed,
    BucketMissing,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    generation: String,
    updated: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

impl ObjectResource {
    fn into_meta(self) -> Result<ObjectMeta> {
        let updated = DateTime::parse_from_rfc3339(&self.updated)
            .map_err(|e| Error::Storage(format!("bad updated time on {}: {e}", self.name)))?
            .with_timezone(&Utc);
        Ok(ObjectMeta {
            path: self.name,
            version: self.generation,
            updated,
        })
    }
}

impl GcsBackend {
    pub fn new(bucket: impl Into<String>, options: GcsOptions) -> Result<Self> {
        let http = reqwest::Client::new();
        let endpoint_str = options
            .endpoint
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let endpoint = Url::parse(&endpoint_str)
            .map_err(|e| Error::Config(format!("invalid GCS endpoint {endpoint_str:?}: {e}")))?;
        let auth = match options.token {
            Some(token) => GcsAuth::Static(token),
            None if endpoint.scheme() == "http" => GcsAuth::Anonymous,
            None => GcsAuth::Metadata(Arc::new(MetadataClient::new(http.clone()))),
        };
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(Error::Config("GCS bucket name is empty".into()));
        }
        Ok(Self {
            http,
            endpoint,
            bucket,
            auth,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `{endpoint}/storage/v1/b/{bucket}/o[/{object}]`
    fn object_url(&self, object: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::Config(format!("endpoint {} cannot be a base", self.endpoint))
            })?;
            segments.pop_if_empty();
            segments.extend(["storage", "v1", "b", self.bucket.as_str(), "o"]);
            if let Some(object) = object {
                // `push` percent-encodes '/' so nested names stay one segment.
                segments.push(object);
            }
        }
        Ok(url)
    }

    fn upload_url(&self, name: &str, if_generation_match: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::Config(format!("endpoint {} cannot be a base", self.endpoint))
            })?;
            segments.pop_if_empty();
            segments.extend(["upload", "storage", "v1", "b", self.bucket.as_str(), "o"]);
        }
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name)
            .append_pair("ifGenerationMatch", if_generation_match);
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url) -> Result<reqwest::RequestBuilder> {
        let builder = self.http.request(method, url);
        Ok(match &self.auth {
            GcsAuth::Anonymous => builder,
            GcsAuth::Static(token) => builder.header("Authorization", bearer(token)),
            GcsAuth::Metadata(client) => {
                let token = client.access_token().await?;
                builder.header("Authorization", bearer(&token))
            }
        })
    }

    /// Media upload under a generation precondition.
    async fn upload(&self, path: &str, if_generation_match: &str, data: Bytes) -> Result<Upload> {
        let url = self.upload_url(path, if_generation_match)?;
        let response = self
            .request(Method::POST, url)
            .await?
            .header("Content-Type", "application/json")
            .body(data)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(Upload::Written(response.json().await?)),
            StatusCode::PRECONDITION_FAILED => Ok(Upload::PreconditionFailed),
            StatusCode::NOT_FOUND => Ok(Upload::BucketMissing),
            status => Err(unexpected(status, path, response).await),
        }
    }

    fn bucket_missing(&self, path: &str) -> Error {
        Error::Storage(format!("GCS bucket {} not found writing {path}", self.bucket))
    }
}

async fn unexpected(status: StatusCode, path: &str, response: reqwest::Response) -> Error {
    let body = response.text().await.unwrap_or_default();
    Error::Storage(format!("GCS request for {path} failed ({status}): {body}"))
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn create_if_absent(&self, path: &str, data: Bytes) -> Result<String> {
        match self.upload(path, "0", data).await? {
            Upload::Written(object) => Ok(object.generation),
            Upload::PreconditionFailed => Err(Error::AlreadyExists(path.to_string())),
            Upload::BucketMissing => Err(self.bucket_missing(path)),
        }
    }

    async fn conditional_replace(
        &self,
        path: &str,
        expected_version: &str,
        data: Bytes,
    ) -> Result<String> {
        match self.upload(path, expected_version, data).await? {
            Upload::Written(object) => Ok(object.generation),
            Upload::PreconditionFailed => Err(Error::VersionMismatch {
                path: path.to_string(),
                expected: expected_version.to_string(),
            }),
            Upload::BucketMissing => Err(Error::NotFound(path.to_string())),
        }
    }

    async fn conditional_delete(&self, path: &str, expected_version: &str) -> Result<()> {
        let mut url = self.object_url(Some(path))?;
        url.query_pairs_mut()
            .append_pair("ifGenerationMatch", expected_version);
        let response = self.request(Method::DELETE, url).await?.send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(path.to_string())),
            StatusCode::PRECONDITION_FAILED => Err(Error::VersionMismatch {
                path: path.to_string(),
                expected: expected_version.to_string(),
            }),
            status => Err(unexpected(status, path, response).await),
        }
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let url = self.object_url(Some(path))?;
        let response = self.request(Method::GET, url).await?.send().await?;
        match response.status() {
            s if s.is_success() => {
                let object: ObjectResource = response.json().await?;
                object.into_meta().map(Some)
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected(status, path, response).await),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.object_url(None)?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("prefix", prefix)
                    .append_pair("fields", "items(name,generation,updated),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self.request(Method::GET, url).await?.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(unexpected(status, prefix, response).await);
            }
            let page: ListResponse = response.json().await?;
            for object in page.items {
                out.push(object.into_meta()?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(endpoint: &str) -> GcsBackend {
        GcsBackend::new(
            "wq-bucket",
            GcsOptions {
                endpoint: Some(endpoint.to_string()),
                token: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn object_names_are_single_encoded_segments() {
        let gcs = backend("http://localhost:4443");
        let url = gcs.object_url(Some("in-progress/a b")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:4443/storage/v1/b/wq-bucket/o/in-progress%2Fa%20b"
        );
    }

    #[test]
    fn upload_url_carries_generation_precondition() {
        let gcs = backend("http://localhost:4443/");
        let url = gcs.upload_url("queued/k", "0").unwrap();
        assert_eq!(url.path(), "/upload/storage/v1/b/wq-bucket/o");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("name".into(), "queued/k".into())));
        assert!(pairs.contains(&("ifGenerationMatch".into(), "0".into())));
    }

    #[test]
    fn plain_http_endpoints_skip_auth() {
        let gcs = backend("http://localhost:4443");
        assert!(matches!(gcs.auth, GcsAuth::Anonymous));

        let gcs = backend("https://storage.example.com");
        assert!(matches!(gcs.auth, GcsAuth::Metadata(_)));
    }

    #[test]
    fn empty_bucket_is_a_config_error() {
        let err = GcsBackend::new("", GcsOptions::default()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    /// Serves 404 for every request, like the API does for a missing bucket.
    async fn missing_bucket_endpoint() -> String {
        let app = axum::Router::new().fallback(|| async { StatusCode::NOT_FOUND });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn missing_bucket_is_a_storage_error_not_a_race() {
        let gcs = backend(&missing_bucket_endpoint().await);

        let err = gcs
            .create_if_absent("queued/a", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "got {err}");
        assert!(!err.is_race_loss());

        let err = gcs
            .conditional_replace("in-progress/a", "7", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err}");
    }

    #[tokio::test]
    async fn queue_against_missing_bucket_fails() {
        let gcs = backend(&missing_bucket_endpoint().await);
        let store = crate::keystore::KeyStore::new(Arc::new(gcs));

        let err = store.queue("a").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "got {err}");
    }

    #[test]
    fn object_resource_parses_updated() {
        let object = ObjectResource {
            name: "in-progress/a".into(),
            generation: "1712345678901234".into(),
            updated: "2024-04-05T12:00:00.123Z".into(),
        };
        let meta = object.into_meta().unwrap();
        assert_eq!(meta.version, "1712345678901234");
        assert_eq!(meta.updated.timestamp(), 1712318400);
    }
}
