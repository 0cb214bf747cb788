//! Object store speaking plain HTTP PUT/HEAD against a bucket proxy that
//! accepts bearer-authenticated writes. Raw S3/R2 endpoints need SigV4
//! signing and are not supported directly.

use common::Secret;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{BoxFuture, ObjectStore};

/// Writes to `{endpoint}/{key}` and serves from `{public_base}/{key}`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    public_base: String,
    token: Option<Secret<String>>,
}

impl HttpObjectStore {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        public_base: impl Into<String>,
        token: Option<Secret<String>>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose()),
            None => request,
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let size = bytes.len();
            let request = self
                .client
                .put(self.object_url(key))
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes);
            let response = self
                .authorize(request)
                .send()
                .await
                .map_err(|e| Error::Storage(format!("upload {key}: {}", e.without_url())))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Storage(format!("upload {key}: status {status}")));
            }
            debug!(key, size, "uploaded object");
            Ok(self.public_url(key))
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let request = self.client.head(self.object_url(key));
            let response = self
                .authorize(request)
                .send()
                .await
                .map_err(|e| Error::Storage(format!("head {key}: {}", e.without_url())))?;

            match response.status() {
                status if status.is_success() => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                status => Err(Error::Storage(format!("head {key}: status {status}"))),
            }
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }
}
