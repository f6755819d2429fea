//! Object storage over plain HTTP.
//!
//! Contract: `PUT {base}/{destination}?quality=q` with the raw bytes answers
//! `{"url": "..."}`; objects are then fetched and deleted at that URL.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::{Result, TransferError};
use crate::ports::{BlobStore, DeleteManyOutcome, PutOptions};

#[derive(Debug, Deserialize)]
struct PutResponse {
    url: String,
}

/// HTTP-backed blob store with connection pooling.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        url::Url::parse(&base_url).map_err(|e| {
            TransferError::Config(format!("invalid blob base url {base_url}: {e}"))
        })?;
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                TransferError::Config(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, destination: &str) -> String {
        format!("{}/{}", self.base_url, destination.trim_start_matches('/'))
    }
}

fn map_request_error(e: reqwest::Error) -> TransferError {
    if e.is_decode() {
        TransferError::Service(format!("malformed response: {e}"))
    } else {
        TransferError::Network(e.to_string())
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(TransferError::NotFound(url.to_string()))
    } else {
        Err(TransferError::Service(format!("HTTP {status}: {url}")))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, data: Bytes, options: &PutOptions) -> Result<String> {
        let url = self.object_url(&options.destination);
        let mut request = self
            .client
            .put(&url)
            .query(&[("quality", format!("{:.2}", options.quality))])
            .body(data);
        if let Some(content_type) = &options.content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        let response = request.send().await.map_err(map_request_error)?;
        check_status(response.status(), &url)?;
        let body: PutResponse =
            response.json().await.map_err(map_request_error)?;
        Ok(body.url)
    }

    async fn get(&self, url: &str) -> Result<Bytes> {
        let response =
            self.client.get(url).send().await.map_err(map_request_error)?;
        check_status(response.status(), url)?;
        response.bytes().await.map_err(map_request_error)
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(map_request_error)?;
        match check_status(response.status(), url) {
            Ok(()) => Ok(true),
            Err(TransferError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_many(&self, urls: &[String]) -> Result<DeleteManyOutcome> {
        let mut deleted_count = 0;
        for url in urls {
            if self.delete(url).await? {
                deleted_count += 1;
            }
        }
        Ok(DeleteManyOutcome { deleted_count })
    }
}
