use std::{
    io,
    path::Path,
    time::{Duration, Instant},
};

use super::{AdapterError, BlobStoreAdapter, ListLimit, ObjectRef};
use crate::{
    measure::MeasuringReader,
    metrics::{MetricError, MetricRecord, Results},
    utils::reader::CrossRuntimeStream,
};
use async_trait::async_trait;
use blocking::unblock;
use futures::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use url::Url;

/// A plain HTTP object endpoint: objects are fetched with `GET {base}/{key}`
/// and stored with `PUT {base}/{key}`.
#[derive(Clone)]
#[non_exhaustive]
pub struct ReqwestAdapter {
    client: reqwest::Client,
    base: Url,
    buffer_size: usize,
    timeout: Option<Duration>,
}

pub trait IntoReqwestAdapter {
    fn into_reqwest_adapter(self, base: Url) -> ReqwestAdapter;
}

impl IntoReqwestAdapter for reqwest::Client {
    fn into_reqwest_adapter(self, mut base: Url) -> ReqwestAdapter {
        // without the trailing slash, joining a key would replace the last segment
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        ReqwestAdapter {
            client: self,
            base,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            timeout: None,
        }
    }
}

/// Normalize a reqwest error into the S3-like codes used across adapters
pub fn classify_reqwest_error(e: &reqwest::Error) -> MetricError {
    let code = if let Some(status) = e.status() {
        match status {
            reqwest::StatusCode::NOT_FOUND => "NoSuchKey".to_string(),
            reqwest::StatusCode::FORBIDDEN | reqwest::StatusCode::UNAUTHORIZED => {
                "AccessDenied".to_string()
            }
            status => status.as_u16().to_string(),
        }
    } else if e.is_timeout() {
        "Timeout".to_string()
    } else if e.is_connect() {
        "ConnectionFailed".to_string()
    } else if e.is_body() || e.is_decode() {
        "BodyError".to_string()
    } else {
        "RequestFailed".to_string()
    };
    MetricError::new(code, e.to_string())
}

fn classify_stream_error(e: &io::Error) -> MetricError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<reqwest::Error>()) {
        Some(inner) => classify_reqwest_error(inner),
        None => MetricError::new(format!("{:?}", e.kind()), e.to_string()),
    }
}

fn is_http_error(e: &io::Error) -> bool {
    e.get_ref()
        .is_some_and(|inner| inner.downcast_ref::<reqwest::Error>().is_some())
}

/// Failures of the request keep their http code, anything else came from the local file
fn classify_upload_error(e: &io::Error) -> MetricError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<reqwest::Error>()) {
        Some(inner) => classify_reqwest_error(inner),
        None => MetricError::new("LocalResource", e.to_string()),
    }
}

impl ReqwestAdapter {
    /// set the scratch buffer size used while streaming
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// set a per request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn object_url(&self, key: &str) -> Result<Url, AdapterError> {
        self.base
            .join(key.trim_start_matches('/'))
            .map_err(|e| AdapterError::Connect {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })
    }

    #[inline]
    fn apply_timeout(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }
}

#[async_trait]
impl BlobStoreAdapter for ReqwestAdapter {
    async fn download(&self, object: &ObjectRef, results: &Results) -> Result<(), AdapterError> {
        log::debug!("reqwest: working on [{}]", object.key);
        let prototype = MetricRecord::prototype(object.index, &object.key);
        let start = Instant::now();

        let url = match self.object_url(&object.key) {
            Ok(url) => url,
            Err(e) => {
                results.push(prototype.failed_before_stream(MetricError::new(
                    "InvalidKey",
                    e.to_string(),
                )));
                return Err(e);
            }
        };
        let response = match self
            .apply_timeout(self.client.get(url))
            .send()
            .await
            .and_then(|res| res.error_for_status())
        {
            Ok(response) => response,
            Err(e) => {
                results.push(prototype.failed_before_stream(classify_reqwest_error(&e)));
                return Err(e.into());
            }
        };

        let body = Box::pin(response.bytes_stream().map_err(io::Error::other)).into_async_read();
        MeasuringReader::new(
            prototype,
            object.buffer_size_or(self.buffer_size),
            results,
            start,
            classify_stream_error,
        )
        .read_from(body)
        .await
        .map_err(|source| AdapterError::Stream {
            key: object.key.clone(),
            source,
        })?;
        Ok(())
    }

    async fn upload(
        &self,
        object: &ObjectRef,
        source: &Path,
        results: &Results,
    ) -> Result<(), AdapterError> {
        log::debug!(
            "reqwest: working on [{}] -> [{}]",
            source.display(),
            object.key
        );
        let prototype = MetricRecord::prototype(object.index, &object.key);
        let start = Instant::now();

        let path = source.to_path_buf();
        let opened = unblock(move || {
            let file = std::fs::File::open(&path)?;
            let len = file.metadata()?.len();
            Ok::<_, io::Error>((file, len))
        })
        .await;
        let (file, len) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                results.push(
                    prototype.failed_before_stream(MetricError::new("LocalResource", e.to_string())),
                );
                return Err(AdapterError::LocalResource {
                    path: source.to_path_buf(),
                    source: e,
                });
            }
        };

        let url = match self.object_url(&object.key) {
            Ok(url) => url,
            Err(e) => {
                results.push(prototype.failed_before_stream(MetricError::new(
                    "InvalidKey",
                    e.to_string(),
                )));
                return Err(e);
            }
        };

        let stream = CrossRuntimeStream::new(file, object.buffer_size_or(self.buffer_size));
        let progress = stream.progress();
        let outcome = self
            .apply_timeout(
                self.client
                    .put(url)
                    .header(CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(stream)),
            )
            .send()
            .await
            .and_then(|res| res.error_for_status());

        let sent = progress.bytes();
        let read_error = progress.take_read_error();
        let outcome = match (outcome, read_error) {
            (Ok(_), _) => Ok(()),
            // the body failed because the local file did
            (Err(_), Some(local)) => Err(local),
            (Err(e), None) if sent == 0 => {
                results.push(prototype.failed_before_stream(classify_reqwest_error(&e)));
                return Err(e.into());
            }
            (Err(e), None) => Err(io::Error::other(e)),
        };

        let measured = MeasuringReader::new(
            prototype,
            object.buffer_size_or(self.buffer_size),
            results,
            start,
            classify_upload_error,
        )
        .record(sent, progress.first_chunk(), outcome);
        match measured {
            Ok(_) => Ok(()),
            Err(e) if is_http_error(&e) => Err(AdapterError::Stream {
                key: object.key.clone(),
                source: e,
            }),
            Err(e) => Err(AdapterError::LocalResource {
                path: source.to_path_buf(),
                source: e,
            }),
        }
    }

    async fn list_objects(
        &self,
        _prefix: &str,
        _limit: ListLimit,
    ) -> Result<Vec<String>, AdapterError> {
        Err(AdapterError::Unsupported("listing objects over plain http"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        extract::{Path as AxumPath, State},
        http::StatusCode,
        routing::get,
        Router,
    };
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashMap,
        io::Write,
        sync::{Arc, Mutex},
    };
    use test_log::test;

    const OBJECT_SIZE: usize = 1040384;

    type Store = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    async fn get_object(
        State(store): State<Store>,
        AxumPath(key): AxumPath<String>,
    ) -> Result<Vec<u8>, StatusCode> {
        if key.starts_with("forbidden/") {
            return Err(StatusCode::FORBIDDEN);
        }
        store
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(StatusCode::NOT_FOUND)
    }

    async fn put_object(
        State(store): State<Store>,
        AxumPath(key): AxumPath<String>,
        body: Bytes,
    ) -> StatusCode {
        if key.starts_with("forbidden/") {
            return StatusCode::FORBIDDEN;
        }
        store.lock().unwrap().insert(key, body.to_vec());
        StatusCode::OK
    }

    /// Serve an in-memory bucket under `/bucket/`, preloaded with `object-0000`.
    async fn create_http_server() -> anyhow::Result<(u16, tokio::task::JoinHandle<()>, Store)> {
        let port = portpicker::pick_unused_port().ok_or(anyhow::anyhow!("no free port"))?;
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        store
            .lock()
            .unwrap()
            .insert("object-0000".to_string(), vec![5u8; OBJECT_SIZE]);
        let app = Router::new()
            .route("/bucket/*key", get(get_object).put(put_object))
            .with_state(store.clone());
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Ok((port, handle, store))
    }

    fn adapter(port: u16) -> ReqwestAdapter {
        let base = Url::parse(&format!("http://127.0.0.1:{}/bucket", port)).unwrap();
        reqwest::Client::new()
            .into_reqwest_adapter(base)
            .buffer_size(4096)
    }

    #[test]
    fn test_base_gets_trailing_slash() {
        let base = Url::parse("http://localhost/bucket").unwrap();
        let adapter = reqwest::Client::new().into_reqwest_adapter(base);
        assert_eq!(
            adapter.object_url("dir/object").unwrap().as_str(),
            "http://localhost/bucket/dir/object"
        );
    }

    #[test(tokio::test)]
    async fn test_download() {
        let (port, _, _) = create_http_server().await.unwrap();
        let results = Results::new();
        adapter(port)
            .download(&ObjectRef::new(0, "object-0000"), &results)
            .await
            .unwrap();
        let record = &results.items()[0];
        assert!(record.success);
        assert_eq!(record.size, OBJECT_SIZE as i64);
        assert!(record.first_byte.is_some());
        assert!(record.first_byte <= record.total);
    }

    #[test(tokio::test)]
    async fn test_download_not_found() {
        let (port, _, _) = create_http_server().await.unwrap();
        let results = Results::new();
        let err = adapter(port)
            .download(&ObjectRef::new(1, "missing"), &results)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Http(_)));
        let record = &results.items()[0];
        assert_eq!(record.size, MetricRecord::UNKNOWN_SIZE);
        assert_eq!(record.error.as_ref().unwrap().code, "NoSuchKey");
    }

    #[test(tokio::test)]
    async fn test_download_forbidden() {
        let (port, _, _) = create_http_server().await.unwrap();
        let results = Results::new();
        let _ = adapter(port)
            .download(&ObjectRef::new(1, "forbidden/x"), &results)
            .await;
        assert_eq!(
            results.items()[0].error.as_ref().unwrap().code,
            "AccessDenied"
        );
    }

    #[test(tokio::test)]
    async fn test_download_connection_refused() {
        let port = portpicker::pick_unused_port().unwrap();
        let results = Results::new();
        let err = adapter(port)
            .download(&ObjectRef::new(0, "object-0000"), &results)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Http(_)));
        assert_eq!(
            results.items()[0].error.as_ref().unwrap().code,
            "ConnectionFailed"
        );
    }

    #[test(tokio::test)]
    async fn test_upload() {
        let (port, _, store) = create_http_server().await.unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![3u8; 100_000]).unwrap();
        let results = Results::new();
        adapter(port)
            .upload(&ObjectRef::new(0, "up/one"), file.path(), &results)
            .await
            .unwrap();
        let record = &results.items()[0];
        assert!(record.success);
        assert_eq!(record.size, 100_000);
        assert!(record.first_byte.is_some());
        assert!(record.first_byte <= record.total);
        assert_eq!(store.lock().unwrap().get("up/one").unwrap().len(), 100_000);
    }

    #[test(tokio::test)]
    async fn test_rejected_upload_keeps_sent_bytes() {
        let (port, _, store) = create_http_server().await.unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![3u8; 100_000]).unwrap();
        let results = Results::new();
        let err = adapter(port)
            .upload(&ObjectRef::new(4, "forbidden/one"), file.path(), &results)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Stream { .. }));

        let record = &results.items()[0];
        assert_eq!(record.index, 4);
        assert!(!record.success);
        // the server read the whole body before refusing it
        assert_eq!(record.size, 100_000);
        assert!(record.first_byte.is_some());
        assert_eq!(record.total, None);
        assert_eq!(record.error.as_ref().unwrap().code, "AccessDenied");
        assert!(store.lock().unwrap().get("forbidden/one").is_none());
    }

    #[test(tokio::test)]
    async fn test_upload_local_read_failure() {
        let (port, _, _) = create_http_server().await.unwrap();
        // a directory opens like a file but fails on the first read,
        // the entry gives it a non zero length to announce
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("entry"), b"x").unwrap();
        let results = Results::new();
        let err = adapter(port)
            .upload(&ObjectRef::new(0, "up/dir"), dir.path(), &results)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::LocalResource { .. }));

        assert_eq!(results.len(), 1);
        let record = &results.items()[0];
        assert!(!record.success);
        assert_eq!(record.size, 0);
        assert_eq!(record.error.as_ref().unwrap().code, "LocalResource");
    }

    #[test(tokio::test)]
    async fn test_upload_missing_local_file() {
        let (port, _, _) = create_http_server().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let results = Results::new();
        let err = adapter(port)
            .upload(&ObjectRef::new(0, "up/x"), &dir.path().join("nope"), &results)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::LocalResource { .. }));
        assert_eq!(results.len(), 1);
        assert!(!results.items()[0].success);
        assert_eq!(results.items()[0].size, MetricRecord::UNKNOWN_SIZE);
    }

    #[test(tokio::test)]
    async fn test_list_objects_unsupported() {
        let (port, _, _) = create_http_server().await.unwrap();
        let res = adapter(port).list_objects("", ListLimit::Unlimited).await;
        assert!(matches!(res, Err(AdapterError::Unsupported(_))));
    }
}
