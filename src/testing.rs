//! In-process fakes of the external collaborators, for tests and local runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::fetch::{FetchError, HttpFetcher};
use crate::recorder::{MediaRecorder, RecordOutput, RecordRequest, RecorderError};

/// Scripted response of [`FakeFetcher`] for one URL
#[derive(Debug, Clone)]
pub enum FakeResponse {
    Body(Bytes),
    /// HTTP error status
    Status(u16),
    /// Writes the bytes, then fails mid-stream
    Truncated(Bytes),
}

/// Serves scripted responses keyed by URL; unknown URLs answer 404
#[derive(Debug, Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, FakeResponse>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: impl Into<String>, response: FakeResponse) -> &Self {
        self.responses.lock().insert(url.into(), response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> FakeResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .get(url)
            .cloned()
            .unwrap_or(FakeResponse::Status(404))
    }
}

#[async_trait]
impl HttpFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        match self.lookup(url) {
            FakeResponse::Body(body) => Ok(body),
            FakeResponse::Status(status) => Err(FetchError::Status {
                status,
                url: url.to_string(),
            }),
            FakeResponse::Truncated(_) => Err(FetchError::RequestFailed("connection reset".into())),
        }
    }

    async fn download_to(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, FetchError> {
        match self.lookup(url) {
            FakeResponse::Body(body) => {
                sink.write_all(&body).await?;
                sink.flush().await?;
                Ok(body.len() as u64)
            }
            FakeResponse::Status(status) => Err(FetchError::Status {
                status,
                url: url.to_string(),
            }),
            FakeResponse::Truncated(partial) => {
                sink.write_all(&partial).await?;
                sink.flush().await?;
                Err(FetchError::RequestFailed("connection reset".into()))
            }
        }
    }
}

/// Outcome [`FakeRecorder`] produces for every request
#[derive(Debug, Clone)]
pub enum FakeRecording {
    /// Writes the bytes to the output path and exits cleanly
    Capture(Bytes),
    /// Exits with the given code without writing anything
    Exit(i32),
    /// Waits for cancellation, then writes the bytes and exits cleanly
    UntilCancelled(Bytes),
}

#[derive(Debug)]
pub struct FakeRecorder {
    outcome: FakeRecording,
    requests: Mutex<Vec<RecordRequest>>,
}

impl FakeRecorder {
    pub fn new(outcome: FakeRecording) -> Self {
        Self {
            outcome,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaRecorder for FakeRecorder {
    async fn record(
        &self,
        request: &RecordRequest,
        cancel: CancellationToken,
    ) -> Result<RecordOutput, RecorderError> {
        self.requests.lock().push(request.clone());

        let body = match &self.outcome {
            FakeRecording::Capture(body) => body.clone(),
            FakeRecording::Exit(code) => {
                return Err(RecorderError::ExitStatus {
                    code: Some(*code),
                    stderr: "Connection refused".to_string(),
                });
            }
            FakeRecording::UntilCancelled(body) => {
                cancel.cancelled().await;
                body.clone()
            }
        };

        tokio::fs::write(&request.output_path, &body).await?;
        Ok(RecordOutput {
            output_path: request.output_path.clone(),
            size: body.len() as u64,
            duration_secs: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fake_fetcher_truncates_download() {
        let fetcher = FakeFetcher::new();
        fetcher.respond("http://media/a.mp3", FakeResponse::Truncated(Bytes::from_static(b"abc")));

        let mut sink = Vec::new();
        let err = fetcher
            .download_to("http://media/a.mp3", &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RequestFailed(_)));
        assert_eq!(sink, b"abc");
        assert!(fetcher.fetch("http://media/missing").await.is_err());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_fake_recorder_writes_output() {
        let dir = TempDir::new().unwrap();
        let recorder = FakeRecorder::new(FakeRecording::Capture(Bytes::from_static(b"ts-data")));
        let request = RecordRequest {
            stream_url: "http://live/stream".to_string(),
            output_path: dir.path().join("out.ts"),
            max_duration: Duration::from_secs(60),
        };

        let output = recorder
            .record(&request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.size, 7);
        assert_eq!(std::fs::read(dir.path().join("out.ts")).unwrap(), b"ts-data");
        assert_eq!(recorder.requests().len(), 1);
    }
}
