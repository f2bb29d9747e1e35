//! Streaming relay of upstream responses.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use poem::Body;
use poem::Response;
use tokio::runtime::Handle;

use super::headers;
use crate::arbiter::Arbiter;

/// Size of the pieces written back to the caller.
pub const RELAY_CHUNK_SIZE: usize = 4096;

/// Stamps inference activity on the arbiter once the request is done with the
/// GPU, either explicitly through [`ActivityRecorder::finish`] or when dropped.
pub struct ActivityRecorder {
    arbiter: Option<Arc<Arbiter>>,
}

impl ActivityRecorder {
    pub fn new(arbiter: Arc<Arbiter>) -> Self {
        Self {
            arbiter: Some(arbiter),
        }
    }

    pub async fn finish(mut self) {
        if let Some(arbiter) = self.arbiter.take() {
            arbiter.record_activity().await;
        }
    }
}

impl Drop for ActivityRecorder {
    fn drop(&mut self) {
        let Some(arbiter) = self.arbiter.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { arbiter.record_activity().await });
            }
            Err(_) => tracing::warn!("No runtime available, inference activity not recorded"),
        }
    }
}

struct Relay {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    pending: Bytes,
    finished: bool,
    path: String,
    _activity: Option<ActivityRecorder>,
}

impl Relay {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        loop {
            if !self.pending.is_empty() {
                let len = self.pending.len().min(RELAY_CHUNK_SIZE);
                return Some(self.pending.split_to(len));
            }
            match self.upstream.next().await {
                Some(Ok(bytes)) => self.pending = bytes,
                Some(Err(e)) => {
                    tracing::error!(path = %self.path, "Upstream stream failed mid-response: {e}");
                    self.finished = true;
                    return Some(Bytes::from(format!(
                        "\n\n[proxy error] upstream request failed: {e}\n"
                    )));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(path = %self.path, "Client disconnected before the response completed");
        }
    }
}

/// Turn an upstream response into a streamed response for the caller.
pub fn into_response(
    upstream: reqwest::Response,
    path: String,
    activity: Option<ActivityRecorder>,
) -> Response {
    let status = upstream.status();
    let headers = headers::inbound(upstream.headers());
    let relay = Relay {
        upstream: upstream.bytes_stream().boxed(),
        pending: Bytes::new(),
        finished: false,
        path,
        _activity: activity,
    };

    let stream = futures::stream::unfold(relay, |mut relay| async move {
        let chunk = relay.next_chunk().await?;
        Some((Ok::<_, io::Error>(chunk), relay))
    });

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_bytes_stream(stream));
    *response.headers_mut() = headers;
    response
}
