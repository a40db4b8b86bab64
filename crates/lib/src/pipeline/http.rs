//! HTTP pipeline client: POST the request as JSON, read newline-delimited JSON events back.

use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};

use super::{Event, Pipeline};
use crate::channels::Request;

/// Client for a pipeline served over HTTP (one NDJSON event per line in the response body).
#[derive(Clone)]
pub struct HttpPipeline {
    url: String,
    client: reqwest::Client,
}

impl HttpPipeline {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Pipeline for HttpPipeline {
    fn process(&self, request: Request) -> BoxStream<'static, Event> {
        let client = self.client.clone();
        let url = self.url.clone();
        let events = async move {
            let res = match client.post(&url).json(&request).send().await {
                Ok(res) => res,
                Err(e) => {
                    log::warn!("pipeline: request to {} failed: {}", url, e);
                    return stream::iter(vec![Event::error(format!("pipeline unreachable: {}", e))])
                        .boxed();
                }
            };
            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                log::warn!("pipeline: {} returned {} {}", url, status, body);
                return stream::iter(vec![Event::error(format!("pipeline returned {}", status))])
                    .boxed();
            }
            ndjson_events(Box::pin(res.bytes_stream())).boxed()
        };
        stream::once(events).flatten().boxed()
    }
}

struct NdjsonState<S> {
    inner: S,
    buffer: Vec<u8>,
    ready: VecDeque<Event>,
    finished: bool,
}

impl<S> NdjsonState<S> {
    fn parse_line(&mut self, line_bytes: &[u8]) {
        let line = String::from_utf8_lossy(line_bytes);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => self.ready.push_back(event),
            Err(e) => log::debug!("pipeline: skipping malformed event line ({}): {}", e, line),
        }
    }

    fn drain_lines(&mut self) {
        while let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..i).collect();
            self.buffer.drain(..1);
            self.parse_line(&line);
        }
    }

    fn drain_rest(&mut self) {
        self.drain_lines();
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(&rest);
    }
}

/// Parse a byte stream of newline-delimited JSON into events. A transport error ends the
/// stream with an error event.
pub(crate) fn ndjson_events<S, B, E>(inner: S) -> impl Stream<Item = Event> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = NdjsonState {
        inner,
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.ready.pop_front() {
                return Some((event, st));
            }
            if st.finished {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.extend_from_slice(chunk.as_ref());
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.ready
                        .push_back(Event::error(format!("pipeline stream failed: {}", e)));
                }
                None => {
                    st.finished = true;
                    st.drain_rest();
                }
            }
        }
    })
}
