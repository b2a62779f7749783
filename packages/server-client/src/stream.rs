//! NDJSON event stream adapter
//!
//! The status stream endpoint emits one JSON object per line. This adapter
//! turns the raw byte stream into parsed [`StreamEvent`]s, yielding a
//! `ClientError::Parse` item (rather than ending the stream) for a malformed
//! line so the consumer can discard it and keep reading.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tracing::warn;

use crate::error::{ClientError, ClientResult};
use crate::models::StreamEvent;

/// A boxed stream of job status events
pub type EventStream = Pin<Box<dyn Stream<Item = ClientResult<StreamEvent>> + Send>>;

/// Line-splitting adapter over a byte stream
pub(crate) struct EventLines<S> {
    source: S,
    buf: String,
    source_done: bool,
}

impl<S> EventLines<S> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            buf: String::new(),
            source_done: false,
        }
    }

    /// Pop the next complete non-empty line off the buffer
    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        None
    }
}

fn parse_line(line: &str) -> ClientResult<StreamEvent> {
    serde_json::from_str(line).map_err(ClientError::from)
}

impl<S> Stream for EventLines<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = ClientResult<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(line) = this.take_line() {
                return Poll::Ready(Some(parse_line(&line)));
            }

            if this.source_done {
                // Flush a trailing line the server sent without a newline
                let rest = std::mem::take(&mut this.buf);
                let rest = rest.trim();
                if rest.is_empty() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(parse_line(rest)));
            }

            match Pin::new(&mut this.source).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => match std::str::from_utf8(&chunk) {
                    Ok(text) => this.buf.push_str(text),
                    Err(e) => {
                        warn!(error = %e, bytes = chunk.len(), "invalid UTF-8 in event stream");
                        this.buf.push_str(&String::from_utf8_lossy(&chunk));
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    this.source_done = true;
                    return Poll::Ready(Some(Err(ClientError::Http(e))));
                }
                Poll::Ready(None) => {
                    this.source_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
