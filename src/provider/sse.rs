//! Server-sent event decoding for streamed completions.

use super::{ProviderError, TokenSink};
use futures_util::{pin_mut, stream::StreamExt};
use tokio_util::sync::CancellationToken;

/// Splits a byte stream into the payloads of its `data:` lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters split across network
/// chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk and return every complete `data:` payload it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    line.strip_prefix("data:")
        .map(|payload| payload.trim_start().to_string())
}

/// Outcome of interpreting one event payload.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamStep {
    Token(String),
    Skip,
    Done,
}

/// Forward tokens from an open SSE response into `sink`.
///
/// Returns early without error when `cancel` fires or the receiver goes away; no further
/// tokens are sent after either.
pub(crate) async fn pump_events<F>(
    response: reqwest::Response,
    sink: &TokenSink,
    cancel: &CancellationToken,
    mut interpret: F,
) -> Result<(), ProviderError>
where
    F: FnMut(&str) -> Result<StreamStep, ProviderError> + Send,
{
    let body = response.bytes_stream();
    pin_mut!(body);
    let mut decoder = SseDecoder::default();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("Completion stream cancelled");
                return Ok(());
            }
            next = body.next() => next,
        };

        let (payloads, exhausted) = match next {
            Some(chunk) => (decoder.push(&chunk?), false),
            None => (decoder.finish().into_iter().collect(), true),
        };
        if forward(&payloads, &mut interpret, sink, cancel).await? || exhausted {
            return Ok(());
        }
    }
}

/// Send the tokens found in `payloads`. Returns `true` once the stream should stop.
async fn forward<F>(
    payloads: &[String],
    interpret: &mut F,
    sink: &TokenSink,
    cancel: &CancellationToken,
) -> Result<bool, ProviderError>
where
    F: FnMut(&str) -> Result<StreamStep, ProviderError>,
{
    for payload in payloads {
        match interpret(payload)? {
            StreamStep::Token(token) => {
                let sent = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(true),
                    sent = sink.send(token) => sent,
                };
                if sent.is_err() {
                    tracing::debug!("Token receiver dropped, stopping stream");
                    return Ok(true);
                }
            }
            StreamStep::Skip => {}
            StreamStep::Done => return Ok(true),
        }
    }
    Ok(false)
}
