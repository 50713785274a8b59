//! Stream framing (bytes -> frame payload strings)
//!
//! Decodes formats, not vendors: SSE `data:` payloads (multi-line data joined, comments
//! and `event:` lines ignored, `[DONE]` ends the stream) or newline-delimited JSON.

use crate::transport::TransportError;
use crate::{BoxStream, Error};
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use std::io;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Longest single line accepted from a provider stream.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Sse,
    Ndjson,
}

/// Split a response body into frame payloads.
pub fn frames(body: BoxStream<'static, Bytes>, framing: Framing) -> BoxStream<'static, String> {
    let reader = StreamReader::new(body.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())));
    let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let state = (lines, Vec::<String>::new(), false);
    let out = stream::unfold(state, move |(mut lines, mut data, finished)| async move {
        if finished {
            return None;
        }
        loop {
            match lines.next().await {
                Some(Ok(line)) => match framing {
                    Framing::Ndjson => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            return Some((Ok(trimmed.to_string()), (lines, data, false)));
                        }
                    }
                    Framing::Sse => {
                        if line.is_empty() {
                            if data.is_empty() {
                                continue;
                            }
                            let frame = data.join("\n");
                            data.clear();
                            if frame.trim() == "[DONE]" {
                                return None;
                            }
                            return Some((Ok(frame), (lines, data, false)));
                        }
                        if line.starts_with(':') {
                            continue;
                        }
                        if let Some(rest) = line.strip_prefix("data:") {
                            data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                        }
                    }
                },
                Some(Err(e)) => {
                    let err = Error::Transport(TransportError::Other(format!("stream framing: {}", e)));
                    return Some((Err(err), (lines, data, true)));
                }
                None => {
                    // Body ended without a trailing blank line.
                    if data.is_empty() {
                        return None;
                    }
                    let frame = data.join("\n");
                    data.clear();
                    if frame.trim() == "[DONE]" {
                        return None;
                    }
                    return Some((Ok(frame), (lines, data, true)));
                }
            }
        }
    });
    Box::pin(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&'static str]) -> BoxStream<'static, Bytes> {
        let items: Vec<crate::Result<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_sse_frames_split_across_chunks() {
        let input = body(&[
            ": keep-alive\n\nevent: message\nda",
            "ta: {\"a\":1}\n\ndata: {\"b\":\r\n",
            "data: 2}\n\ndata: [DONE]\n\ndata: {\"ignored\":true}\n\n",
        ]);
        let frames: Vec<String> = frames(input, Framing::Sse).try_collect().await.unwrap();
        assert_eq!(frames, vec!["{\"a\":1}".to_string(), "{\"b\":\n2}".to_string()]);
    }

    #[tokio::test]
    async fn test_sse_final_frame_without_blank_line() {
        let input = body(&["data: {\"x\":1}"]);
        let frames: Vec<String> = frames(input, Framing::Sse).try_collect().await.unwrap();
        assert_eq!(frames, vec!["{\"x\":1}".to_string()]);
    }

    #[test]
    fn test_frame_released_before_body_ends() {
        let (tx, rx) = tokio::sync::mpsc::channel::<crate::Result<Bytes>>(4);
        let body: BoxStream<'static, Bytes> = Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx));
        let mut decoded = tokio_test::task::spawn(frames(body, Framing::Sse));

        tokio_test::assert_pending!(decoded.poll_next());
        tx.try_send(Ok(Bytes::from_static(b"data: {\"a\":1}\n\n"))).unwrap();
        assert!(decoded.is_woken());
        let first = tokio_test::assert_ready!(decoded.poll_next());
        assert_eq!(first.unwrap().unwrap(), "{\"a\":1}");

        // Nothing more until the provider sends it.
        tokio_test::assert_pending!(decoded.poll_next());
        drop(tx);
        assert!(tokio_test::assert_ready!(decoded.poll_next()).is_none());
    }

    #[tokio::test]
    async fn test_ndjson() {
        let input = body(&["{\"a\":1}\n\n{\"b\"", ":2}\n"]);
        let frames: Vec<String> = frames(input, Framing::Ndjson).try_collect().await.unwrap();
        assert_eq!(frames, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }
}
