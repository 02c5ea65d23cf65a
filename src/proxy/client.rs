// Ingest client - streams queued events to the sidecar
//
// A batch is shipped as one chunked POST of newline-delimited JSON. The body
// is produced by a background task feeding a channel, so large batches never
// materialize in memory. serde_json leaves `&`, `<` and `>` untouched, which
// the wire format requires.

use crate::events::RawEvent;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// How long one flush may take, connect to drained response.
const STREAM_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IngestClient {
    endpoint: String,
    client: reqwest::Client,
}

impl IngestClient {
    pub fn new(sidecar_url: &str) -> Result<Self> {
        if sidecar_url.trim().is_empty() {
            bail!("sidecar URL is empty");
        }
        let endpoint = format!("{}/ingest", sidecar_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .build()
            .context("build ingest client")?;
        Ok(Self { endpoint, client })
    }

    /// Stream a batch to `/ingest`. Success is exactly a 202; anything else
    /// (transport error included) leaves the queue unadvanced so the caller
    /// retries the whole batch.
    pub async fn stream_events(&self, events: Vec<RawEvent>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);

        tokio::spawn(async move {
            for event in events {
                let line = match encode_line(&event) {
                    Ok(line) => line,
                    Err(err) => {
                        let _ = tx
                            .send(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                err.to_string(),
                            )))
                            .await;
                        return;
                    }
                };
                if tx.send(Ok(Bytes::from(line))).await.is_err() {
                    // Request side went away; stop producing.
                    return;
                }
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
            .timeout(STREAM_TIMEOUT)
            .send()
            .await
            .context("send ingest request")?;

        let status = response.status();
        // Drain the response so the connection can be reused.
        let _ = response.bytes().await;

        if status != StatusCode::ACCEPTED {
            bail!("ingest returned status {}", status);
        }
        Ok(())
    }
}

/// One event as one JSON line, newline terminated.
fn encode_line(event: &RawEvent) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(event).context("encode event")?;
    line.push(b'\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event_with_query(query: &str) -> RawEvent {
        RawEvent {
            event_id: "e".into(),
            timestamp: Utc::now(),
            host: "example.com".into(),
            path: "/".into(),
            query: query.into(),
            ip: "1.2.3.4".into(),
            user_agent: "a <b> & c".into(),
            referrer: String::new(),
            content_type: "text/html".into(),
            set_cookie: String::new(),
            uniq: "u".into(),
            second_visit: false,
        }
    }

    #[test]
    fn test_encode_line_is_single_line() {
        let line = encode_line(&event_with_query("a=1")).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_encode_line_keeps_html_characters() {
        let line = encode_line(&event_with_query("q=<tag>&x=1")).unwrap();
        let text = String::from_utf8(line).unwrap();
        assert!(text.contains("q=<tag>&x=1"), "{}", text);
        assert!(text.contains("a <b> & c"), "{}", text);
        assert!(!text.contains("\\u003c"), "{}", text);
    }

    #[test]
    fn test_endpoint_building() {
        let client = IngestClient::new("http://sidecar:7070/").unwrap();
        assert_eq!(client.endpoint, "http://sidecar:7070/ingest");
        assert!(IngestClient::new("  ").is_err());
    }
}
