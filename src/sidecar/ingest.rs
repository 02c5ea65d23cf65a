// Ingest endpoint - receives streamed events from the proxy
//
// The request body is newline-delimited JSON, decoded incrementally as chunks
// arrive. Any line that fails to decode aborts the whole batch with a 400;
// a store failure returns 500 so the proxy keeps the batch queued and
// retries it.

use crate::analyzer::StatRow;
use crate::sidecar::SidecarState;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;

/// One event as it appears on the wire. Unknown fields are ignored and a
/// missing timestamp defaults to the arrival time.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestEvent {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    referrer: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    set_cookie: String,
    #[serde(default)]
    uniq: String,
    #[serde(default)]
    second_visit: bool,
}

pub async fn ingest_handler(State(state): State<SidecarState>, body: Body) -> Response {
    let rows = match decode_ndjson(body).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::warn!("ingest decode failed: {}", err);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if rows.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }
    match state.store.insert(rows).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            tracing::error!("ingest insert failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Decode the streamed body into rows, one JSON object per line.
async fn decode_ndjson(body: Body) -> Result<Vec<StatRow>> {
    let mut stream = body.into_data_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut rows = Vec::new();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.context("read ingest body")?;
        buffer.extend_from_slice(&bytes);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if let Some(row) = decode_line(&line)? {
                rows.push(row);
            }
        }
    }
    // A final line without a trailing newline still counts.
    if let Some(row) = decode_line(&buffer)? {
        rows.push(row);
    }

    Ok(rows)
}

fn decode_line(line: &[u8]) -> Result<Option<StatRow>> {
    let trimmed: Vec<u8> = line
        .iter()
        .copied()
        .filter(|b| *b != b'\n' && *b != b'\r')
        .collect();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let event: IngestEvent = serde_json::from_slice(&trimmed).context("decode event line")?;
    Ok(Some(event_to_row(event)))
}

fn event_to_row(event: IngestEvent) -> StatRow {
    let ts = event.timestamp.unwrap_or_else(Utc::now);
    StatRow {
        event_id: event.event_id,
        date: ts.format("%Y-%m-%d").to_string(),
        time: ts.format("%H:%M:%S").to_string(),
        host: event.host,
        path: event.path,
        query: event.query,
        ip: event.ip,
        user_agent: event.user_agent,
        referrer: event.referrer,
        r#type: content_type_to_type(&event.content_type),
        agent: String::new(),
        os: String::new(),
        ref_domain: String::new(),
        mult: 0,
        set_cookie: event.set_cookie,
        uniq: event.uniq,
        second_visit: event.second_visit,
    }
}

/// Feed responses are recognizable from the Content-Type alone; pre-seed the
/// type so the analyzer leaves it in place.
fn content_type_to_type(content_type: &str) -> String {
    let ct = content_type.to_ascii_lowercase();
    if ct.starts_with("application/atom+xml") || ct.starts_with("application/rss+xml") {
        "feed".to_string()
    } else {
        String::new()
    }
}
