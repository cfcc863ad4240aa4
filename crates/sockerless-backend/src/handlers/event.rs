use crate::api::AppState;
use crate::error::{BackendError, Result};
use crate::types::EventMessage;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use sockerless_core::event::{Event, EventKind};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type Chunk = std::result::Result<Bytes, std::io::Error>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventsQuery {
    filters: Option<String>,
    since: Option<String>,
    until: Option<String>,
}

/// Event filters keyed by Docker filter name. Values of one key are ORed,
/// keys are ANDed.
#[derive(Debug, Default)]
struct EventFilters {
    values: HashMap<String, Vec<String>>,
}

impl EventFilters {
    fn parse(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return Ok(Self::default());
        };
        let values = if let Ok(legacy) = serde_json::from_str::<HashMap<String, HashMap<String, bool>>>(raw) {
            legacy
                .into_iter()
                .map(|(key, set)| (key, set.into_keys().collect()))
                .collect()
        } else {
            serde_json::from_str::<HashMap<String, Vec<String>>>(raw)
                .map_err(|_| BackendError::BadRequest("invalid filters parameter".to_string()))?
        };
        Ok(Self { values })
    }

    fn allows(&self, key: &str, accept: impl Fn(&str) -> bool) -> bool {
        self.values
            .get(key)
            .filter(|wanted| !wanted.is_empty())
            .map_or(true, |wanted| wanted.iter().any(|w| accept(w)))
    }

    fn matches(&self, event: &Event) -> bool {
        let attr = |key: &str| event.attributes.get(key).map(String::as_str);
        self.allows("type", |t| t == event.kind.as_str())
            && self.allows("event", |a| a == event.action)
            && self.allows("container", |c| {
                event.kind == EventKind::Container
                    && (event.actor_id.starts_with(c) || attr("name") == Some(c.trim_start_matches('/')))
            })
            && self.allows("image", |i| {
                event.actor_id == i || attr("image") == Some(i) || attr("name") == Some(i)
            })
            && self.allows("label", |l| match l.split_once('=') {
                Some((k, v)) => attr(k) == Some(v),
                None => attr(l).is_some(),
            })
    }
}

/// Unix seconds or RFC 3339.
fn parse_timestamp(name: &str, value: Option<&str>) -> Result<Option<i64>> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let secs = raw.split_once('.').map_or(raw, |(secs, _)| secs);
    if let Ok(ts) = secs.parse::<i64>() {
        return Ok(Some(ts));
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| Some(dt.timestamp()))
        .map_err(|_| BackendError::BadRequest(format!("invalid value for {name}: {raw}")))
}

fn encode(event: &Event) -> Option<Bytes> {
    match serde_json::to_vec(&EventMessage::from(event)) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(Bytes::from(line))
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode event");
            None
        }
    }
}

fn stream_response(rx: mpsc::Receiver<Chunk>) -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| BackendError::Server(format!("failed to build events response: {e}")))
}

/// Stream lifecycle events as newline-delimited JSON.
///
/// Only events published after the request arrives are delivered. An
/// `until` in the past yields an empty stream.
///
/// # Errors
///
/// Returns 400 for malformed filters or timestamps.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Response> {
    let filters = EventFilters::parse(query.filters.as_deref())?;
    let since = parse_timestamp("since", query.since.as_deref())?;
    let until = parse_timestamp("until", query.until.as_deref())?;

    if until.is_some_and(|until| until < chrono::Utc::now().timestamp()) {
        let (_, rx) = mpsc::channel::<Chunk>(1);
        return stream_response(rx);
    }

    let mut events = state.runtime.event_bus().subscribe();
    let (tx, rx) = mpsc::channel::<Chunk>(64);
    tokio::spawn(async move {
        let deadline = async move {
            match until {
                Some(until) => {
                    let left = until.saturating_sub(chrono::Utc::now().timestamp());
                    tokio::time::sleep(Duration::from_secs(u64::try_from(left).unwrap_or(0) + 1)).await;
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        loop {
            let received = tokio::select! {
                received = events.recv() => received,
                () = tx.closed() => break,
                () = &mut deadline => break,
            };
            let event = match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "events subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let time = event.time.timestamp();
            if since.is_some_and(|since| time < since) {
                continue;
            }
            if until.is_some_and(|until| time > until) {
                break;
            }
            if !filters.matches(&event) {
                continue;
            }
            let Some(line) = encode(&event) else {
                continue;
            };
            if tx.send(Ok(line)).await.is_err() {
                break;
            }
        }
        tracing::debug!("events stream closed");
    });

    stream_response(rx)
}
