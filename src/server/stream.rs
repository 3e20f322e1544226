//! Channel → SSE bridge.
//!
//! Each pipeline writes [`StreamEvent`]s into a bounded channel; this module
//! drains the channel into `data: {json}\n\n` frames, injects the
//! `server_shutdown` control event when the process is going down, and tags
//! the response with the request's correlation id.

use crate::events::StreamEvent;
use crate::shutdown::ShutdownCoordinator;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use tokio::sync::mpsc;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Build the SSE response for a running pipeline.
///
/// The stream ends when the pipeline closes its channel, or after one
/// final `server_shutdown` frame when the process is going down.
pub fn sse_response(
    shutdown: &ShutdownCoordinator,
    correlation_id: &str,
    rx: mpsc::Receiver<StreamEvent>,
) -> Response {
    let guard = shutdown.register_stream();
    let mut shutdown_rx = shutdown.subscribe();

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut rx = rx;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => yield Ok::<_, Infallible>(frame(&event)),
                    None => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        yield Ok(frame(&StreamEvent::server_shutdown()));
                    }
                    break;
                }
            }
        }
    };

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = correlation_id.parse() {
        response
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, value);
    }
    response
}

fn frame(event: &StreamEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_else(|_| "{}".into()))
}
