//! Server-sent events binding.

use crate::subscription::{ConnectionGuard, Subscription, TransportKind};
use crate::AppState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use common::{GreetingEvent, GreetingRequest};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

/// `GET /greetings/{name}`: one JSON greeting per tick until the client goes away.
pub async fn greetings_sse_handler(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = state.registry.connect(TransportKind::PushStream);
    let subscription = guard.connection().open();
    let events = state.source.greetings(GreetingRequest::new(name));

    Sse::new(event_stream(events, subscription, guard)).keep_alive(KeepAlive::default())
}

/// Pump greetings into SSE frames.
///
/// The guard lives inside the stream state, so dropping the response body
/// unregisters the connection.
fn event_stream(
    events: BoxStream<'static, GreetingEvent>,
    subscription: Subscription,
    guard: ConnectionGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(
        (events, subscription, guard),
        |(mut events, subscription, guard)| async move {
            let event = tokio::select! {
                biased;

                _ = subscription.cancelled() => {
                    debug!("Push stream {} cancelled", subscription.connection_id());
                    return None;
                }
                event = events.next() => event?,
            };

            let frame = match Event::default().json_data(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode greeting: {}", e);
                    return None;
                }
            };
            Some((Ok(frame), (events, subscription, guard)))
        },
    )
}
