//! Greeting event source.
//!
//! `greet` produces a single event stamped at call time; `greetings` produces
//! a lazy, infinite stream that re-evaluates `greet` once per interval.

use chrono::{SecondsFormat, Utc};
use common::{GreetingEvent, GreetingRequest};
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Default spacing between streamed greetings.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StreamSource {
    interval: Duration,
}

impl Default for StreamSource {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl StreamSource {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Build a greeting for `name`, stamped now.
    pub fn greet(&self, name: &str) -> GreetingEvent {
        let now = Utc::now();
        GreetingEvent {
            message: format!(
                "Hello {} @ {}",
                name,
                now.to_rfc3339_opts(SecondsFormat::Micros, true)
            ),
            timestamp: now,
        }
    }

    /// Infinite greeting stream for one subscriber.
    ///
    /// The timer starts on first poll, so the first event arrives one interval
    /// after the subscriber starts consuming. Each call returns an independent
    /// stream with its own clock.
    pub fn greetings(&self, request: GreetingRequest) -> BoxStream<'static, GreetingEvent> {
        let source = self.clone();
        let state: (Option<Interval>, String) = (None, request.name);

        stream::unfold(state, move |(ticker, name)| {
            let source = source.clone();
            async move {
                let mut ticker = ticker.unwrap_or_else(|| {
                    let period = source.interval;
                    let mut ticker = time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker
                });
                ticker.tick().await;
                let event = source.greet(&name);
                Some((event, (Some(ticker), name)))
            }
        })
        .boxed()
    }
}
