//! Greeting payloads shared by the push-stream, socket and RPC bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound request naming who to greet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingRequest {
    pub name: String,
}

impl GreetingRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A single greeting, stamped when it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreetingEvent {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Message-only projection sent on the duplex socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingResponse {
    pub message: String,
}

impl From<GreetingEvent> for GreetingResponse {
    fn from(event: GreetingEvent) -> Self {
        Self {
            message: event.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: GreetingRequest = serde_json::from_str(r#"{"name":"Bob"}"#).unwrap();
        assert_eq!(request, GreetingRequest::new("Bob"));
    }

    #[test]
    fn test_response_drops_timestamp() {
        let event = GreetingEvent {
            message: "Hello Bob @ now".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&GreetingResponse::from(event)).unwrap();
        assert_eq!(json, r#"{"message":"Hello Bob @ now"}"#);
    }
}
