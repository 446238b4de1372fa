//! AT command line framing
//!
//! Commands are prefixed with `AT` and terminated with CR LF when the caller
//! leaves those off. Responses are read up to CR LF and trimmed; judging
//! `OK`/`ERROR` is left to the caller.

use crate::core::transport::{ConnectionHandle, ReadSpec, Transport, TransportError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Normalize an AT command for the wire.
///
/// Only the `AT` prefix is uppercased; the body goes out as written, since
/// string arguments such as APNs and SMS text are case-sensitive.
///
/// ```
/// use rigcon_core::core::protocol::at::normalize;
/// assert_eq!(normalize("at"), "AT\r\n");
/// assert_eq!(normalize("+CSQ?\r\n"), "AT+CSQ?\r\n");
/// ```
pub fn normalize(command: &str) -> String {
    let trimmed = command.trim();
    let body = match trimmed.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("AT") => &trimmed[2..],
        _ => trimmed,
    };
    let mut normalized = format!("AT{body}");
    if !(normalized.ends_with('\r') || normalized.ends_with('\n')) {
        normalized.push_str("\r\n");
    }
    normalized
}

/// Append CR LF to a text line unless it already ends with a line terminator
pub fn terminate_line(text: &str) -> String {
    if text.ends_with('\r') || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\r\n")
    }
}

/// One AT command and what came back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtExchange {
    /// Command as sent, trimmed
    pub command: String,
    /// Response text, trimmed
    pub response: String,
    /// When the response was collected
    pub timestamp: DateTime<Local>,
}

/// AT command client over a [`Transport`] connection
#[derive(Clone)]
pub struct AtClient {
    transport: Transport,
    max_response: usize,
}

impl AtClient {
    /// Create a client; responses longer than `max_response` bytes are cut
    pub fn new(transport: Transport, max_response: usize) -> Self {
        Self {
            transport,
            max_response,
        }
    }

    /// Send one command and collect the reply line
    pub async fn send_and_collect(
        &self,
        handle: ConnectionHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<AtExchange, TransportError> {
        let wire = normalize(command);
        let raw = self
            .transport
            .write_then_read(
                handle,
                wire.as_bytes(),
                ReadSpec::crlf(self.max_response),
                timeout,
                None,
            )
            .await?;

        let exchange = AtExchange {
            command: wire.trim().to_string(),
            response: String::from_utf8_lossy(&raw).trim().to_string(),
            timestamp: Local::now(),
        };
        debug!("AT[{}] {} -> {:?}", handle, exchange.command, exchange.response);
        Ok(exchange)
    }
}
