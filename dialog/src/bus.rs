//! Command-bus abstraction for dispatching local intents.
//!
//! The engine only needs a request/reply channel: a string body goes to a
//! named handler, a string reply comes back within a bounded time. The
//! transport behind it is injected by the composition root.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Error from a command-bus call. Dispatch treats these as data: a failed
/// call drives the negative-reply branch, it is never propagated upward.
#[derive(Debug, Error)]
pub enum BusError {
    /// No reply arrived within the allotted time.
    #[error("command bus timeout")]
    Timeout,

    /// The transport failed before a reply could arrive.
    #[error("command bus transport: {0}")]
    Transport(String),

    /// The handler replied with a non-zero status.
    #[error("remote handler failed with status {0}")]
    Remote(i32),
}

/// Request/reply channel used to invoke locally-handled intents.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Sends `body` to the handler registered for `method` and waits for
    /// its reply within `timeout`, retrying up to `retries` extra attempts.
    async fn call(
        &self,
        method: &str,
        body: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<String, BusError>;
}
