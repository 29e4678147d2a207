//! Timeout constants and async timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default timeout for establishing a connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between client keep-alive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Deadline for a freshly accepted client to send its Auth packet
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `future` with a deadline, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

/// Like [`with_timeout_error`], but `None` waits forever
pub async fn with_optional_timeout<F, T>(future: F, duration: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match duration {
        Some(duration) => with_timeout_error(future, duration).await,
        None => future.await,
    }
}
