//! Fixed-interval polling for asynchronous backend operations.

use crate::{
    backend::{Backend, BackendError},
    operation::{OperationHandle, OperationStatus},
};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Copy, Clone)]
pub struct PollingWaiter {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollingWaiter {
    fn default() -> Self {
        PollingWaiter {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(1800),
        }
    }
}

impl PollingWaiter {
    /// Polls the backend until the operation reaches a terminal status or the
    /// timeout elapses. A timeout ends the wait, not the external operation:
    /// the result is `TimedOut` and the tool may well keep running.
    pub async fn wait(
        &self,
        backend: &dyn Backend,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, BackendError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let status = backend.query_status(handle).await?;
            if status.is_terminal() {
                tracing::info!(%handle, %status, "operation reached terminal status");
                return Ok(status);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    %handle,
                    timeout = %humantime::format_duration(self.timeout),
                    "gave up waiting; the operation may still be running"
                );
                return Ok(OperationStatus::TimedOut);
            }
            tracing::debug!(%handle, %status, "still waiting");
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}
