use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::retry::{with_retry, RetryPolicy};
use super::Orchestrator;
use crate::server::{ComputeServer, ServerError, ServerResult, State};

impl Orchestrator {
    /// Poll the backend until it reports a stable state, persisting every
    /// observation and its hourly rate. The stable state is billed before it
    /// is returned.
    ///
    /// Fails with `Timeout` once `max_time` has elapsed. Sleeps are clipped
    /// to the deadline and a hung state query is abandoned at the deadline,
    /// so the call returns within one state round-trip of `max_time`.
    pub(crate) async fn poll_until_stable(
        &self,
        server: &ComputeServer,
        max_time: Duration,
    ) -> ServerResult<State> {
        let adapter = self.clouds.adapter(server.cloud)?;
        let backoff = self
            .settings
            .backoff_for(server.cloud, adapter.backoff());
        let started = Instant::now();
        let deadline = started + max_time;
        let mut interval = backoff.start;
        let mut last = server.state;

        loop {
            let state = match tokio::time::timeout_at(deadline, adapter.state(server)).await {
                Ok(result) => result.map_err(ServerError::backend)?,
                Err(_) => {
                    return Err(ServerError::Timeout {
                        id: server.id,
                        waited: started.elapsed(),
                        last,
                    })
                }
            };
            let previous = self
                .store
                .set_state(server.id, state)
                .await
                .map_err(ServerError::store)?;
            last = state;

            if state.is_stable() {
                self.accountant.observe(server, previous, state).await;
                info!(id = server.id, state = %state, elapsed_ms = started.elapsed().as_millis() as u64, "Reached stable state");
                return Ok(state);
            }
            self.accountant.refresh_rate(server, state).await;

            let now = Instant::now();
            if now >= deadline {
                return Err(ServerError::Timeout {
                    id: server.id,
                    waited: started.elapsed(),
                    last,
                });
            }
            let sleep = interval.min(deadline - now);
            debug!(
                id = server.id,
                state = %state,
                sleep_ms = sleep.as_millis() as u64,
                "Waiting for stable state"
            );
            tokio::time::sleep(sleep).await;
            interval = backoff.next(interval);
        }
    }

    /// Wait for a stable state, retrying the whole wait a bounded number of
    /// times with a settle delay in between.
    pub(crate) async fn stabilize(&self, server: &ComputeServer) -> ServerResult<State> {
        let policy = RetryPolicy::new(self.settings.stable_retries, self.settings.settle_delay);
        let max_time = self.settings.wait_timeout;
        with_retry(policy, "wait_for_stable_state", move || {
            self.poll_until_stable(server, max_time)
        })
        .await
    }

    /// Poll until the server reaches a stable state or `max_time` elapses.
    pub async fn wait_for_stable_state(
        &self,
        account_id: &str,
        id: i64,
        max_time: Duration,
    ) -> ServerResult<State> {
        let server = self.readable(account_id, id).await?;
        self.poll_until_stable(&server, max_time).await
    }
}
