//! Pull loop — cooperative job-request scheduler.
//!
//! A single task selects among the stop signal, an immediate-trigger
//! channel (bounded, capacity 1), and an exponential-backoff timer. Job
//! completion pushes a non-blocking trigger so the next pull happens
//! within milliseconds instead of waiting out a full backoff cycle.
//!
//! A successful `RequestJob` send resets the backoff to the minimum;
//! being paused, at capacity, or failing the send doubles it up to the
//! cap. The gateway sends no reply when it has nothing to assign — the
//! timer is the retry.

use super::{send_envelope, AgentContext, WsWriter};
use crate::protocol::{Envelope, Payload, RequestJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub const BACKOFF_MIN: Duration = Duration::from_millis(500);
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

fn double(backoff: Duration) -> Duration {
    (backoff * 2).min(BACKOFF_MAX)
}

pub(crate) async fn run(
    ctx: Arc<AgentContext>,
    writer: WsWriter,
    mut trigger: mpsc::Receiver<()>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_MIN;
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = trigger.recv() => {}
            _ = tokio::time::sleep(backoff) => {}
        }

        if !ctx.can_accept_job() {
            backoff = double(backoff);
            continue;
        }

        let request = Payload::RequestJob(RequestJob {
            agent_id: ctx.config.agent_id.clone(),
        });
        let envelope = Envelope::new(ctx.config.agent_id.clone(), request);
        match send_envelope(&writer, envelope).await {
            Ok(()) => {
                debug!("job requested");
                backoff = BACKOFF_MIN;
            }
            Err(e) => {
                warn!(error = %e, "job request write failed");
                backoff = double(backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = BACKOFF_MIN;
        b = double(b);
        assert_eq!(b, Duration::from_secs(1));
        for _ in 0..10 {
            b = double(b);
        }
        assert_eq!(b, BACKOFF_MAX);
        assert_eq!(double(BACKOFF_MAX), BACKOFF_MAX);
    }
}
