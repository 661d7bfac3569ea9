use std::sync::Arc;

use axum::{body::Bytes, extract::ws::Message};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::warn;

use super::session::ClientSession;
use crate::{
    config::LivenessSettings,
    metrics::{self, LivenessEviction},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessExit {
    /// The session was closed by someone else.
    SessionClosed,
    TimedOut,
    ProbeFailed,
}

/// Probes the peer every interval and closes the session once it has been
/// silent longer than the timeout.
///
/// Probe writes share the session write lock with fan-out, and each write is
/// bounded by the timeout so a stalled peer counts as a failed probe.
pub async fn run_liveness_monitor(
    session: Arc<ClientSession>,
    settings: LivenessSettings,
) -> LivenessExit {
    let mut ticker = tokio::time::interval(settings.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset(); // skip immediate first tick

    loop {
        tokio::select! {
            _ = session.closed() => return LivenessExit::SessionClosed,
            _ = ticker.tick() => {
                let idle = session.idle_for();
                if idle > settings.timeout {
                    warn!(
                        session_id = %session.id(),
                        doc_id = %session.doc_id(),
                        idle = ?idle,
                        "liveness timeout, disconnecting"
                    );
                    return evict(&session, LivenessEviction::TimedOut);
                }

                match timeout(settings.timeout, session.send(Message::Ping(Bytes::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(session_id = %session.id(), error = %error, "liveness probe failed");
                        return evict(&session, LivenessEviction::ProbeFailed);
                    }
                    Err(_) => {
                        warn!(session_id = %session.id(), "liveness probe write stalled");
                        return evict(&session, LivenessEviction::ProbeFailed);
                    }
                }
            }
        }
    }
}

fn evict(session: &ClientSession, reason: LivenessEviction) -> LivenessExit {
    metrics::record_liveness_eviction(reason);
    session.close();
    match reason {
        LivenessEviction::TimedOut => LivenessExit::TimedOut,
        LivenessEviction::ProbeFailed => LivenessExit::ProbeFailed,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::extract::ws::Message;

    use super::{run_liveness_monitor, LivenessExit};
    use crate::{
        config::LivenessSettings,
        ws::session::test_support::{channel_session, failing_session},
    };

    fn settings() -> LivenessSettings {
        LivenessSettings {
            probe_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_closed_after_timeout() {
        let (session, mut frames, _rx) = channel_session("notes", 1);
        let exit = run_liveness_monitor(Arc::clone(&session), settings()).await;

        assert_eq!(exit, LivenessExit::TimedOut);
        assert!(session.is_closed());
        assert!(matches!(frames.try_recv(), Ok(Message::Ping(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_probes_keep_session_open() {
        let (session, _frames, _rx) = channel_session("notes", 1);
        let monitor = tokio::spawn(run_liveness_monitor(Arc::clone(&session), settings()));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.touch();
        }
        assert!(!session.is_closed());

        let exit = monitor.await.expect("monitor should not panic");
        assert_eq!(exit, LivenessExit::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_write_ends_monitor() {
        let (session, _rx) = failing_session("notes", 1);
        let exit = run_liveness_monitor(Arc::clone(&session), settings()).await;
        assert_eq!(exit, LivenessExit::ProbeFailed);
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_when_session_closes() {
        let (session, _frames, _rx) = channel_session("notes", 1);
        let monitor = tokio::spawn(run_liveness_monitor(Arc::clone(&session), settings()));
        session.close();
        assert_eq!(monitor.await.expect("monitor should not panic"), LivenessExit::SessionClosed);
    }
}
