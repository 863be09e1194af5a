//! Application-layer keepalive with consecutive-failure accounting.
//!
//! SSH transports do not notice a silently dead peer on an idle tunnel;
//! this loop probes the server the way the OpenSSH client does and
//! force-closes the connection once too many probes in a row go
//! unanswered, which unblocks the byte pump.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Result;

/// The connection surface the keepalive loop needs.
#[async_trait]
pub trait AliveTransport: Send + Sync {
    /// Probe the peer; `Ok` means the peer answered.
    async fn alive_check(&self) -> Result<()>;

    /// Tear the connection down so blocked I/O fails fast.
    async fn force_close(&self);
}

/// Probe `transport` every `interval` until `done` fires.
///
/// The failure counter resets on any success. Reaching `count_max`
/// consecutive failures force-closes the transport and ends the loop;
/// a maximum of zero closes on the first failure.
pub async fn start_keepalive<T>(
    transport: Arc<T>,
    interval: Duration,
    count_max: u32,
    done: CancellationToken,
) where
    T: AliveTransport + ?Sized,
{
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {
                debug!("Sending keepalive message");
                match transport.alive_check().await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        if failures >= count_max {
                            error!(count = failures, error = %e, "Keepalive check failed too many times");
                            transport.force_close().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::error::Error;

    /// Scripted transport: pops outcomes from a queue, succeeding once the
    /// script is exhausted.
    struct ScriptedTransport {
        script: Mutex<VecDeque<bool>>,
        probes: AtomicU32,
        closed: AtomicBool,
    }

    impl ScriptedTransport {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(ScriptedTransport {
                script: Mutex::new(script.iter().copied().collect()),
                probes: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            })
        }

        fn probes(&self) -> u32 {
            self.probes.load(Ordering::SeqCst)
        }

        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AliveTransport for ScriptedTransport {
        async fn alive_check(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(Error::Transport {
                    message: "probe unanswered".into(),
                })
            }
        }

        async fn force_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    const TICK: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn closes_after_count_max_consecutive_failures() {
        let transport = ScriptedTransport::new(&[false, false, false]);
        let task = tokio::spawn(start_keepalive(
            transport.clone(),
            TICK,
            3,
            CancellationToken::new(),
        ));
        task.await.expect("keepalive task");
        assert_eq!(transport.probes(), 3);
        assert!(transport.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_count_max_closes_on_first_failure() {
        let transport = ScriptedTransport::new(&[false]);
        let task = tokio::spawn(start_keepalive(
            transport.clone(),
            TICK,
            0,
            CancellationToken::new(),
        ));
        task.await.expect("keepalive task");
        assert_eq!(transport.probes(), 1);
        assert!(transport.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_counter() {
        // Two failures, one success, then three failures: the success must
        // reset the counter, so the close lands on the sixth probe.
        let transport = ScriptedTransport::new(&[false, false, true, false, false, false]);
        let task = tokio::spawn(start_keepalive(
            transport.clone(),
            TICK,
            3,
            CancellationToken::new(),
        ));
        task.await.expect("keepalive task");
        assert_eq!(transport.probes(), 6);
        assert!(transport.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn done_terminates_promptly_without_closing() {
        let transport = ScriptedTransport::new(&[]);
        let done = CancellationToken::new();
        let task = tokio::spawn(start_keepalive(transport.clone(), TICK, 3, done.clone()));
        tokio::time::advance(TICK * 2).await;
        done.cancel();
        task.await.expect("keepalive task");
        assert!(!transport.closed());
    }
}
