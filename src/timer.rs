//! One-shot rearmable timers for the RFC 3261 transaction state machines.
//!
//! [`after_func`] schedules a callback on the tokio clock and hands back a
//! [`TimerHandle`] with `reset`/`stop` semantics. Under a paused runtime
//! (`#[tokio::test(start_paused = true)]`) the clock is virtual and
//! `tokio::time::advance` drives every pending timer deterministically,
//! which is how the whole test suite exercises retransmission schedules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

/// Timing constants defined by RFC 3261 and the per-state wait durations
/// derived from them. Injectable so tests can shrink the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    /// T1: RTT estimate, the base retransmission interval (500 ms).
    pub t1: Duration,
    /// T2: maximum retransmission interval for non-INVITE requests and
    /// INVITE responses (4 s).
    pub t2: Duration,
    /// T4: maximum time a message remains in the network (5 s).
    pub t4: Duration,
    /// Timers B, F and H: 64*T1 (32 s).
    pub transaction_timeout: Duration,
    /// Timer D: wait for response retransmissions after a final response on
    /// the client side (>= 32 s on unreliable transports, 0 on reliable).
    pub wait_time_d: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        TimerSettings {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            transaction_timeout: 64 * t1,
            wait_time_d: Duration::from_secs(32),
        }
    }
}

impl TimerSettings {
    /// Timer D duration: 0 on reliable transports.
    pub fn timer_d(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.wait_time_d
        }
    }

    /// Timer I duration: T4 on unreliable transports, 0 on reliable.
    pub fn timer_i(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    /// Timer J duration: 64*T1 on unreliable transports, 0 on reliable.
    pub fn timer_j(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.transaction_timeout
        }
    }
}

enum Ctl {
    Reset(Duration),
    Stop,
}

/// Handle to a scheduled callback. Dropping the handle cancels any pending
/// fire and releases the backing task.
#[derive(Debug)]
pub struct TimerHandle {
    ctl: mpsc::UnboundedSender<Ctl>,
    armed: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancels any pending fire and reschedules `d` from now. Safe to call
    /// after the timer has fired; the callback will run again.
    pub fn reset(&self, d: Duration) {
        self.armed.store(true, Ordering::Release);
        let _ = self.ctl.send(Ctl::Reset(d));
    }

    /// Cancels the pending fire. Safe to call after the timer has fired.
    /// Returns whether a pending fire was prevented (best effort; a callback
    /// racing with `stop` may still run).
    pub fn stop(&self) -> bool {
        let was_armed = self.armed.swap(false, Ordering::AcqRel);
        let _ = self.ctl.send(Ctl::Stop);
        was_armed
    }
}

/// Runs `f` after `d` of the tokio clock. The returned handle can reset or
/// stop the schedule; after a reset the callback fires again.
pub fn after_func<F>(d: Duration, f: F) -> TimerHandle
where
    F: Fn() + Send + 'static,
{
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    let armed = Arc::new(AtomicBool::new(true));
    let task_armed = armed.clone();

    tokio::spawn(async move {
        let mut deadline = Some(Instant::now() + d);
        loop {
            match deadline {
                Some(when) => {
                    tokio::select! {
                        _ = time::sleep_until(when) => {
                            task_armed.store(false, Ordering::Release);
                            f();
                            deadline = None;
                        }
                        ctl = ctl_rx.recv() => match ctl {
                            Some(Ctl::Reset(d)) => deadline = Some(Instant::now() + d),
                            Some(Ctl::Stop) => deadline = None,
                            None => return,
                        },
                    }
                }
                None => match ctl_rx.recv().await {
                    Some(Ctl::Reset(d)) => deadline = Some(Instant::now() + d),
                    Some(Ctl::Stop) => {}
                    None => return,
                },
            }
        }
    });

    TimerHandle { ctl: ctl_tx, armed }
}

/// Convenience used by the transaction event loops: fire-and-forget a typed
/// input into an FSM command channel after `d`.
pub(crate) fn send_after<T>(d: Duration, tx: mpsc::UnboundedSender<T>, input: T) -> TimerHandle
where
    T: Clone + Send + 'static,
{
    after_func(d, move || {
        let _ = tx.send(input.clone());
    })
}
