use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::KeepAliveConfig;
use crate::lifetime_guard::GuardToken;

/// The scheduler's view of the transport it probes. One method per upcall keeps the
///  scheduler independent of the connection internals and makes it easy to mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeepAliveDriver: Send + Sync + 'static {
    /// Registers a timer task as a holder of the transport's lifetime guard. Every
    ///  spawned timer holds such a token for its whole lifetime.
    fn hold(&self) -> GuardToken;

    /// Writes the probe payload to the connection. Returns false if the transport is no
    ///  longer active - no response deadline is armed in that case.
    async fn send_probe(&self) -> bool;

    /// Called when the response deadline expires without qualifying traffic; expected to
    ///  close the transport with a keep-alive timeout reason.
    async fn on_response_deadline(&self);
}

/// Timer-driven liveness prober for one connection.
///
/// Two mutually exclusive timer roles: the *probe timer* fires `idle_interval` after the
///  last send/receive activity (the wake-up is recomputed on each wake, so activity
///  postpones the probe without respawning the timer task); the *response-deadline timer*
///  is armed only after a probe was actually written and disarmed when qualifying traffic
///  arrives. The scheduler itself enforces that the probe timer is never armed while the
///  deadline timer is active, so there is at most one outstanding probe at any time.
pub struct KeepAliveScheduler {
    idle_interval: Duration,
    response_deadline: Duration,
    driver: Arc<dyn KeepAliveDriver>,
    inner: Mutex<KeepAliveInner>,
}

struct KeepAliveInner {
    last_activity: Instant,
    /// bumped on every batch of received bytes - only inbound traffic counts as a sign
    ///  of peer liveness
    receive_count: u64,
    last_probe: Option<Instant>,
    probe_timer: Option<JoinHandle<()>>,
    deadline_timer: Option<JoinHandle<()>>,
    /// true between taking the probe off the timer and deciding what to arm next
    probe_in_flight: bool,
    stopped: bool,
}

impl KeepAliveScheduler {
    pub fn new(config: &KeepAliveConfig, driver: Arc<dyn KeepAliveDriver>) -> Arc<KeepAliveScheduler> {
        Arc::new(KeepAliveScheduler {
            idle_interval: config.idle_interval,
            response_deadline: config.response_deadline,
            driver,
            inner: Mutex::new(KeepAliveInner {
                last_activity: Instant::now(),
                receive_count: 0,
                last_probe: None,
                probe_timer: None,
                deadline_timer: None,
                probe_in_flight: false,
                stopped: false,
            }),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, KeepAliveInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arms the probe timer from a fresh activity timestamp. Called once the connection
    ///  becomes active.
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        inner.last_activity = Instant::now();
        self.arm_probe_locked(&mut inner);
    }

    /// Cancels both timers. Idempotent; called when the transport leaves
    ///  CONNECTED_ACTIVE.
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        inner.stopped = true;
        if let Some(handle) = inner.probe_timer.take() {
            handle.abort();
        }
        if let Some(handle) = inner.deadline_timer.take() {
            handle.abort();
        }
    }

    /// Records outbound send activity: refreshes the activity timestamp that schedules
    ///  the next probe. A send proves nothing about the peer, so an armed response
    ///  deadline stays armed.
    pub fn on_send_activity(&self) {
        let mut inner = self.lock_inner();
        inner.last_activity = Instant::now();
    }

    /// Records received traffic: refreshes the activity timestamp and, since only
    ///  inbound bytes qualify as a sign of peer liveness, disarms an armed response
    ///  deadline and rearms the probe timer from the new timestamp.
    pub fn on_receive_activity(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        inner.last_activity = Instant::now();
        inner.receive_count += 1;
        if inner.stopped {
            return;
        }
        if let Some(handle) = inner.deadline_timer.take() {
            trace!("qualifying traffic observed - disarming keep-alive response deadline");
            handle.abort();
            self.arm_probe_locked(&mut inner);
        }
    }

    /// Explicit probe request: a pending probe timer is rescheduled to fire immediately;
    ///  if a response is already being awaited, this is a no-op.
    pub fn request_probe(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        if inner.stopped {
            return;
        }
        if inner.deadline_timer.is_some() || inner.probe_in_flight {
            trace!("keep-alive probe already outstanding - ignoring explicit probe request");
            return;
        }
        if let Some(handle) = inner.probe_timer.take() {
            handle.abort();
        }

        let scheduler = self.clone();
        let hold = self.driver.hold();
        inner.probe_timer = Some(tokio::spawn(async move {
            let _hold = hold;
            scheduler.fire_probe().await;
        }));
    }

    /// true while a probe has been sent and its response deadline has not been resolved
    pub fn is_awaiting_response(&self) -> bool {
        let inner = self.lock_inner();
        inner.deadline_timer.is_some() || inner.probe_in_flight
    }

    pub fn last_probe(&self) -> Option<Instant> {
        self.lock_inner().last_probe
    }

    fn arm_probe_locked(self: &Arc<Self>, inner: &mut KeepAliveInner) {
        if inner.stopped || inner.probe_in_flight || inner.deadline_timer.is_some() || inner.probe_timer.is_some() {
            return;
        }

        let scheduler = self.clone();
        let hold = self.driver.hold();
        inner.probe_timer = Some(tokio::spawn(async move {
            let _hold = hold;
            loop {
                let wake_at = scheduler.lock_inner().last_activity + scheduler.idle_interval;
                if Instant::now() >= wake_at {
                    break;
                }
                time::sleep_until(wake_at).await;
            }
            scheduler.fire_probe().await;
        }));
    }

    fn arm_deadline_locked(self: &Arc<Self>, inner: &mut KeepAliveInner) {
        debug_assert!(inner.probe_timer.is_none());

        let scheduler = self.clone();
        let hold = self.driver.hold();
        let deadline = self.response_deadline;
        inner.deadline_timer = Some(tokio::spawn(async move {
            let _hold = hold;
            time::sleep(deadline).await;

            let expired = {
                let mut inner = scheduler.lock_inner();
                // received traffic may have disarmed us between the sleep and this lock
                if inner.stopped || inner.deadline_timer.is_none() {
                    false
                }
                else {
                    inner.deadline_timer = None;
                    true
                }
            };
            if expired {
                warn!("keep-alive response deadline expired");
                scheduler.driver.on_response_deadline().await;
            }
        }));
    }

    async fn fire_probe(self: Arc<Self>) {
        let receive_snapshot = {
            let mut inner = self.lock_inner();
            if inner.stopped {
                return;
            }
            inner.probe_timer = None;
            inner.probe_in_flight = true;
            inner.last_probe = Some(Instant::now());
            inner.receive_count
        };

        debug!("sending keep-alive probe");
        let sent = self.driver.send_probe().await;

        let mut inner = self.lock_inner();
        inner.probe_in_flight = false;
        if inner.stopped {
            return;
        }
        if sent {
            if inner.receive_count != receive_snapshot {
                trace!("qualifying traffic arrived while the probe was in flight - skipping the response deadline");
                self.arm_probe_locked(&mut inner);
            }
            else {
                self.arm_deadline_locked(&mut inner);
            }
        }
    }
}
