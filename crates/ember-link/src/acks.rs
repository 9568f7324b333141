//! Acknowledgement correlation between command callers and the driver task.
//!
//! A caller arms the tracker, hands its packet to the client, and waits.
//! The driver task is the only reader of inbound packets: it records the
//! packet id the codec assigned (from the outgoing hook) and completes
//! the wait when the matching PUBACK/SUBACK/UNSUBACK arrives. Waiting
//! never blocks the driver; it happens on a notification the driver fires.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::connection::LinkState;
use crate::error::{LinkError, LinkResult};

#[derive(Debug, Default)]
struct AckCell {
    armed: bool,
    /// Packet id of the armed command, captured from the outgoing hook.
    expected: Option<u16>,
    /// Set when the matching ack arrives. `false` marks a SUBACK that
    /// carried a failure code.
    outcome: Option<bool>,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    cell: Mutex<AckCell>,
    notify: Notify,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear previous correlation state and start tracking the next
    /// outgoing command. Must be called with the command handoff
    /// serialized so the next outgoing packet is ours.
    pub fn arm(&self) {
        let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        *cell = AckCell {
            armed: true,
            expected: None,
            outcome: None,
        };
    }

    pub fn disarm(&self) {
        let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        cell.armed = false;
    }

    /// Driver hook: a command packet left for the broker. The first
    /// non-zero packet id seen after arming belongs to the armed command.
    pub fn record_outgoing(&self, pkid: u16) {
        if pkid == 0 {
            return;
        }
        let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        if cell.armed && cell.expected.is_none() {
            cell.expected = Some(pkid);
        }
    }

    /// Driver hook: an acknowledgement arrived. `ok` is false for a
    /// SUBACK that reported failure for any requested filter.
    pub fn complete(&self, pkid: u16, ok: bool) {
        let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        if cell.armed && cell.expected == Some(pkid) {
            cell.outcome = Some(ok);
            drop(cell);
            self.notify.notify_waiters();
        }
    }

    /// Wake any waiter so it can observe a state change (disconnect).
    pub fn interrupt(&self) {
        self.notify.notify_waiters();
    }

    /// Wait until the armed command is acknowledged, the link drops, or
    /// `timeout` elapses. `None` waits as long as the link stays up.
    /// Always disarms before returning.
    pub async fn wait(
        &self,
        timeout: Option<Duration>,
        state_rx: &mut watch::Receiver<LinkState>,
    ) -> LinkResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let result = self.wait_until(deadline, state_rx).await;
        self.disarm();
        result
    }

    async fn wait_until(
        &self,
        deadline: Option<Instant>,
        state_rx: &mut watch::Receiver<LinkState>,
    ) -> LinkResult<()> {
        loop {
            // Create the future before checking so a completion between
            // the check and the await still wakes us.
            let notified = self.notify.notified();

            {
                let cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
                match cell.outcome {
                    Some(true) => return Ok(()),
                    Some(false) => {
                        return Err(LinkError::Subscribe("broker rejected subscription".into()));
                    }
                    None => {}
                }
            }

            if !state_rx.borrow().is_connected() {
                return Err(LinkError::ConnectionLost);
            }

            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = notified => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(LinkError::ConnectionLost);
                    }
                }
                _ = expiry => return Err(LinkError::AckTimeout),
            }
        }
    }
}
