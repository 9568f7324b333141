//! Durable MQTT session management.
//!
//! A single driver task owns the rumqttc event loop: it feeds inbound
//! publishes to the dispatcher, correlates acknowledgements, and retries
//! the connection with jittered backoff when the transport drops. All
//! outbound commands are serialized so the ack tracker only ever watches
//! one packet at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
};
use rumqttc::mqttbytes::v4::ConnectReturnCode;
use rumqttc::mqttbytes::v4::SubscribeReasonCode;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::acks::AckTracker;
use crate::backoff::Backoff;
use crate::channel::{AckPolicy, Channel};
use crate::config::LinkConfig;
use crate::dispatch::SubscriptionDispatcher;
use crate::error::{LinkError, LinkResult};
use crate::tls::{self, TlsMaterial};

/// Broker endpoint plus the certificate material currently in use.
#[derive(Debug, Clone)]
pub struct LinkCredentials {
    pub host: String,
    pub client_id: String,
    pub tls: TlsMaterial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected { session_present: bool },
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Edge-triggered notifications for components that resubscribe or
/// refresh state when the session comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { session_present: bool },
    Disconnected,
}

struct SessionHandle {
    client: AsyncClient,
    stop_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

struct SessionSlot {
    credentials: LinkCredentials,
    handle: Option<SessionHandle>,
}

pub struct ConnectionManager {
    config: LinkConfig,
    dispatcher: Arc<SubscriptionDispatcher>,
    acks: Arc<AckTracker>,
    state_tx: watch::Sender<LinkState>,
    events_tx: broadcast::Sender<LinkEvent>,
    /// Serializes outbound commands end to end, ack wait included.
    commands: Mutex<()>,
    session: Mutex<SessionSlot>,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig, credentials: LinkCredentials) -> Self {
        let dispatcher = Arc::new(SubscriptionDispatcher::new(config.subscription_slots));
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (events_tx, _) = broadcast::channel(16);
        Self {
            config,
            dispatcher,
            acks: Arc::new(AckTracker::new()),
            state_tx,
            events_tx,
            commands: Mutex::new(()),
            session: Mutex::new(SessionSlot {
                credentials,
                handle: None,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<SubscriptionDispatcher> {
        &self.dispatcher
    }

    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }

    /// Bring the session up, starting the driver task if needed, and
    /// wait until the broker accepts the connection. With an unbounded
    /// retry budget this only returns once connected.
    pub async fn connect(&self) -> LinkResult<()> {
        let mut slot = self.session.lock().await;
        if slot.handle.is_none() {
            self.start_session(&mut slot)?;
        }
        self.await_connected(&mut slot).await
    }

    /// Stop the driver task and drop the connection. Pending ack waits
    /// fail with [`LinkError::ConnectionLost`].
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        self.stop_session(&mut slot).await;
    }

    /// Swap the TLS client credentials and, if a session is up, rebuild
    /// it with the new material. Taking the command lock first means no
    /// outbound command can be mid-flight while the old session is torn
    /// down.
    pub async fn rotate_credentials(&self, tls: TlsMaterial) -> LinkResult<()> {
        let _cmd = self.commands.lock().await;
        let mut slot = self.session.lock().await;
        slot.credentials.tls = tls;
        if slot.handle.is_some() {
            self.stop_session(&mut slot).await;
            self.start_session(&mut slot)?;
            self.await_connected(&mut slot).await?;
        }
        Ok(())
    }

    fn start_session(&self, slot: &mut SessionSlot) -> LinkResult<()> {
        let transport = tls::transport(&slot.credentials.tls)?;
        let mut options = MqttOptions::new(
            slot.credentials.client_id.clone(),
            slot.credentials.host.clone(),
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(u64::from(self.config.keepalive_secs)));
        options.set_clean_session(false);
        options.set_max_packet_size(self.config.max_packet_bytes, self.config.max_packet_bytes);
        options.set_transport(transport);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (stop_tx, stop_rx) = watch::channel(false);
        self.state_tx.send_replace(LinkState::Connecting);

        let driver = tokio::spawn(drive(
            eventloop,
            self.acks.clone(),
            self.dispatcher.clone(),
            self.state_tx.clone(),
            self.events_tx.clone(),
            Backoff::new(
                Duration::from_millis(self.config.backoff_base_ms),
                Duration::from_millis(self.config.backoff_max_ms),
            ),
            self.config.max_connect_attempts,
            stop_rx,
        ));

        slot.handle = Some(SessionHandle {
            client,
            stop_tx,
            driver,
        });
        Ok(())
    }

    async fn stop_session(&self, slot: &mut SessionSlot) {
        let Some(handle) = slot.handle.take() else {
            return;
        };
        let _ = handle.stop_tx.send(true);
        let _ = handle.client.disconnect().await;
        if handle.driver.await.is_err() {
            tracing::warn!("link driver task aborted");
        }
        self.state_tx.send_replace(LinkState::Disconnected);
    }

    async fn await_connected(&self, slot: &mut SessionSlot) -> LinkResult<()> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            if state_rx.borrow_and_update().is_connected() {
                return Ok(());
            }

            enum Wake {
                State,
                DriverExited,
            }

            let wake = {
                let handle = match slot.handle.as_mut() {
                    Some(handle) => handle,
                    None => return Err(LinkError::NotConnected),
                };
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return Err(LinkError::ConnectionLost);
                        }
                        Wake::State
                    }
                    _ = &mut handle.driver => Wake::DriverExited,
                }
            };

            if let Wake::DriverExited = wake {
                slot.handle = None;
                let attempts = self.config.max_connect_attempts.unwrap_or(0);
                return Err(LinkError::RetriesExhausted(attempts));
            }
        }
    }

    async fn client(&self) -> LinkResult<AsyncClient> {
        let slot = self.session.lock().await;
        match &slot.handle {
            Some(handle) => Ok(handle.client.clone()),
            None => Err(LinkError::NotConnected),
        }
    }

    /// `None` means fire and forget; `Some(deadline)` means arm the
    /// tracker and wait, with `Some(None)` carrying no deadline at all.
    fn ack_wait(&self, qos: QoS, ack: AckPolicy) -> Option<Option<Duration>> {
        if matches!(qos, QoS::AtMostOnce) {
            return None;
        }
        match ack {
            AckPolicy::NoWait => None,
            AckPolicy::Default => Some(Some(Duration::from_millis(self.config.ack_timeout_ms))),
            AckPolicy::Within(timeout) => Some(Some(timeout)),
            AckPolicy::Forever => Some(None),
        }
    }

    async fn wait_for_ack(&self, timeout: Option<Duration>) -> LinkResult<()> {
        let mut state_rx = self.state_tx.subscribe();
        self.acks.wait(timeout, &mut state_rx).await
    }

    /// Between wait-forever attempts: pace the reissue, then hold until
    /// the session is usable again. Errors once the session is torn
    /// down or its driver has exhausted the retry budget.
    async fn await_retry_ready(&self) -> LinkResult<()> {
        let pace = Duration::from_millis(self.config.backoff_base_ms);
        tokio::time::sleep(pace).await;
        let mut state_rx = self.state_tx.subscribe();
        loop {
            {
                let slot = self.session.lock().await;
                let Some(handle) = &slot.handle else {
                    return Err(LinkError::NotConnected);
                };
                if handle.driver.is_finished() {
                    return Err(LinkError::RetriesExhausted(
                        self.config.max_connect_attempts.unwrap_or(0),
                    ));
                }
            }
            if state_rx.borrow_and_update().is_connected() {
                return Ok(());
            }
            // The periodic wake re-checks for a driver that exited
            // without a final state change.
            tokio::select! {
                _ = state_rx.changed() => {}
                _ = tokio::time::sleep(pace) => {}
            }
        }
    }
}

/// Wait-forever commands are reissued until the broker accepts them;
/// bounded waits surface their first failure to the caller.
fn retry_forever(deadline: Option<Duration>, err: &LinkError) -> bool {
    deadline.is_none() && err.is_retryable()
}

#[async_trait]
impl Channel for ConnectionManager {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        ack: AckPolicy,
    ) -> LinkResult<()> {
        let _cmd = self.commands.lock().await;
        match self.ack_wait(qos, ack) {
            None => self
                .client()
                .await?
                .publish(topic, qos, false, payload.to_vec())
                .await
                .map_err(|e| LinkError::Publish(e.to_string())),
            Some(timeout) => loop {
                let client = self.client().await?;
                self.acks.arm();
                if let Err(e) = client.publish(topic, qos, false, payload.to_vec()).await {
                    self.acks.disarm();
                    return Err(LinkError::Publish(e.to_string()));
                }
                match self.wait_for_ack(timeout).await {
                    Ok(()) => return Ok(()),
                    Err(e) if retry_forever(timeout, &e) => {
                        tracing::warn!(topic, error = %e, "publish unacknowledged, reissuing");
                        self.await_retry_ready().await?;
                    }
                    Err(e) => return Err(e),
                }
            },
        }
    }

    async fn subscribe(&self, filters: &[&str], qos: QoS, ack: AckPolicy) -> LinkResult<()> {
        let _cmd = self.commands.lock().await;
        let requests: Vec<SubscribeFilter> = filters
            .iter()
            .map(|f| SubscribeFilter::new((*f).to_owned(), qos))
            .collect();
        // SUBSCRIBE always carries a packet id, so QoS does not matter
        // for the wait decision.
        match self.ack_wait(QoS::AtLeastOnce, ack) {
            None => self
                .client()
                .await?
                .subscribe_many(requests)
                .await
                .map_err(|e| LinkError::Subscribe(e.to_string())),
            Some(timeout) => loop {
                let client = self.client().await?;
                self.acks.arm();
                if let Err(e) = client.subscribe_many(requests.clone()).await {
                    self.acks.disarm();
                    return Err(LinkError::Subscribe(e.to_string()));
                }
                match self.wait_for_ack(timeout).await {
                    Ok(()) => return Ok(()),
                    Err(e) if retry_forever(timeout, &e) => {
                        tracing::warn!(
                            filters = ?filters,
                            error = %e,
                            "subscribe unacknowledged, reissuing"
                        );
                        self.await_retry_ready().await?;
                    }
                    Err(e) => return Err(e),
                }
            },
        }
    }

    async fn unsubscribe(&self, filters: &[&str], ack: AckPolicy) -> LinkResult<()> {
        let _cmd = self.commands.lock().await;
        for filter in filters {
            match self.ack_wait(QoS::AtLeastOnce, ack) {
                None => self
                    .client()
                    .await?
                    .unsubscribe(*filter)
                    .await
                    .map_err(|e| LinkError::Subscribe(e.to_string()))?,
                Some(timeout) => loop {
                    let client = self.client().await?;
                    self.acks.arm();
                    if let Err(e) = client.unsubscribe(*filter).await {
                        self.acks.disarm();
                        return Err(LinkError::Subscribe(e.to_string()));
                    }
                    match self.wait_for_ack(timeout).await {
                        Ok(()) => break,
                        Err(e) if retry_forever(timeout, &e) => {
                            tracing::warn!(
                                filter,
                                error = %e,
                                "unsubscribe unacknowledged, reissuing"
                            );
                            self.await_retry_ready().await?;
                        }
                        Err(e) => return Err(e),
                    }
                },
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    mut eventloop: EventLoop,
    acks: Arc<AckTracker>,
    dispatcher: Arc<SubscriptionDispatcher>,
    state_tx: watch::Sender<LinkState>,
    events_tx: broadcast::Sender<LinkEvent>,
    mut backoff: Backoff,
    max_attempts: Option<u32>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    backoff.reset();
                    tracing::info!(
                        session_present = ack.session_present,
                        "broker session established"
                    );
                    state_tx.send_replace(LinkState::Connected {
                        session_present: ack.session_present,
                    });
                    let _ = events_tx.send(LinkEvent::Connected {
                        session_present: ack.session_present,
                    });
                } else {
                    tracing::warn!(code = ?ack.code, "broker refused connection");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatcher.dispatch(&publish.topic, &publish.payload).await;
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                acks.complete(puback.pkid, true);
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let ok = suback
                    .return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                acks.complete(suback.pkid, ok);
            }
            Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                acks.complete(unsuback.pkid, true);
            }
            Ok(Event::Outgoing(
                Outgoing::Publish(pkid) | Outgoing::Subscribe(pkid) | Outgoing::Unsubscribe(pkid),
            )) => {
                acks.record_outgoing(pkid);
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = state_tx.borrow().is_connected();
                state_tx.send_replace(LinkState::Disconnected);
                if was_connected {
                    let _ = events_tx.send(LinkEvent::Disconnected);
                }
                acks.interrupt();

                if let Some(max) = max_attempts {
                    if backoff.failures() + 1 >= max {
                        tracing::error!(
                            error = %e,
                            attempts = max,
                            "connection retry budget exhausted"
                        );
                        return;
                    }
                }

                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost, retrying after backoff"
                );
                state_tx.send_replace(LinkState::Connecting);
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    let was_connected = state_tx.borrow().is_connected();
    state_tx.send_replace(LinkState::Disconnected);
    if was_connected {
        let _ = events_tx.send(LinkEvent::Disconnected);
    }
    acks.interrupt();
}
