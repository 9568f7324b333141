//! Top-level wiring: one connection, one dispatcher, and the three
//! coordinators sharing them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_link::{Channel, ConnectionManager, LinkCredentials, LinkEvent};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::buffers::BufferPool;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::identity::{Identity, IdentityStore};
use crate::ota::{BlockSink, ImagePal, OtaCoordinator};
use crate::provisioning::{DeviceControl, LinkControl, ProvisioningCoordinator};
use crate::shadow::{ConfigGroup, ShadowReconciler};

pub struct DeviceAgent {
    config: AgentConfig,
    connection: Arc<ConnectionManager>,
    provisioning: Arc<ProvisioningCoordinator>,
    ota: Arc<OtaCoordinator>,
    shadow: Arc<ShadowReconciler>,
}

impl DeviceAgent {
    /// Build the agent from stored identity and injected collaborators.
    /// Nothing touches the network until [`DeviceAgent::run`].
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn IdentityStore>,
        device: Arc<dyn DeviceControl>,
        pal: Arc<dyn ImagePal>,
        sink: Arc<dyn BlockSink>,
        groups: Vec<Arc<dyn ConfigGroup>>,
    ) -> AgentResult<Self> {
        let identity = store.load()?;
        tracing::info!(
            thing = %identity.thing_id,
            provisioned = identity.has_device_credentials(),
            "identity loaded"
        );

        let credentials = LinkCredentials {
            host: identity.endpoint.clone(),
            client_id: identity.thing_id.clone(),
            tls: identity.tls_material(),
        };
        let connection = Arc::new(ConnectionManager::new(config.link.clone(), credentials));
        let channel: Arc<dyn Channel> = connection.clone();
        let link: Arc<dyn LinkControl> = connection.clone();

        let thing_id = identity.thing_id.clone();
        let thing_type = identity.thing_type.clone();
        let hardware_major = identity.hardware_major;
        let identity: Arc<Mutex<Identity>> = Arc::new(Mutex::new(identity));

        let provisioning =
            ProvisioningCoordinator::new(channel.clone(), store, device.clone(), link, identity);

        let pool = BufferPool::new(
            config.ota.buffer_slots,
            config.ota.block_size,
            Duration::from_millis(config.ota.acquire_retry_ms),
        );
        let ota = OtaCoordinator::new(
            channel.clone(),
            pal,
            device,
            sink,
            pool,
            thing_type,
            hardware_major,
        );

        let shadow = ShadowReconciler::new(channel, &thing_id, &config.shadow_name, groups);

        Ok(Self {
            config,
            connection,
            provisioning,
            ota,
            shadow,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn ota(&self) -> &Arc<OtaCoordinator> {
        &self.ota
    }

    pub fn shadow(&self) -> &Arc<ShadowReconciler> {
        &self.shadow
    }

    /// Connect and serve until the link is torn down. Provisioning runs
    /// on its own task; this loop drives OTA/shadow (re)subscription and
    /// the periodic reconciliation cycle.
    pub async fn run(&self) -> AgentResult<()> {
        let dispatcher = self.connection.dispatcher();
        let provisioning_msgs = self.provisioning.attach(dispatcher)?;
        self.ota.attach(dispatcher)?;
        self.shadow.attach(dispatcher)?;

        let mut events = self.connection.events();
        let provisioning_task = tokio::spawn(
            self.provisioning
                .clone()
                .run(provisioning_msgs, self.connection.events()),
        );

        self.connection.connect().await?;

        let state = self.connection.state();
        let mut provisioning_active = self.provisioning.active();
        let mut reconcile =
            tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_secs));
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // connect() consumed no events; the Connected edge is still
        // queued, so the arm below performs the initial subscriptions.
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(LinkEvent::Connected { session_present }) => {
                        tracing::debug!(session_present, "session up, arming feature subscriptions");
                        let active = *provisioning_active.borrow();
                        if !active {
                            if let Err(e) = self.ota.subscribe_topics().await {
                                tracing::warn!(error = %e, "ota subscriptions failed");
                            }
                        }
                        if let Err(e) = self.shadow.on_connected(active).await {
                            tracing::warn!(error = %e, "shadow sync start failed");
                        }
                    }
                    Ok(LinkEvent::Disconnected) => self.shadow.on_disconnected(),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "agent loop lagged behind link events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = provisioning_active.changed() => {
                    // Rotation finished: make sure the shadow cycle is
                    // running on the rebuilt session.
                    if changed.is_err() {
                        break;
                    }
                    if !*provisioning_active.borrow() && state.borrow().is_connected() {
                        if let Err(e) = self.shadow.on_connected(false).await {
                            tracing::warn!(error = %e, "shadow sync start failed");
                        }
                    }
                }
                _ = reconcile.tick() => {
                    if state.borrow().is_connected() && !*provisioning_active.borrow() {
                        if let Err(e) = self.shadow.reconcile().await {
                            tracing::warn!(error = %e, "shadow reconciliation failed");
                        }
                    }
                }
            }
        }

        provisioning_task.abort();
        self.connection.disconnect().await;
        Ok(())
    }
}
