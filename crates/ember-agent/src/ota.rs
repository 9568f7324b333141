//! Firmware update glue.
//!
//! The block-transfer codec is an external library; this module supplies
//! everything it borrows from the device: topic routing into job and
//! block handlers, the fixed buffer pool, fire-and-forget publishing,
//! and the lifecycle callbacks that tie job progress to the image
//! partition PAL and the restart hook.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ember_link::{AckPolicy, Channel, MessageHandler, QoS, SubscriptionDispatcher};
use ember_protocol::jobs::{OtaJobDocument, OtaTopicKind, classify_ota_topic};
use ember_protocol::topics;
use tokio::sync::watch;

use crate::buffers::{BufferLease, BufferPool};
use crate::error::AgentResult;
use crate::provisioning::DeviceControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Accepted,
    Rejected,
}

/// Platform abstraction for the firmware image partitions.
pub trait ImagePal: Send + Sync {
    /// Boot into the staged image. Returns only on failure; success
    /// resets the device.
    fn activate(&self) -> AgentResult<()>;
    /// Commit or roll back the currently running image.
    fn set_image_state(&self, state: ImageState) -> AgentResult<()>;
}

/// Consumer of streamed file blocks: the external OTA codec. The lease
/// returns its buffer to the pool when the codec drops it.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn submit(&self, topic: &str, block: BufferLease);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaJobState {
    Idle,
    ReceivingJob,
    Downloading,
    Testing,
    Accepted,
    Rejected,
}

/// Lifecycle callbacks raised by the external OTA library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaEvent {
    /// A job document was accepted and the download is starting.
    JobReceived,
    /// Boot into the downloaded image.
    Activate,
    /// Running post-flash, decide whether to commit the new image.
    StartSelfTest,
    SelfTestFailed,
    /// The job failed; the previous image keeps running.
    UpdateFailed,
    UpdateComplete,
}

pub struct OtaCoordinator {
    channel: Arc<dyn Channel>,
    pal: Arc<dyn ImagePal>,
    device: Arc<dyn DeviceControl>,
    sink: Arc<dyn BlockSink>,
    pool: BufferPool,
    thing_type: String,
    hardware_major: u32,
    state: Mutex<OtaJobState>,
    job: Mutex<Option<OtaJobDocument>>,
    /// True while an update is underway; telemetry producers throttle on
    /// this to keep bandwidth for blocks.
    in_progress_tx: watch::Sender<bool>,
}

impl OtaCoordinator {
    pub fn new(
        channel: Arc<dyn Channel>,
        pal: Arc<dyn ImagePal>,
        device: Arc<dyn DeviceControl>,
        sink: Arc<dyn BlockSink>,
        pool: BufferPool,
        thing_type: impl Into<String>,
        hardware_major: u32,
    ) -> Arc<Self> {
        let (in_progress_tx, _) = watch::channel(false);
        Arc::new(Self {
            channel,
            pal,
            device,
            sink,
            pool,
            thing_type: thing_type.into(),
            hardware_major,
            state: Mutex::new(OtaJobState::Idle),
            job: Mutex::new(None),
            in_progress_tx,
        })
    }

    pub fn state(&self) -> OtaJobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: OtaJobState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "ota state change");
            *state = next;
        }
    }

    pub fn in_progress(&self) -> watch::Receiver<bool> {
        self.in_progress_tx.subscribe()
    }

    /// Route the jobs and streams namespaces into this coordinator.
    pub fn attach(self: &Arc<Self>, dispatcher: &SubscriptionDispatcher) -> AgentResult<()> {
        let handler: Arc<dyn MessageHandler> = Arc::new(OtaInbound {
            coordinator: self.clone(),
        });
        dispatcher.register(&topics::jobs_wildcard(), handler.clone())?;
        dispatcher.register(&topics::streams_wildcard(), handler)?;
        Ok(())
    }

    /// Broker subscriptions for both namespaces; held until the ack
    /// arrives since nothing works without them.
    pub async fn subscribe_topics(&self) -> AgentResult<()> {
        self.channel
            .subscribe(
                &[&topics::jobs_wildcard(), &topics::streams_wildcard()],
                QoS::AtLeastOnce,
                AckPolicy::Forever,
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget publish for the OTA library (status updates,
    /// block acks). Never blocks the library on a broker ack.
    pub async fn publish_status(&self, topic: &str, payload: &[u8]) -> AgentResult<()> {
        self.channel
            .publish(topic, payload, QoS::AtLeastOnce, AckPolicy::NoWait)
            .await?;
        Ok(())
    }

    /// New job document (from `$next/get/accepted` or `notify-next`).
    /// Incompatible images are refused before a single block is fetched.
    pub fn handle_job_document(&self, payload: &[u8]) {
        let Ok(envelope) = serde_json::from_slice::<serde_json::Value>(payload) else {
            tracing::warn!("unparseable job document, dropping");
            return;
        };
        let document = envelope
            .pointer("/execution/jobDocument")
            .or_else(|| envelope.get("jobDocument"));
        let Some(document) = document else {
            tracing::debug!("no pending job");
            return;
        };
        let document: OtaJobDocument = match serde_json::from_value(document.clone()) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, "malformed job document, dropping");
                return;
            }
        };

        if !document.compatible_with(&self.thing_type, self.hardware_major) {
            tracing::warn!(
                job_thing_type = document.thing_type.as_deref().unwrap_or(""),
                job_hardware_major = document.hardware_major.unwrap_or(0),
                "job targets different hardware, refusing"
            );
            return;
        }

        tracing::info!(
            version = document.firmware_version.as_deref().unwrap_or("unknown"),
            "firmware job received"
        );
        *self.job.lock().unwrap_or_else(|e| e.into_inner()) = Some(document);
        self.set_state(OtaJobState::ReceivingJob);
        self.in_progress_tx.send_replace(true);
    }

    /// A file block arrived: stage it in a pool buffer and hand it to
    /// the codec. Waits for a free buffer when the pool is dry, which
    /// backpressures the inbound stream. The wait runs on the link
    /// driver task, so event-loop polling (keepalives included) pauses
    /// until the codec frees a slot.
    pub async fn handle_file_block(&self, topic: &str, payload: &[u8]) {
        if payload.len() > self.pool.block_size() {
            tracing::warn!(
                len = payload.len(),
                limit = self.pool.block_size(),
                "oversized file block, dropping"
            );
            return;
        }
        let mut lease = self.pool.acquire().await;
        lease.fill(payload);
        self.set_state(OtaJobState::Downloading);
        self.sink.submit(topic, lease).await;
    }

    pub async fn handle_event(&self, event: OtaEvent) -> AgentResult<()> {
        match event {
            OtaEvent::JobReceived => {
                self.set_state(OtaJobState::Downloading);
                self.in_progress_tx.send_replace(true);
            }
            OtaEvent::Activate => {
                tracing::info!("activating downloaded image");
                if let Err(e) = self.pal.activate() {
                    tracing::error!(error = %e, "image activation failed");
                }
                // Reaching this point at all means activation failed.
                self.pal.set_image_state(ImageState::Rejected)?;
                self.set_state(OtaJobState::Rejected);
                self.in_progress_tx.send_replace(false);
                self.device.request_restart();
            }
            OtaEvent::StartSelfTest => {
                self.set_state(OtaJobState::Testing);
                if self.self_test_passes() {
                    tracing::info!("self test passed, committing image");
                    self.pal.set_image_state(ImageState::Accepted)?;
                    self.set_state(OtaJobState::Accepted);
                    self.in_progress_tx.send_replace(false);
                } else {
                    tracing::error!("image incompatible with this unit, rolling back");
                    self.pal.set_image_state(ImageState::Rejected)?;
                    self.set_state(OtaJobState::Rejected);
                    self.in_progress_tx.send_replace(false);
                    self.device.request_restart();
                }
            }
            OtaEvent::SelfTestFailed => {
                tracing::error!("self test failed, rolling back");
                self.pal.set_image_state(ImageState::Rejected)?;
                self.set_state(OtaJobState::Rejected);
                self.in_progress_tx.send_replace(false);
                self.device.request_restart();
            }
            OtaEvent::UpdateFailed => {
                tracing::warn!("update failed, previous image keeps running");
                self.set_state(OtaJobState::Rejected);
                self.job.lock().unwrap_or_else(|e| e.into_inner()).take();
                self.in_progress_tx.send_replace(false);
            }
            OtaEvent::UpdateComplete => {
                tracing::info!("update complete");
                self.set_state(OtaJobState::Idle);
                self.job.lock().unwrap_or_else(|e| e.into_inner()).take();
                self.in_progress_tx.send_replace(false);
            }
        }
        Ok(())
    }

    /// Image validity predicate for the running unit. A missing job
    /// document (post-reset test boot) cannot veto; the document was
    /// already checked before download.
    fn self_test_passes(&self) -> bool {
        let job = self.job.lock().unwrap_or_else(|e| e.into_inner());
        match job.as_ref() {
            Some(doc) => doc.compatible_with(&self.thing_type, self.hardware_major),
            None => {
                tracing::warn!("no job document at self test, accepting running image");
                true
            }
        }
    }
}

struct OtaInbound {
    coordinator: Arc<OtaCoordinator>,
}

#[async_trait]
impl MessageHandler for OtaInbound {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        match classify_ota_topic(topic) {
            Some(OtaTopicKind::JobDocument) => self.coordinator.handle_job_document(payload),
            Some(OtaTopicKind::FileBlock) => {
                self.coordinator.handle_file_block(topic, payload).await;
            }
            Some(OtaTopicKind::JobOther) => {
                tracing::debug!(topic, "job status message");
            }
            None => {
                tracing::debug!(topic, "non-ota message in ota handler");
            }
        }
    }
}
