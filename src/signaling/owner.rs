use super::error::EngineError;
use super::reconcile::{Delivery, Reconciler};
use super::ringer::{Ringer, SilentRinger};
use crate::admission::{Admission, TokenRequest};
use crate::config::SignalingConfig;
use crate::media::{ActiveMedia, MediaAdapter, MediaEvent};
use crate::models::{CallSession, CallStatus};
use crate::store::{CallStore, ChangeFeed, FeedItem, FeedSubscription, TransitionOutcome};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerPhase {
    Waiting,
    Ringing,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OwnerSnapshot {
    pub owner_id: String,
    pub phase: OwnerPhase,
    pub incoming: Option<CallSession>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OwnerCommand {
    Accept,
    Decline,
    Hangup,
}

pub type OwnerCommandSender = mpsc::UnboundedSender<OwnerCommand>;
pub type OwnerCommandReceiver = mpsc::UnboundedReceiver<OwnerCommand>;

pub struct OwnerEngineBuilder {
    owner_id: String,
    calls: Option<Arc<dyn CallStore>>,
    feed: Option<Arc<dyn ChangeFeed>>,
    admission: Option<Arc<dyn Admission>>,
    media: Option<Arc<dyn MediaAdapter>>,
    ringer: Option<Arc<dyn Ringer>>,
    signaling: SignalingConfig,
}

impl OwnerEngineBuilder {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            calls: None,
            feed: None,
            admission: None,
            media: None,
            ringer: None,
            signaling: SignalingConfig::default(),
        }
    }

    pub fn with_calls(mut self, calls: Arc<dyn CallStore>) -> Self {
        self.calls = Some(calls);
        self
    }

    pub fn with_feed(mut self, feed: Option<Arc<dyn ChangeFeed>>) -> Self {
        self.feed = feed;
        self
    }

    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaAdapter>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_ringer(mut self, ringer: Arc<dyn Ringer>) -> Self {
        self.ringer = Some(ringer);
        self
    }

    pub fn with_signaling(mut self, signaling: SignalingConfig) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn build(self) -> Result<OwnerEngine> {
        let owner_id = self.owner_id.trim().to_string();
        if owner_id.is_empty() {
            return Err(anyhow!("owner id is required"));
        }
        let calls = self.calls.ok_or_else(|| anyhow!("call store is required"))?;
        let admission = self
            .admission
            .ok_or_else(|| anyhow!("admission is required"))?;
        let media = self.media.ok_or_else(|| anyhow!("media adapter is required"))?;
        let ringer = self
            .ringer
            .unwrap_or_else(|| Arc::new(SilentRinger::default()));

        let (state, _) = watch::channel(OwnerSnapshot {
            owner_id: owner_id.clone(),
            phase: OwnerPhase::Waiting,
            incoming: None,
            error: None,
        });
        Ok(OwnerEngine {
            owner_id,
            calls,
            feed: self.feed,
            admission,
            media,
            ringer,
            reconciler: Reconciler::new(self.signaling.staleness()),
            poll_interval: self.signaling.poll_interval(),
            phase: OwnerPhase::Waiting,
            incoming: None,
            active: None,
            error: None,
            state,
        })
    }
}

/// Owner-side call handling for one connected client.
///
/// Push and poll deliveries both funnel into [`OwnerEngine::on_row`], and all
/// transitions run on the engine's own task, so each client sees one ordered
/// sequence of phases:
///
/// ```text
/// waiting -> ringing -> connecting -> connected -> waiting
///               \-> waiting (decline / closed elsewhere)
/// ```
pub struct OwnerEngine {
    owner_id: String,
    calls: Arc<dyn CallStore>,
    feed: Option<Arc<dyn ChangeFeed>>,
    admission: Arc<dyn Admission>,
    media: Arc<dyn MediaAdapter>,
    ringer: Arc<dyn Ringer>,
    reconciler: Reconciler,
    poll_interval: Duration,
    phase: OwnerPhase,
    incoming: Option<CallSession>,
    active: Option<ActiveMedia>,
    error: Option<String>,
    state: watch::Sender<OwnerSnapshot>,
}

enum Wake {
    Cancelled,
    Command(OwnerCommand),
    Feed(FeedItem),
    Media(MediaEvent),
    Tick,
}

async fn next_feed(feed: &mut Option<FeedSubscription>) -> FeedItem {
    match feed {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn next_media_event(active: &mut Option<ActiveMedia>) -> Option<MediaEvent> {
    match active {
        Some(media) => media.next_event().await,
        None => std::future::pending().await,
    }
}

impl OwnerEngine {
    pub fn builder(owner_id: impl Into<String>) -> OwnerEngineBuilder {
        OwnerEngineBuilder::new(owner_id)
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn phase(&self) -> OwnerPhase {
        self.phase
    }

    pub fn incoming(&self) -> Option<&CallSession> {
        self.incoming.as_ref()
    }

    pub fn has_media(&self) -> bool {
        self.active.is_some()
    }

    pub fn snapshot(&self) -> OwnerSnapshot {
        OwnerSnapshot {
            owner_id: self.owner_id.clone(),
            phase: self.phase,
            incoming: self.incoming.clone(),
            error: self.error.clone(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OwnerSnapshot> {
        self.state.subscribe()
    }

    fn publish(&self) {
        self.state.send_replace(self.snapshot());
    }

    fn back_to_waiting(&mut self, error: Option<String>) {
        self.ringer.stop();
        self.reconciler.dismiss();
        self.incoming = None;
        self.phase = OwnerPhase::Waiting;
        self.error = error;
        self.publish();
    }

    /// Single entry point for rows from either delivery path. Returns true when
    /// the row started ringing.
    pub async fn on_row(&mut self, row: &CallSession, via: Delivery) -> bool {
        if row.owner_id != self.owner_id {
            return false;
        }
        if self.reconciler.tracked() == Some(row.id.as_str()) {
            self.on_tracked_update(row).await;
            return false;
        }
        if matches!(self.phase, OwnerPhase::Connecting | OwnerPhase::Connected) {
            // picked up by a later poll if it is still ringing when we are free
            debug!(owner_id = self.owner_id, session_id = row.id, "busy, not surfacing");
            return false;
        }
        if !self.reconciler.offer(row, Utc::now()) {
            return false;
        }

        info!(
            owner_id = self.owner_id,
            session_id = row.id,
            plate = row.plate,
            ?via,
            "incoming call"
        );
        if self.phase == OwnerPhase::Ringing {
            self.ringer.stop();
        }
        self.incoming = Some(row.clone());
        self.phase = OwnerPhase::Ringing;
        self.error = None;
        self.ringer.start();
        self.publish();
        true
    }

    /// The row on screen changed elsewhere: the caller hung up, another device
    /// answered, or the sweeper timed it out.
    async fn on_tracked_update(&mut self, row: &CallSession) {
        match (self.phase, row.status) {
            (OwnerPhase::Ringing, CallStatus::Ringing) => {}
            (OwnerPhase::Ringing, status) => {
                info!(session_id = row.id, %status, "ringing call closed elsewhere");
                let error = (status == CallStatus::Accepted).then(|| {
                    EngineError::Superseded {
                        id: row.id.clone(),
                        status,
                    }
                    .user_message()
                });
                self.back_to_waiting(error);
            }
            (OwnerPhase::Connected, CallStatus::Ended) => {
                info!(session_id = row.id, "call ended by the other side");
                self.leave_media().await;
                self.back_to_waiting(None);
            }
            _ => {}
        }
    }

    /// Safety-net query for the newest fresh ringing row. Also expires the
    /// row being shown once it outlives the staleness window.
    pub async fn poll_once(&mut self) -> bool {
        let now = Utc::now();
        if self.phase == OwnerPhase::Ringing {
            if let Some(current) = self.incoming.clone() {
                if !current.is_fresh(now, self.reconciler.staleness()) {
                    info!(session_id = current.id, "ringing call went stale");
                    self.back_to_waiting(None);
                } else if let Ok(Some(row)) = self.calls.get(&current.id).await {
                    if row.status != CallStatus::Ringing {
                        self.on_tracked_update(&row).await;
                    }
                }
            }
        }

        let since = now - self.reconciler.staleness();
        match self.calls.latest_ringing(&self.owner_id, since).await {
            Ok(Some(row)) => self.on_row(&row, Delivery::Poll).await,
            Ok(None) => false,
            Err(e) => {
                debug!(owner_id = self.owner_id, "poll failed: {}", e);
                false
            }
        }
    }

    /// ringing -> connecting -> connected. Any failure after the `accepted`
    /// write runs the hangup cleanup, so the row ends up `ended` rather than
    /// left accepted with nobody in the room.
    pub async fn accept(&mut self) -> Result<(), EngineError> {
        if self.phase != OwnerPhase::Ringing {
            return Ok(());
        }
        let Some(call) = self.incoming.clone() else {
            return Ok(());
        };
        self.ringer.stop();
        self.phase = OwnerPhase::Connecting;
        self.error = None;
        self.publish();

        match self.calls.transition(&call.id, CallStatus::Accepted).await {
            Ok(TransitionOutcome::Applied(row)) => self.incoming = Some(row),
            Ok(TransitionOutcome::Unchanged(row)) => {
                let err = EngineError::Superseded {
                    id: row.id.clone(),
                    status: row.status,
                };
                warn!(session_id = row.id, status = %row.status, "accept lost the race");
                self.back_to_waiting(Some(err.user_message()));
                return Err(err);
            }
            Err(e) => {
                warn!(session_id = call.id, "accept write failed, joining anyway: {}", e);
            }
        }

        if let Err(e) = self.join(&call.channel).await {
            warn!(session_id = call.id, "accept failed: {}", e);
            self.hangup().await;
            self.error = Some(e.user_message());
            self.publish();
            return Err(e);
        }
        info!(session_id = call.id, channel = call.channel, "call connected");
        self.phase = OwnerPhase::Connected;
        self.publish();
        Ok(())
    }

    async fn join(&mut self, channel: &str) -> Result<(), EngineError> {
        let credentials = self
            .admission
            .issue(&TokenRequest::publisher(channel))
            .await?;
        self.active = Some(ActiveMedia::connect(self.media.as_ref(), &credentials).await?);
        Ok(())
    }

    /// ringing -> waiting.
    pub async fn decline(&mut self) {
        if self.phase != OwnerPhase::Ringing {
            return;
        }
        self.ringer.stop();
        if let Some(call) = &self.incoming {
            match self.calls.transition(&call.id, CallStatus::Declined).await {
                Ok(outcome) => {
                    info!(session_id = call.id, applied = outcome.is_applied(), "call declined")
                }
                Err(e) => warn!(session_id = call.id, "failed to mark call declined: {}", e),
            }
        }
        self.back_to_waiting(None);
    }

    /// Any phase -> waiting. The status write and the media leave are each
    /// attempted regardless of the other's outcome.
    pub async fn hangup(&mut self) {
        self.ringer.stop();
        if let Some(call) = &self.incoming {
            match self.calls.transition(&call.id, CallStatus::Ended).await {
                Ok(outcome) => {
                    info!(session_id = call.id, applied = outcome.is_applied(), "call ended")
                }
                Err(e) => warn!(session_id = call.id, "failed to mark call ended: {}", e),
            }
        }
        self.leave_media().await;
        self.back_to_waiting(None);
    }

    async fn leave_media(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = active.leave().await {
                warn!(owner_id = self.owner_id, "media leave failed: {}", e);
            }
        }
    }

    /// The client went away. A call in progress is hung up; a call that is
    /// only ringing stays ringing for the owner's other devices.
    pub async fn teardown(&mut self) {
        match self.phase {
            OwnerPhase::Connecting | OwnerPhase::Connected => self.hangup().await,
            OwnerPhase::Ringing => self.back_to_waiting(None),
            OwnerPhase::Waiting => self.ringer.stop(),
        }
    }

    pub async fn on_media_event(&mut self, event: MediaEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if event == MediaEvent::TokenWillExpire {
            let channel = active.channel().to_string();
            match self.admission.issue(&TokenRequest::publisher(&channel)).await {
                Ok(credentials) => {
                    if let Err(e) = active.renew_token(&credentials).await {
                        warn!(channel, "token renew failed: {}", e);
                    }
                }
                Err(e) => warn!(channel, "token reissue refused: {}", e),
            }
            return;
        }
        active.on_event(event).await;
    }

    pub async fn handle_command(&mut self, command: OwnerCommand) {
        debug!(owner_id = self.owner_id, ?command, "owner command");
        match command {
            OwnerCommand::Accept => {
                // failures are already reflected in the snapshot
                self.accept().await.ok();
            }
            OwnerCommand::Decline => self.decline().await,
            OwnerCommand::Hangup => self.hangup().await,
        }
    }

    async fn subscribe_feed(&self) -> Option<FeedSubscription> {
        let feed = self.feed.as_ref()?;
        match feed.subscribe(&self.owner_id).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                debug!(owner_id = self.owner_id, "change feed subscribe failed: {}", e);
                None
            }
        }
    }

    /// Drive the engine until `cancel` fires or the command channel closes,
    /// then run teardown.
    pub async fn run(mut self, mut commands: OwnerCommandReceiver, cancel: CancellationToken) {
        info!(owner_id = self.owner_id, "owner engine started");
        let mut feed = self.subscribe_feed().await;
        // first tick fires immediately and catches rows written before subscribe
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Cancelled,
                },
                item = next_feed(&mut feed) => Wake::Feed(item),
                Some(event) = next_media_event(&mut self.active) => Wake::Media(event),
                _ = ticker.tick() => Wake::Tick,
            };
            match wake {
                Wake::Cancelled => break,
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Feed(FeedItem::Change(change)) => {
                    self.on_row(&change.row, Delivery::Push).await;
                }
                Wake::Feed(FeedItem::Lagged(n)) => {
                    debug!(owner_id = self.owner_id, "change feed lagged by {}", n);
                }
                Wake::Feed(FeedItem::Closed) => {
                    debug!(owner_id = self.owner_id, "change feed closed");
                    feed = None;
                }
                Wake::Media(event) => self.on_media_event(event).await,
                Wake::Tick => {
                    if feed.is_none() {
                        feed = self.subscribe_feed().await;
                    }
                    self.poll_once().await;
                }
            }
        }

        self.teardown().await;
        info!(owner_id = self.owner_id, "owner engine stopped");
    }
}
