use super::error::EngineError;
use super::owner::next_media_event;
use super::session::StartCallRequest;
use super::starter::CallStarter;
use crate::admission::{Admission, TokenRequest};
use crate::media::{ActiveMedia, MediaAdapter, MediaEvent};
use crate::models::{normalize_plate, CallSession};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerPhase {
    Idle,
    Calling,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CallerSnapshot {
    pub plate: String,
    pub phase: CallerPhase,
    pub call: Option<CallSession>,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub enum CallerCommand {
    Start(StartCallRequest),
    Hangup,
}

pub type CallerCommandSender = mpsc::UnboundedSender<CallerCommand>;
pub type CallerCommandReceiver = mpsc::UnboundedReceiver<CallerCommand>;

/// Caller side of one scan: `idle -> calling -> connected -> idle`.
pub struct CallerEngine {
    plate: String,
    starter: Arc<CallStarter>,
    admission: Arc<dyn Admission>,
    media: Arc<dyn MediaAdapter>,
    phase: CallerPhase,
    call: Option<CallSession>,
    active: Option<ActiveMedia>,
    error: Option<String>,
    state: watch::Sender<CallerSnapshot>,
}

impl CallerEngine {
    pub fn new(
        plate: &str,
        starter: Arc<CallStarter>,
        admission: Arc<dyn Admission>,
        media: Arc<dyn MediaAdapter>,
    ) -> Self {
        let plate = normalize_plate(plate);
        let (state, _) = watch::channel(CallerSnapshot {
            plate: plate.clone(),
            phase: CallerPhase::Idle,
            call: None,
            error: None,
        });
        Self {
            plate,
            starter,
            admission,
            media,
            phase: CallerPhase::Idle,
            call: None,
            active: None,
            error: None,
            state,
        }
    }

    pub fn phase(&self) -> CallerPhase {
        self.phase
    }

    pub fn call(&self) -> Option<&CallSession> {
        self.call.as_ref()
    }

    pub fn snapshot(&self) -> CallerSnapshot {
        CallerSnapshot {
            plate: self.plate.clone(),
            phase: self.phase,
            call: self.call.clone(),
            error: self.error.clone(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallerSnapshot> {
        self.state.subscribe()
    }

    fn publish(&self) {
        self.state.send_replace(self.snapshot());
    }

    /// No-op unless idle. Creates the session, then joins the room it names.
    /// On failure whatever was set up is torn down and the engine is idle again.
    pub async fn start(&mut self, mut req: StartCallRequest) -> Result<(), EngineError> {
        if self.phase != CallerPhase::Idle {
            debug!(plate = self.plate, phase = ?self.phase, "start ignored");
            return Ok(());
        }
        if req.plate.trim().is_empty() {
            req.plate = self.plate.clone();
        }
        self.phase = CallerPhase::Calling;
        self.error = None;
        self.publish();

        if let Err(e) = self.connect(&req).await {
            warn!(plate = self.plate, "call start failed: {}", e);
            self.hangup().await;
            self.error = Some(e.user_message());
            self.publish();
            return Err(e);
        }
        self.phase = CallerPhase::Connected;
        self.publish();
        Ok(())
    }

    async fn connect(&mut self, req: &StartCallRequest) -> Result<(), EngineError> {
        let call = self.starter.start(req).await?;
        info!(session_id = call.id, channel = call.channel, "call placed");
        let channel = call.channel.clone();
        self.call = Some(call);
        self.publish();

        let credentials = self
            .admission
            .issue(&TokenRequest::publisher(&channel))
            .await?;
        self.active = Some(ActiveMedia::connect(self.media.as_ref(), &credentials).await?);
        Ok(())
    }

    /// Always attempts the media leave and the status write; neither failure
    /// is reported to the user.
    pub async fn hangup(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = active.leave().await {
                debug!(plate = self.plate, "media leave failed: {}", e);
            }
        }
        if let Some(call) = self.call.take() {
            if let Err(e) = self.starter.end(&call.id).await {
                debug!(session_id = call.id, "failed to mark call ended: {}", e);
            }
        }
        self.phase = CallerPhase::Idle;
        self.publish();
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

    pub async fn run(mut self, mut commands: CallerCommandReceiver, cancel: CancellationToken) {
        info!(plate = self.plate, "caller engine started");
        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => None,
                command = commands.recv() => command.map(Ok),
                Some(event) = next_media_event(&mut self.active) => Some(Err(event)),
            };
            match wake {
                None => break,
                Some(Ok(CallerCommand::Start(req))) => {
                    // failures are already reflected in the snapshot
                    self.start(req).await.ok();
                }
                Some(Ok(CallerCommand::Hangup)) => self.hangup().await,
                Some(Err(event)) => self.on_media_event(event).await,
            }
        }
        if self.phase != CallerPhase::Idle || self.active.is_some() {
            self.hangup().await;
        }
        info!(plate = self.plate, "caller engine stopped");
    }
}
