use std::sync::Arc;

use link_channel::channel::{ChannelEndpoint, EventReceiver, EventSender};
use link_channel::error::ChannelError;
use link_channel::event::{AgentEvent, ClientEvent, StepSubmission};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ConfigStore, PluginConfigRecord};
use crate::machine::{Effect, LinkingStep, MSG_SETTING_UP, SessionState, step_rules};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a linking session is already in flight")]
    AlreadyInFlight,

    #[error("no linking step is pending")]
    NoStepPending,

    #[error("{0}")]
    Validation(String),

    #[error("there is no configuration to unlink")]
    NotConfigured,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The session actor is gone; the handle is stale.
    #[error("linking session is gone")]
    SessionGone,
}

/// Out-of-band signals for the hosting UI: toasts, the config-updated
/// notification, and the request to dismiss the dialog.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    ConfigSaved,
    ConfigSaveFailed(String),
    ConfigUpdated,
    CloseRequested,
}

/// Snapshot the hosting UI renders from. `should_offer_linking` is
/// recomputed for every snapshot, never cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkView {
    pub state: SessionState,
    pub already_configured: bool,
    pub should_offer_linking: bool,
    pub config: Vec<PluginConfigRecord>,
}

/// Controller for one account-linking session.
///
/// Owns the session state, the working configuration record and the
/// channel to the backend agent. All mutation goes through the methods
/// below; each runs to completion before the next event is looked at,
/// so transitions are atomic (see [`open_session`] for the driving loop).
pub struct LinkSession {
    plugin_id: String,
    alias: String,
    session_id: String,
    sender: EventSender,
    receiver: Option<EventReceiver>,
    store: Arc<dyn ConfigStore>,
    /// Working copy of the record; synced into `config` before saves.
    record: PluginConfigRecord,
    config: Vec<PluginConfigRecord>,
    state: SessionState,
    already_configured: bool,
    notices: broadcast::Sender<Notice>,
    closed: bool,
}

impl LinkSession {
    /// `alias` is the `platform` discriminator written into the config
    /// record; `config` is the plugin's current configuration list (zero
    /// or one record). An empty list gets a fresh record immediately, the
    /// way the config editor expects one to exist while the form shows.
    pub fn new(
        plugin_id: impl Into<String>,
        alias: impl Into<String>,
        mut config: Vec<PluginConfigRecord>,
        channel: ChannelEndpoint,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let plugin_id = plugin_id.into();
        let alias = alias.into();
        if config.is_empty() {
            config.push(PluginConfigRecord::new(alias.clone()));
        }
        let record = config[0].clone();
        let already_configured = record.is_linked();
        let (sender, receiver) = channel.split();
        let (notices, _) = broadcast::channel(16);

        let session = Self {
            plugin_id,
            alias,
            session_id: Uuid::new_v4().to_string(),
            sender,
            receiver: Some(receiver),
            store,
            record,
            config,
            state: SessionState::idle(),
            already_configured,
            notices,
            closed: false,
        };
        info!(session = %session.session_id, plugin = %session.plugin_id, "linking session opened");
        session
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn record(&self) -> &PluginConfigRecord {
        &self.record
    }

    pub fn config(&self) -> &[PluginConfigRecord] {
        &self.config
    }

    pub fn already_configured(&self) -> bool {
        self.already_configured
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub(crate) fn notice_hub(&self) -> broadcast::Sender<Notice> {
        self.notices.clone()
    }

    pub fn view(&self) -> LinkView {
        LinkView {
            state: self.state.clone(),
            already_configured: self.already_configured,
            should_offer_linking: self.should_offer_linking(),
            config: self.config.clone(),
        }
    }

    /// Whether the automated linking UI applies at all: not once the
    /// record is marked configured, not while it holds a complete bundle,
    /// and not under an unresolved linking error.
    pub fn should_offer_linking(&self) -> bool {
        if self.already_configured {
            return false;
        }
        if self.record.is_linked() {
            return false;
        }
        !self.state.error
    }

    /// Open the automated flow. The agent answers with the first step.
    pub async fn start_linking(&mut self) -> Result<(), SessionError> {
        if self.state.in_flight {
            return Err(SessionError::AlreadyInFlight);
        }
        self.sender.send_client(ClientEvent::LinkAccount).await?;

        let mut state = SessionState::idle();
        state.in_flight = true;
        state.waiting = true;
        state.waiting_message = MSG_SETTING_UP.to_string();
        self.state = state;
        info!(session = %self.session_id, "account linking started");
        Ok(())
    }

    /// Send the user's answer for the pending step. The step does not
    /// advance here; the agent's next event decides what happens.
    pub async fn submit_step(&mut self, value: &str) -> Result<(), SessionError> {
        let step = self.state.step;
        let Some(rules) = step_rules(step) else {
            return Err(SessionError::NoStepPending);
        };
        (rules.validate)(value).map_err(SessionError::Validation)?;

        let event = match step {
            LinkingStep::Username => ClientEvent::Username(StepSubmission::username(value)),
            LinkingStep::Password => ClientEvent::Password(StepSubmission::password(value)),
            LinkingStep::Totp => ClientEvent::Totp(StepSubmission::totp(value)),
            LinkingStep::None => return Err(SessionError::NoStepPending),
        };
        self.sender.send_client(event).await?;
        self.state.waiting = true;
        debug!(session = %self.session_id, step = ?step, "step submitted");
        Ok(())
    }

    /// Apply one inbound agent event. Malformed payloads never get this
    /// far; persistence failures are reported through notices and the new
    /// credentials are kept regardless.
    pub async fn handle_event(&mut self, event: AgentEvent) {
        let (next, effect) = self.state.apply(&event);
        debug!(session = %self.session_id, event = %event.name(), step = ?next.step, "agent event applied");
        self.state = next;

        if let Some(Effect::StoreCredentials(bundle)) = effect {
            info!(session = %self.session_id, "credentials received, saving configuration");
            self.record.google_auth = Some(bundle);
            self.sync_record();
            let _ = self.persist().await;
        }
    }

    /// The user opts out of the automated flow to fill the schema form by
    /// hand. Keeps the record as the authoritative config (without a
    /// bundle) and tells the agent to stand down.
    pub async fn link_manually(&mut self) -> Result<(), SessionError> {
        self.sync_record();
        self.state.step = LinkingStep::None;
        self.state.in_flight = false;
        self.already_configured = true;
        info!(session = %self.session_id, "switching to manual configuration");
        self.sender.send_client(ClientEvent::Cancel).await?;
        Ok(())
    }

    /// Drop the credential bundle and the whole configuration list, and
    /// persist the empty list. A configured state that went through an
    /// error cannot be trusted, so in that case the host is also asked to
    /// close the dialog.
    pub async fn unlink(&mut self) -> Result<(), SessionError> {
        if self.config.is_empty() {
            return Err(SessionError::NotConfigured);
        }
        info!(session = %self.session_id, plugin = %self.plugin_id, "unlinking account");
        self.record.google_auth = None;
        self.config.clear();
        let _ = self.persist().await;

        let was_error = self.state.error;
        self.state = SessionState::idle();
        self.already_configured = false;
        if was_error {
            let _ = self.notices.send(Notice::CloseRequested);
        }
        Ok(())
    }

    /// Persist the working record as-is and ask the host to dismiss the
    /// dialog. Used by the manual-configuration path once the user is
    /// done with the schema form.
    pub async fn save_and_close(&mut self) -> Result<(), SessionError> {
        self.sync_record();
        let _ = self.persist().await;
        let _ = self.notices.send(Notice::CloseRequested);
        let _ = self.notices.send(Notice::ConfigUpdated);
        Ok(())
    }

    /// Release the channel. Idempotent; also runs on drop so the server
    /// side is freed even if the host forgets to call it.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sender.close();
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
        }
        info!(session = %self.session_id, "linking session closed");
    }

    /// Next decodable inbound agent event; `None` once the channel is
    /// done. Undecodable events are logged and skipped.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.next().await {
                None => return None,
                Some(raw) => match AgentEvent::try_from(&raw) {
                    Ok(event) => return Some(event),
                    Err(err) => {
                        warn!(session = %self.session_id, error = %err, "ignoring undecodable event");
                    }
                },
            }
        }
    }

    pub(crate) fn take_receiver(&mut self) -> Option<EventReceiver> {
        self.receiver.take()
    }

    fn sync_record(&mut self) {
        self.record.platform = self.alias.clone();
        if self.config.is_empty() {
            self.config.push(self.record.clone());
        } else {
            self.config[0] = self.record.clone();
        }
    }

    async fn persist(&mut self) -> Result<(), ConfigError> {
        match self.store.save(&self.plugin_id, &self.config).await {
            Ok(()) => {
                info!(session = %self.session_id, plugin = %self.plugin_id, "plugin config saved");
                let _ = self.notices.send(Notice::ConfigSaved);
                Ok(())
            }
            Err(err) => {
                // fire-and-report; the in-memory record stays as mutated
                error!(session = %self.session_id, error = %err, "failed to save plugin config");
                let _ = self.notices.send(Notice::ConfigSaveFailed(err.to_string()));
                Err(err)
            }
        }
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
enum Command {
    StartLinking(oneshot::Sender<Result<(), SessionError>>),
    SubmitStep(String, oneshot::Sender<Result<(), SessionError>>),
    LinkManually(oneshot::Sender<Result<(), SessionError>>),
    Unlink(oneshot::Sender<Result<(), SessionError>>),
    SaveAndClose(oneshot::Sender<Result<(), SessionError>>),
    Close(oneshot::Sender<()>),
}

/// Handle to a session actor spawned by [`open_session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    view_rx: watch::Receiver<LinkView>,
    notices: broadcast::Sender<Notice>,
}

impl SessionHandle {
    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    pub async fn start_linking(&self) -> Result<(), SessionError> {
        self.call(Command::StartLinking).await
    }

    pub async fn submit_step(&self, value: impl Into<String>) -> Result<(), SessionError> {
        let value = value.into();
        self.call(move |tx| Command::SubmitStep(value, tx)).await
    }

    pub async fn link_manually(&self) -> Result<(), SessionError> {
        self.call(Command::LinkManually).await
    }

    pub async fn unlink(&self) -> Result<(), SessionError> {
        self.call(Command::Unlink).await
    }

    pub async fn save_and_close(&self) -> Result<(), SessionError> {
        self.call(Command::SaveAndClose).await
    }

    /// Latest published view.
    pub fn view(&self) -> LinkView {
        self.view_rx.borrow().clone()
    }

    /// Wait for the next view change and return it.
    pub async fn view_changed(&mut self) -> Result<LinkView, SessionError> {
        self.view_rx
            .changed()
            .await
            .map_err(|_| SessionError::SessionGone)?;
        Ok(self.view_rx.borrow().clone())
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Tear the session down and release the channel.
    pub async fn close(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close(tx))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }
}

/// Spawn the session event loop and return its handle.
///
/// The loop owns the session; user commands and inbound agent events are
/// applied one at a time, so each transition is atomic with respect to
/// every other. A fresh [`LinkView`] is published after every mutation.
/// When the last handle drops, the loop shuts down and the channel is
/// closed, exactly once.
pub fn open_session(mut session: LinkSession) -> SessionHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);
    let (view_tx, view_rx) = watch::channel(session.view());
    let notices = session.notice_hub();

    tokio::spawn(async move {
        let mut inbound = session.take_receiver();
        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::StartLinking(reply)) => {
                            let _ = reply.send(session.start_linking().await);
                        }
                        Some(Command::SubmitStep(value, reply)) => {
                            let _ = reply.send(session.submit_step(&value).await);
                        }
                        Some(Command::LinkManually(reply)) => {
                            let _ = reply.send(session.link_manually().await);
                        }
                        Some(Command::Unlink(reply)) => {
                            let _ = reply.send(session.unlink().await);
                        }
                        Some(Command::SaveAndClose(reply)) => {
                            let _ = reply.send(session.save_and_close().await);
                        }
                        Some(Command::Close(reply)) => {
                            inbound = None;
                            session.close();
                            let _ = reply.send(());
                            view_tx.send_replace(session.view());
                            break;
                        }
                        None => {
                            // every handle dropped
                            inbound = None;
                            session.close();
                            break;
                        }
                    }
                    view_tx.send_replace(session.view());
                }
                event = next_inbound(&mut inbound), if inbound.is_some() => {
                    match event {
                        Some(event) => session.handle_event(event).await,
                        None => inbound = None,
                    }
                    view_tx.send_replace(session.view());
                }
            }
        }
    });

    SessionHandle {
        cmd_tx,
        view_rx,
        notices,
    }
}

async fn next_inbound(receiver: &mut Option<EventReceiver>) -> Option<AgentEvent> {
    loop {
        let rx = receiver.as_mut()?;
        match rx.next().await {
            None => return None,
            Some(raw) => match AgentEvent::try_from(&raw) {
                Ok(event) => return Some(event),
                Err(err) => warn!(error = %err, "ignoring undecodable event"),
            },
        }
    }
}
