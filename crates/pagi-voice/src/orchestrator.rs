//! Voice Orchestrator: the conversation state machine.
//!
//! Ties the recognizer, the chat layer and the TTS engine together on one worker task. Every
//! transition happens on that task, fed by a command channel plus the recognition results, TTS
//! events and chat activity streams. Chat sends and aborts run on a separate dispatcher task and
//! report back over a channel, so commands are handled while the gateway is slow.
//!
//! ```text
//!   start()          final transcript          first sentence
//! Idle ──────► Listening ──────────► Processing ──────────► Speaking
//!                 ▲  ▲                                   │   │
//!                 │  └────────── barge-in (partial) ─────┘   │
//!                 └──────────── TTS completed ───────────────┘
//! ```

use crate::error::{VoiceError, VoiceResult};
use crate::focus::AudioFocus;
use crate::recognizer::{RecognitionResult, SpeechRecognitionEngine};
use crate::sentence::SentenceSplitter;
use crate::tts::{TextToSpeechEngine, TtsEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What the orchestrator sees of the chat layer's current run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    /// Cumulative reply text of the current run.
    pub streaming_text: Option<String>,
    pub processing: bool,
    pub error: Option<String>,
}

/// Sends user text and streams the reply back.
#[async_trait]
pub trait ChatLayer: Send + Sync {
    /// Dispatch `text`; returns the run id.
    async fn send_message(&self, text: &str) -> VoiceResult<String>;

    fn activity(&self) -> watch::Receiver<ChatSnapshot>;

    fn is_processing(&self) -> bool;

    /// Abandon the current run.
    async fn abort(&self) -> VoiceResult<()>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Partial length that counts as the user talking over the reply (default: 3)
    pub min_barge_in_chars: usize,
    /// Grace period before listening again while speaking (default: 500ms)
    pub rearm_delay: Duration,
    /// How long a transient status stays visible (default: 3s)
    pub status_clear: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_barge_in_chars: 3,
            rearm_delay: Duration::from_millis(500),
            status_clear: Duration::from_secs(3),
        }
    }
}

/// Whether `partial` should cut off the reply in `state`.
pub fn is_barge_in(state: VoiceState, partial: &str, min_chars: usize) -> bool {
    state == VoiceState::Speaking && partial.trim().chars().count() >= min_chars
}

enum Command {
    Start(oneshot::Sender<VoiceResult<()>>),
    Pause(oneshot::Sender<VoiceResult<()>>),
    Resume(oneshot::Sender<VoiceResult<()>>),
    Stop(oneshot::Sender<VoiceResult<()>>),
    Submit(String, oneshot::Sender<VoiceResult<()>>),
}

/// Chat calls run off the worker, one at a time, so an abort always lands after the send it
/// follows.
enum ChatRequest {
    Send { turn: u64, text: String },
    Abort,
}

type SendOutcome = (u64, VoiceResult<String>);

async fn dispatch_chat(
    chat: Arc<dyn ChatLayer>,
    mut requests: mpsc::Receiver<ChatRequest>,
    outcomes: mpsc::Sender<SendOutcome>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        match request {
            ChatRequest::Send { turn, text } => {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = chat.send_message(&text) => result,
                };
                if outcomes.send((turn, result)).await.is_err() {
                    break;
                }
            }
            ChatRequest::Abort => {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = chat.abort() => result,
                };
                if let Err(e) = result {
                    warn!("Failed to abort chat run: {}", e);
                }
            }
        }
    }
    debug!("Chat dispatcher stopped");
}

/// Handle to the orchestrator worker. Dropping it stops the conversation.
pub struct VoiceOrchestrator {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<VoiceState>,
    conversation: watch::Receiver<Vec<ConversationEntry>>,
    partial: watch::Receiver<Option<String>>,
    status: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
}

impl VoiceOrchestrator {
    pub fn new(
        recognizer: Arc<SpeechRecognitionEngine>,
        tts: Arc<TextToSpeechEngine>,
        chat: Arc<dyn ChatLayer>,
        focus: Arc<dyn AudioFocus>,
        config: OrchestratorConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(VoiceState::Idle);
        let (conversation_tx, conversation) = watch::channel(Vec::new());
        let (partial_tx, partial) = watch::channel(None);
        let (status_tx, status) = watch::channel(None);
        let cancel = CancellationToken::new();
        let (chat_requests, request_rx) = mpsc::channel(CHAT_QUEUE);
        let (outcome_tx, send_outcomes) = mpsc::channel(CHAT_QUEUE);

        let worker = Worker {
            results: recognizer.subscribe(),
            tts_events: tts.subscribe(),
            chat_activity: chat.activity(),
            chat_requests,
            send_outcomes,
            next_turn: 0,
            recognizer,
            tts,
            focus,
            config,
            state: state_tx,
            conversation: conversation_tx,
            partial: partial_tx,
            status: status_tx,
            turn: None,
            focus_held: false,
            paused_from: None,
            rearm_at: None,
            status_clear_at: None,
            relisten_on_clear: false,
        };
        tokio::spawn(dispatch_chat(chat, request_rx, outcome_tx, cancel.clone()));
        tokio::spawn(worker.run(command_rx, cancel.clone()));

        Self {
            commands,
            state,
            conversation,
            partial,
            status,
            cancel,
        }
    }

    async fn call(
        &self,
        make: impl FnOnce(oneshot::Sender<VoiceResult<()>>) -> Command,
    ) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| VoiceError::Cancelled)?;
        rx.await.map_err(|_| VoiceError::Cancelled)?
    }

    /// Acquire audio focus and start listening.
    pub async fn start(&self) -> VoiceResult<()> {
        self.call(Command::Start).await
    }

    pub async fn pause(&self) -> VoiceResult<()> {
        self.call(Command::Pause).await
    }

    pub async fn resume(&self) -> VoiceResult<()> {
        self.call(Command::Resume).await
    }

    pub async fn stop(&self) -> VoiceResult<()> {
        self.call(Command::Stop).await
    }

    /// Treat typed `text` as a final transcript.
    pub async fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        let text = text.into();
        self.call(move |reply| Command::Submit(text, reply)).await
    }

    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    pub fn conversation(&self) -> Vec<ConversationEntry> {
        self.conversation.borrow().clone()
    }

    pub fn watch_conversation(&self) -> watch::Receiver<Vec<ConversationEntry>> {
        self.conversation.clone()
    }

    pub fn partial_text(&self) -> Option<String> {
        self.partial.borrow().clone()
    }

    /// Transient status line, cleared automatically.
    pub fn status(&self) -> Option<String> {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<Option<String>> {
        self.status.clone()
    }
}

impl Drop for VoiceOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One user utterance and the reply it produced.
const CHAT_QUEUE: usize = 16;

#[derive(Debug, Default)]
struct Turn {
    id: u64,
    splitter: SentenceSplitter,
    /// Bytes of the cumulative reply already fed to the splitter.
    consumed: usize,
    reply: String,
    dispatched: bool,
    reply_done: bool,
    last_enqueued: Option<u64>,
    last_completed: u64,
}

impl Turn {
    fn speech_done(&self) -> bool {
        self.last_enqueued
            .map_or(true, |last| self.last_completed >= last)
    }
}

fn deadline(at: Option<Instant>) -> Instant {
    at.unwrap_or_else(Instant::now)
}

struct Worker {
    recognizer: Arc<SpeechRecognitionEngine>,
    tts: Arc<TextToSpeechEngine>,
    focus: Arc<dyn AudioFocus>,
    config: OrchestratorConfig,
    chat_requests: mpsc::Sender<ChatRequest>,
    send_outcomes: mpsc::Receiver<SendOutcome>,
    next_turn: u64,
    results: broadcast::Receiver<RecognitionResult>,
    tts_events: broadcast::Receiver<TtsEvent>,
    chat_activity: watch::Receiver<ChatSnapshot>,
    state: watch::Sender<VoiceState>,
    conversation: watch::Sender<Vec<ConversationEntry>>,
    partial: watch::Sender<Option<String>>,
    status: watch::Sender<Option<String>>,
    turn: Option<Turn>,
    focus_held: bool,
    /// State to restore on resume.
    paused_from: Option<VoiceState>,
    rearm_at: Option<Instant>,
    status_clear_at: Option<Instant>,
    /// Restart recognition when the current status clears.
    relisten_on_clear: bool,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut chat_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                result = self.results.recv() => match result {
                    Ok(result) => self.on_recognition(result).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} recognition results", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = self.tts_events.recv() => match event {
                    Ok(event) => self.on_tts(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} TTS events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some((turn, result)) = self.send_outcomes.recv() => {
                    self.on_sent(turn, result).await;
                },
                changed = self.chat_activity.changed(), if chat_open => match changed {
                    Ok(()) => {
                        let snapshot = self.chat_activity.borrow_and_update().clone();
                        self.on_chat(snapshot).await;
                    }
                    Err(_) => {
                        warn!("Chat layer closed its activity stream");
                        chat_open = false;
                    }
                },
                _ = tokio::time::sleep_until(deadline(self.rearm_at)), if self.rearm_at.is_some() => {
                    self.rearm_at = None;
                    if self.current() == VoiceState::Speaking {
                        debug!("👂 Re-armed listening for barge-in");
                        self.recognizer.start_listening();
                    }
                },
                _ = tokio::time::sleep_until(deadline(self.status_clear_at)), if self.status_clear_at.is_some() => {
                    self.status_clear_at = None;
                    self.status.send_replace(None);
                    if std::mem::take(&mut self.relisten_on_clear)
                        && self.current() == VoiceState::Listening
                    {
                        self.recognizer.start_listening();
                    }
                },
            }
        }
        self.teardown().await;
    }

    fn current(&self) -> VoiceState {
        *self.state.borrow()
    }

    fn set_state(&self, state: VoiceState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("🎭 {:?} → {:?}", previous, state);
        }
    }

    fn show_status(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.status.send_replace(Some(message));
        self.status_clear_at = Some(Instant::now() + self.config.status_clear);
    }

    fn append(&self, role: Role, text: &str) {
        let entry = ConversationEntry::new(role, text);
        self.conversation.send_modify(|log| log.push(entry));
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Pause(reply) => {
                self.pause().await;
                let _ = reply.send(Ok(()));
            }
            Command::Resume(reply) => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
            }
            Command::Submit(text, reply) => {
                let result = match self.current() {
                    VoiceState::Idle | VoiceState::Paused => Err(VoiceError::Chat(
                        "voice session is not active".to_string(),
                    )),
                    VoiceState::Listening => {
                        self.on_final(text);
                        Ok(())
                    }
                    VoiceState::Processing | VoiceState::Speaking => {
                        self.barge_in().await;
                        self.on_final(text);
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
        }
    }

    fn start(&mut self) -> VoiceResult<()> {
        if self.current() != VoiceState::Idle {
            return Ok(());
        }
        if !self.focus.acquire() {
            self.show_status("Audio focus unavailable");
            return Err(VoiceError::AudioFocusDenied);
        }
        self.focus_held = true;
        self.recognizer.start_listening();
        self.set_state(VoiceState::Listening);
        info!("🎙️ Voice session started");
        Ok(())
    }

    async fn pause(&mut self) {
        let state = self.current();
        if matches!(state, VoiceState::Idle | VoiceState::Paused) {
            return;
        }
        self.recognizer.stop_listening();
        self.rearm_at = None;
        if state == VoiceState::Speaking {
            if let Err(e) = self.tts.pause().await {
                warn!("Failed to pause speech: {}", e);
            }
        }
        self.release_focus();
        self.paused_from = Some(state);
        self.set_state(VoiceState::Paused);
    }

    async fn resume(&mut self) -> VoiceResult<()> {
        if self.current() != VoiceState::Paused {
            return Ok(());
        }
        if !self.focus.acquire() {
            self.show_status("Audio focus unavailable");
            return Err(VoiceError::AudioFocusDenied);
        }
        self.focus_held = true;

        match self.paused_from.take() {
            Some(VoiceState::Speaking) => {
                if let Err(e) = self.tts.resume().await {
                    warn!("Failed to resume speech: {}", e);
                }
                self.set_state(VoiceState::Speaking);
                self.rearm_at = Some(Instant::now() + self.config.rearm_delay);
            }
            Some(VoiceState::Processing) => {
                self.recognizer.start_listening();
                self.set_state(VoiceState::Processing);
            }
            _ => {
                self.recognizer.start_listening();
                self.set_state(VoiceState::Listening);
            }
        }

        // Catch up on reply text that arrived while paused.
        let snapshot = self.chat_activity.borrow_and_update().clone();
        self.on_chat(snapshot).await;
        self.finish_turn_if_done();
        Ok(())
    }

    fn release_focus(&mut self) {
        if std::mem::take(&mut self.focus_held) {
            self.focus.release();
        }
    }

    async fn teardown(&mut self) {
        self.recognizer.stop_listening();
        if let Err(e) = self.tts.interrupt().await {
            debug!("TTS already stopped: {}", e);
        }
        if self.turn.take().is_some() {
            self.request_chat(ChatRequest::Abort);
        }
        self.release_focus();
        self.paused_from = None;
        self.rearm_at = None;
        self.status_clear_at = None;
        self.relisten_on_clear = false;
        self.partial.send_replace(None);
        self.status.send_replace(None);
        self.set_state(VoiceState::Idle);
    }

    async fn on_recognition(&mut self, result: RecognitionResult) {
        let state = self.current();
        match result {
            RecognitionResult::Partial(text) => {
                if matches!(state, VoiceState::Idle | VoiceState::Paused) {
                    return;
                }
                if is_barge_in(state, &text, self.config.min_barge_in_chars) {
                    info!("✋ Barge-in: {:?}", text);
                    self.barge_in().await;
                }
                self.partial.send_replace(Some(text));
            }
            RecognitionResult::Final(text) => match state {
                VoiceState::Listening => self.on_final(text),
                VoiceState::Speaking
                    if is_barge_in(state, &text, self.config.min_barge_in_chars) =>
                {
                    info!("✋ Barge-in with final transcript: {:?}", text);
                    self.barge_in().await;
                    self.on_final(text);
                }
                _ => debug!("Ignoring transcript in {:?}: {:?}", state, text),
            },
            RecognitionResult::Error { code, message } => {
                if state == VoiceState::Listening {
                    debug!(code = %code, "Recognition gave up");
                    self.show_status(message);
                    self.relisten_on_clear = true;
                }
            }
        }
    }

    fn on_final(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        self.partial.send_replace(None);
        self.append(Role::User, &text);
        self.set_state(VoiceState::Processing);
        self.next_turn += 1;
        let turn = self.next_turn;
        self.turn = Some(Turn {
            id: turn,
            ..Turn::default()
        });
        self.request_chat(ChatRequest::Send { turn, text });
    }

    fn request_chat(&mut self, request: ChatRequest) {
        use mpsc::error::TrySendError;

        if let Err(e) = self.chat_requests.try_send(request) {
            warn!("Chat dispatcher unavailable: {}", e);
            let lost_send = matches!(
                e,
                TrySendError::Full(ChatRequest::Send { .. })
                    | TrySendError::Closed(ChatRequest::Send { .. })
            );
            if lost_send {
                self.turn = None;
                self.show_status("Message could not be sent");
                self.set_state(VoiceState::Listening);
            }
        }
    }

    async fn on_sent(&mut self, turn_id: u64, result: VoiceResult<String>) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.id == turn_id) else {
            debug!(turn_id, "Send finished for an abandoned turn");
            return;
        };
        match result {
            Ok(run_id) => {
                debug!(run_id = %run_id, "Message dispatched");
                turn.dispatched = true;
                // Reply text may have streamed in while the send was in flight.
                let snapshot = self.chat_activity.borrow().clone();
                self.on_chat(snapshot).await;
            }
            Err(e) => {
                self.turn = None;
                self.show_status(format!("Message failed: {}", e));
                match self.current() {
                    VoiceState::Processing => self.set_state(VoiceState::Listening),
                    VoiceState::Paused => self.paused_from = Some(VoiceState::Listening),
                    _ => {}
                }
            }
        }
    }

    async fn barge_in(&mut self) {
        self.rearm_at = None;
        if let Err(e) = self.tts.interrupt().await {
            warn!("Failed to interrupt speech: {}", e);
        }
        if self.turn.take().is_some() {
            self.request_chat(ChatRequest::Abort);
        }
        self.recognizer.start_listening();
        self.set_state(VoiceState::Listening);
    }

    async fn on_chat(&mut self, snapshot: ChatSnapshot) {
        if self.current() == VoiceState::Paused {
            return;
        }
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if !turn.dispatched || turn.reply_done {
            return;
        }

        let text = snapshot.streaming_text.unwrap_or_default();
        let mut sentences = Vec::new();
        if let Some(fresh) = text.get(turn.consumed..) {
            if !fresh.is_empty() {
                sentences = turn.splitter.push(fresh);
                turn.consumed = text.len();
            }
        }

        if !snapshot.processing {
            sentences.extend(turn.splitter.flush());
            turn.reply_done = true;
            turn.reply = text.trim().to_string();
        }

        for sentence in sentences {
            self.enqueue(sentence).await;
        }

        if !snapshot.processing {
            if let Some(error) = snapshot.error {
                self.show_status(format!("Reply failed: {}", error));
            }
            let reply = self
                .turn
                .as_ref()
                .map(|t| t.reply.clone())
                .unwrap_or_default();
            if !reply.is_empty() {
                self.append(Role::Assistant, &reply);
            }
            self.finish_turn_if_done();
        }
    }

    async fn enqueue(&mut self, sentence: String) {
        let sequence = match self.tts.speak_chunk(&sentence).await {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!("Failed to queue sentence: {}", e);
                return;
            }
        };
        if let Some(turn) = self.turn.as_mut() {
            turn.last_enqueued = Some(sequence);
        }
        if self.current() == VoiceState::Processing {
            self.recognizer.stop_listening();
            self.partial.send_replace(None);
            self.set_state(VoiceState::Speaking);
            self.rearm_at = Some(Instant::now() + self.config.rearm_delay);
        }
    }

    fn on_tts(&mut self, event: TtsEvent) {
        match event {
            TtsEvent::SentenceStarted { sequence, text } => {
                debug!(sequence, "Speaking {:?}", text);
            }
            TtsEvent::Completed { last_sequence } => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.last_completed = turn.last_completed.max(last_sequence);
                }
                self.finish_turn_if_done();
            }
            TtsEvent::Interrupted => debug!("Speech interrupted"),
        }
    }

    fn finish_turn_if_done(&mut self) {
        if !matches!(
            self.current(),
            VoiceState::Processing | VoiceState::Speaking
        ) {
            return;
        }
        let done = self
            .turn
            .as_ref()
            .is_some_and(|turn| turn.reply_done && turn.speech_done());
        if !done {
            return;
        }
        self.turn = None;
        self.rearm_at = None;
        self.recognizer.start_listening();
        self.set_state(VoiceState::Listening);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barge_in_needs_three_characters_while_speaking() {
        assert!(is_barge_in(VoiceState::Speaking, "wait", 3));
        assert!(is_barge_in(VoiceState::Speaking, "hey", 3));
        assert!(!is_barge_in(VoiceState::Speaking, "uh", 3));
        assert!(!is_barge_in(VoiceState::Speaking, "  a  ", 3));
        assert!(!is_barge_in(VoiceState::Listening, "wait", 3));
        assert!(!is_barge_in(VoiceState::Processing, "wait", 3));
    }

    #[test]
    fn turn_without_speech_is_done_at_once() {
        let mut turn = Turn::default();
        assert!(turn.speech_done());
        turn.last_enqueued = Some(2);
        turn.last_completed = 1;
        assert!(!turn.speech_done());
        turn.last_completed = 2;
        assert!(turn.speech_done());
    }
}
