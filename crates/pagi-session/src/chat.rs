//! Chat layer over the gateway session: sends user text and assembles the streamed reply.
//!
//! The reply is published as a cumulative `ChatActivity` snapshot on a watch channel. `processing`
//! stays set from `send_message` until the gateway reports the run final, aborted or failed.
//!
//! Events are matched to runs by `runId`. Events that arrive before `chat.send` names its run are
//! held and replayed once the id is known; events of finished or aborted runs are dropped.

use crate::error::GatewayResult;
use crate::protocol::{message_text, AgentStream, ChatState, GatewayEvent};
use crate::session::GatewaySession;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_SESSION_KEY: &str = "main";
const CLOSED_RUNS_KEPT: usize = 32;
const MAX_UNCLAIMED_EVENTS: usize = 256;

/// Observable state of the current chat run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatActivity {
    pub run_id: Option<String>,
    /// Reply text received so far; `Some("")` right after sending.
    pub streaming_text: Option<String>,
    pub processing: bool,
    pub error: Option<String>,
}

/// One message from `chat.history`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMessage {
    pub role: String,
    pub text: String,
}

/// Run bookkeeping. Only locked inside the activity's watch lock.
#[derive(Debug, Default)]
struct RunLedger {
    /// Finished or aborted runs, newest last.
    closed: VecDeque<String>,
    /// Events received while the current `chat.send` was unanswered.
    unclaimed: Vec<GatewayEvent>,
    /// Bumped by every `send_message`.
    send_generation: u64,
    /// `abort` was called before the pending send named its run.
    abandoned: bool,
}

impl RunLedger {
    fn is_closed(&self, run_id: &str) -> bool {
        self.closed.iter().any(|r| r == run_id)
    }

    fn close(&mut self, run_id: String) {
        if self.is_closed(&run_id) {
            return;
        }
        if self.closed.len() == CLOSED_RUNS_KEPT {
            self.closed.pop_front();
        }
        self.closed.push_back(run_id);
    }
}

fn lock(ledger: &Mutex<RunLedger>) -> MutexGuard<'_, RunLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct GatewayChat {
    session: GatewaySession,
    activity: Arc<watch::Sender<ChatActivity>>,
    ledger: Arc<Mutex<RunLedger>>,
    cancel: CancellationToken,
}

impl GatewayChat {
    /// Attach to `session` and start tracking its chat/agent events. Needs a tokio runtime.
    pub fn new(session: GatewaySession) -> Self {
        let (tx, _) = watch::channel(ChatActivity::default());
        let activity = Arc::new(tx);
        let ledger = Arc::new(Mutex::new(RunLedger::default()));
        let cancel = CancellationToken::new();
        tokio::spawn(track_events(
            session.subscribe(),
            Arc::clone(&activity),
            Arc::clone(&ledger),
            cancel.clone(),
        ));
        Self {
            session,
            activity,
            ledger,
            cancel,
        }
    }

    fn session_key(&self) -> String {
        self.session
            .main_session_key()
            .unwrap_or_else(|| DEFAULT_SESSION_KEY.to_string())
    }

    /// Send user text; returns the run id assigned by the gateway.
    pub async fn send_message(&self, text: &str) -> GatewayResult<String> {
        let idempotency_key = Uuid::new_v4().to_string();
        let mut generation = 0;
        self.activity.send_modify(|a| {
            let mut ledger = lock(&self.ledger);
            if a.processing {
                if let Some(previous) = a.run_id.take() {
                    ledger.close(previous);
                }
            }
            ledger.unclaimed.clear();
            ledger.abandoned = false;
            ledger.send_generation += 1;
            generation = ledger.send_generation;
            *a = ChatActivity {
                run_id: None,
                streaming_text: Some(String::new()),
                processing: true,
                error: None,
            };
        });

        let params = json!({
            "sessionKey": self.session_key(),
            "message": text,
            "idempotencyKey": idempotency_key,
        });
        match self.session.request("chat.send", params).await {
            Ok(payload) => {
                let run_id = payload
                    .get("runId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(idempotency_key);
                info!(run_id = %run_id, "💬 Message sent to gateway");
                let mut abandoned = false;
                self.activity.send_if_modified(|a| {
                    let mut ledger = lock(&self.ledger);
                    if ledger.send_generation != generation || ledger.abandoned {
                        ledger.close(run_id.clone());
                        abandoned = true;
                        return false;
                    }
                    a.run_id = Some(run_id.clone());
                    for event in std::mem::take(&mut ledger.unclaimed) {
                        route_event(a, &mut ledger, &event);
                    }
                    true
                });
                if abandoned {
                    debug!(run_id = %run_id, "Run was aborted before it was named");
                    if let Err(e) = self.request_abort(&run_id).await {
                        warn!(run_id = %run_id, error = %e, "chat.abort failed");
                    }
                }
                Ok(run_id)
            }
            Err(e) => {
                warn!(error = %e, "chat.send failed");
                self.activity.send_if_modified(|a| {
                    let mut ledger = lock(&self.ledger);
                    if ledger.send_generation != generation || ledger.abandoned {
                        return false;
                    }
                    ledger.unclaimed.clear();
                    a.processing = false;
                    a.error = Some(e.to_string());
                    true
                });
                Err(e)
            }
        }
    }

    /// Recent messages of the main session.
    pub async fn history(&self, limit: usize) -> GatewayResult<Vec<HistoryMessage>> {
        let payload = self
            .session
            .request(
                "chat.history",
                json!({ "sessionKey": self.session_key(), "limit": limit }),
            )
            .await?;
        let messages = payload
            .get("messages")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| {
                        let role = m.get("role").and_then(Value::as_str)?.to_string();
                        Some(HistoryMessage {
                            role,
                            text: message_text(m).unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }

    /// Ask the gateway to stop the current run. No-op when nothing is running.
    pub async fn abort(&self) -> GatewayResult<()> {
        let mut target = None;
        self.activity.send_if_modified(|a| {
            if !a.processing {
                return false;
            }
            a.processing = false;
            let mut ledger = lock(&self.ledger);
            match a.run_id.clone() {
                Some(run_id) => {
                    ledger.close(run_id.clone());
                    target = Some(run_id);
                }
                // The pending send aborts its run once the gateway names it.
                None => {
                    ledger.abandoned = true;
                    ledger.unclaimed.clear();
                }
            }
            true
        });
        match target {
            Some(run_id) => self.request_abort(&run_id).await,
            None => Ok(()),
        }
    }

    async fn request_abort(&self, run_id: &str) -> GatewayResult<()> {
        debug!(run_id = %run_id, "Aborting chat run");
        self.session
            .request(
                "chat.abort",
                json!({ "sessionKey": self.session_key(), "runId": run_id }),
            )
            .await?;
        Ok(())
    }

    pub fn activity(&self) -> watch::Receiver<ChatActivity> {
        self.activity.subscribe()
    }

    pub fn is_processing(&self) -> bool {
        self.activity.borrow().processing
    }
}

impl Drop for GatewayChat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn track_events(
    mut events: broadcast::Receiver<GatewayEvent>,
    activity: Arc<watch::Sender<ChatActivity>>,
    ledger: Arc<Mutex<RunLedger>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Chat tracker lagged behind gateway events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        activity.send_if_modified(|a| route_event(a, &mut lock(&ledger), &event));
    }
}

fn event_run_id(event: &GatewayEvent) -> Option<&str> {
    match event {
        GatewayEvent::Chat(chat) => Some(&chat.run_id),
        GatewayEvent::Agent(agent) => Some(&agent.run_id),
        GatewayEvent::Other { .. } => None,
    }
}

/// Drop events of closed runs, hold events while the current run is unnamed, fold the rest.
fn route_event(activity: &mut ChatActivity, ledger: &mut RunLedger, event: &GatewayEvent) -> bool {
    let Some(run_id) = event_run_id(event) else {
        return false;
    };
    if ledger.is_closed(run_id) {
        debug!(run_id = %run_id, "Dropping event of a closed run");
        return false;
    }
    if activity.processing && activity.run_id.is_none() {
        if ledger.unclaimed.len() < MAX_UNCLAIMED_EVENTS {
            ledger.unclaimed.push(event.clone());
        } else {
            warn!(run_id = %run_id, "Too many events before chat.send answered; dropping");
        }
        return false;
    }

    let changed = apply_event(activity, event);
    if changed && !activity.processing {
        if let Some(finished) = activity.run_id.clone() {
            ledger.close(finished);
        }
    }
    changed
}

/// Fold one gateway event into the activity. Returns whether anything changed.
pub fn apply_event(activity: &mut ChatActivity, event: &GatewayEvent) -> bool {
    let run_id = match event {
        GatewayEvent::Chat(chat) => &chat.run_id,
        GatewayEvent::Agent(agent) => &agent.run_id,
        GatewayEvent::Other { .. } => return false,
    };
    if !activity.processing {
        return false;
    }
    // Events may arrive before the chat.send response names the run.
    if activity.run_id.as_deref().is_some_and(|current| current != run_id) {
        return false;
    }

    match event {
        GatewayEvent::Agent(agent) => match agent.stream {
            AgentStream::Assistant => {
                let text = activity.streaming_text.get_or_insert_with(String::new);
                if let Some(delta) = agent.delta() {
                    text.push_str(delta);
                    true
                } else if let Some(full) = agent.text() {
                    *text = full.to_string();
                    true
                } else {
                    false
                }
            }
            AgentStream::Error => {
                activity.processing = false;
                activity.error = Some(agent.error_message().unwrap_or("agent error").to_string());
                true
            }
            AgentStream::Tool | AgentStream::Lifecycle => false,
        },
        GatewayEvent::Chat(chat) => match chat.state {
            ChatState::Delta => match chat.message_text() {
                Some(snapshot)
                    if snapshot.len()
                        >= activity.streaming_text.as_ref().map_or(0, String::len) =>
                {
                    activity.streaming_text = Some(snapshot);
                    true
                }
                _ => false,
            },
            ChatState::Final => {
                let streamed = activity.streaming_text.as_deref().unwrap_or("");
                if streamed.is_empty() {
                    if let Some(text) = chat.message_text() {
                        activity.streaming_text = Some(text);
                    }
                }
                activity.processing = false;
                true
            }
            ChatState::Aborted => {
                activity.processing = false;
                true
            }
            ChatState::Error => {
                activity.processing = false;
                activity.error = Some(
                    chat.error_message
                        .clone()
                        .unwrap_or_else(|| "chat error".to_string()),
                );
                true
            }
        },
        GatewayEvent::Other { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentEvent, ChatEvent};

    fn processing() -> ChatActivity {
        ChatActivity {
            run_id: Some("run-1".into()),
            streaming_text: Some(String::new()),
            processing: true,
            error: None,
        }
    }

    fn assistant(run_id: &str, data: Value) -> GatewayEvent {
        GatewayEvent::Agent(AgentEvent {
            run_id: run_id.into(),
            stream: AgentStream::Assistant,
            data,
        })
    }

    fn chat(state: ChatState, message: Option<Value>) -> GatewayEvent {
        GatewayEvent::Chat(ChatEvent {
            run_id: "run-1".into(),
            session_key: Some("main".into()),
            state,
            message,
            error_message: None,
        })
    }

    #[test]
    fn assistant_deltas_accumulate_until_final() {
        let mut activity = processing();
        assert!(apply_event(&mut activity, &assistant("run-1", json!({"delta": "It's sunny."}))));
        assert!(apply_event(&mut activity, &assistant("run-1", json!({"delta": " Enjoy!"}))));
        assert_eq!(activity.streaming_text.as_deref(), Some("It's sunny. Enjoy!"));
        assert!(activity.processing);

        assert!(apply_event(&mut activity, &chat(ChatState::Final, None)));
        assert!(!activity.processing);
        assert_eq!(activity.streaming_text.as_deref(), Some("It's sunny. Enjoy!"));
    }

    #[test]
    fn other_runs_are_ignored() {
        let mut activity = processing();
        assert!(!apply_event(&mut activity, &assistant("run-2", json!({"delta": "nope"}))));
        assert_eq!(activity.streaming_text.as_deref(), Some(""));
    }

    #[test]
    fn final_without_stream_uses_message_text() {
        let mut activity = processing();
        let message = json!({"role": "assistant", "content": [{"type": "text", "text": "Done."}]});
        apply_event(&mut activity, &chat(ChatState::Final, Some(message)));
        assert_eq!(activity.streaming_text.as_deref(), Some("Done."));
        assert!(!activity.processing);
    }

    fn unnamed() -> ChatActivity {
        ChatActivity {
            run_id: None,
            ..processing()
        }
    }

    #[test]
    fn events_before_the_run_is_named_are_held() {
        let mut activity = unnamed();
        let mut ledger = RunLedger::default();
        let early = assistant("run-2", json!({"delta": "Fresh"}));
        assert!(!route_event(&mut activity, &mut ledger, &early));
        assert_eq!(ledger.unclaimed, vec![early]);
        assert_eq!(activity.streaming_text.as_deref(), Some(""));
    }

    #[test]
    fn closed_runs_are_dropped() {
        let mut activity = unnamed();
        let mut ledger = RunLedger::default();
        ledger.close("run-1".into());
        let stale = GatewayEvent::Chat(ChatEvent {
            run_id: "run-1".into(),
            session_key: None,
            state: ChatState::Final,
            message: Some(json!({"content": "stale tail of run one."})),
            error_message: None,
        });
        assert!(!route_event(&mut activity, &mut ledger, &stale));
        assert!(ledger.unclaimed.is_empty());
        assert!(activity.processing);
    }

    #[test]
    fn finished_runs_are_closed() {
        let mut activity = processing();
        let mut ledger = RunLedger::default();
        assert!(route_event(&mut activity, &mut ledger, &chat(ChatState::Final, None)));
        assert!(ledger.is_closed("run-1"));

        for n in 0..40 {
            ledger.close(format!("old-{}", n));
        }
        assert_eq!(ledger.closed.len(), CLOSED_RUNS_KEPT);
        assert!(!ledger.is_closed("run-1"));
        assert!(ledger.is_closed("old-39"));
    }

    #[test]
    fn errors_clear_processing() {
        let mut activity = processing();
        apply_event(
            &mut activity,
            &GatewayEvent::Agent(AgentEvent {
                run_id: "run-1".into(),
                stream: AgentStream::Error,
                data: json!({"message": "model overloaded"}),
            }),
        );
        assert!(!activity.processing);
        assert_eq!(activity.error.as_deref(), Some("model overloaded"));
    }
}
