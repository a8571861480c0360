// Conversation session: the message log of the one open chat.
//
// Pure state machine. `AppCore` drives it from actions and internal events and
// performs the network side effects it asks for. Every async result carries
// the generation (or listener id) it was issued for, and anything stale is
// dropped here.

use std::collections::{HashMap, HashSet};

use crate::backend::RemoteMessage;
use crate::state::{
    ChatMessage, ChatViewState, ConversationTarget, MessageDeliveryState, ReceiverType,
};

pub(super) const TEMP_ID_PREFIX: &str = "temp-";

// A server record can only stand in for a pending send if it is not older than
// the send itself, give or take clock skew between device and backend.
const ECHO_CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum HistoryStatus {
    Loading,
    Loaded,
    Failed { reason: String },
}

/// Work `AppCore` has to put on the wire after a successful `begin_send`/`retry_send`.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct OutgoingSend {
    pub(super) generation: u64,
    pub(super) temp_id: String,
    pub(super) target: ConversationTarget,
    pub(super) text: String,
}

#[derive(Debug)]
struct OpenConversation {
    target: ConversationTarget,
    title: String,
    me: String,
    listener_id: String,
    history: HistoryStatus,
    subscription_error: Option<String>,
    log: Vec<ChatMessage>,
    // temp id -> server id of the echo that took its slot before the ack
    echoed: HashMap<String, String>,
}

impl OpenConversation {
    /// Ack for a send whose entry an echo (or history page) already replaced.
    fn settle_echoed(&mut self, temp_id: &str, result: Result<RemoteMessage, String>) -> bool {
        // Discarded while in flight.
        let Some(claimed) = self.echoed.remove(temp_id) else {
            return false;
        };
        let Ok(remote) = result else {
            return false;
        };
        if remote.id == claimed || self.log.iter().any(|m| m.id == remote.id) {
            return false;
        }
        // The echo belonged to an identical send that is still pending; this
        // ack names the record that slot really holds.
        let Some(slot) = self.log.iter().position(|m| m.id == claimed) else {
            return false;
        };
        self.log[slot] = chat_message_from_remote(remote, &self.me, MessageDeliveryState::Sent);
        true
    }
}

#[derive(Debug, Default)]
pub(super) struct ConversationSession {
    open: Option<OpenConversation>,
    generation: u64,
    // Never reset, so temp ids stay unique for the lifetime of the app.
    temp_seq: u64,
}

/// Does `msg` belong to the conversation with `target`?
///
/// User chats match the peer's direct messages to us and anything addressed to
/// the peer (our own sends from another device). Group chats match on the
/// receiver id alone.
pub(super) fn belongs_to(target: &ConversationTarget, msg: &RemoteMessage) -> bool {
    match target {
        ConversationTarget::User { uid } => {
            (msg.sender_uid == *uid && msg.receiver_type == ReceiverType::User)
                || msg.receiver_id == *uid
        }
        ConversationTarget::Group { guid } => msg.receiver_id == *guid,
    }
}

/// Index of the pending send that `msg` (a server record of our own) stands
/// for: same receiver, same text, oldest first.
fn pending_slot(log: &[ChatMessage], me: &str, msg: &RemoteMessage) -> Option<usize> {
    if msg.sender_uid != me {
        return None;
    }
    log.iter().position(|m| {
        m.id.starts_with(TEMP_ID_PREFIX)
            && m.delivery == MessageDeliveryState::Pending
            && m.receiver_type == msg.receiver_type
            && m.receiver_id == msg.receiver_id
            && m.text == msg.text
            && msg.sent_at >= m.sent_at - ECHO_CLOCK_SKEW_SECS
    })
}

pub(super) fn chat_message_from_remote(
    remote: RemoteMessage,
    me: &str,
    delivery: MessageDeliveryState,
) -> ChatMessage {
    ChatMessage {
        is_mine: remote.sender_uid == me,
        id: remote.id,
        text: remote.text,
        sender_uid: remote.sender_uid,
        receiver_type: remote.receiver_type,
        receiver_id: remote.receiver_id,
        sent_at: remote.sent_at,
        delivery,
    }
}

impl ConversationSession {
    pub(super) fn generation(&self) -> u64 {
        self.generation
    }

    pub(super) fn target(&self) -> Option<&ConversationTarget> {
        self.open.as_ref().map(|o| &o.target)
    }

    pub(super) fn listener_id(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.listener_id.as_str())
    }

    pub(super) fn messages(&self) -> &[ChatMessage] {
        self.open.as_ref().map(|o| o.log.as_slice()).unwrap_or(&[])
    }

    pub(super) fn history_status(&self) -> Option<&HistoryStatus> {
        self.open.as_ref().map(|o| &o.history)
    }

    /// Start a conversation with `target`. Returns the generation that the
    /// history fetch and subscription must report back with, plus the
    /// listener id of the previous conversation, which the caller must
    /// unsubscribe before registering `listener_id`.
    pub(super) fn open(
        &mut self,
        target: ConversationTarget,
        title: String,
        me: String,
        listener_id: String,
    ) -> (u64, Option<String>) {
        let released = self.close();
        self.open = Some(OpenConversation {
            target,
            title,
            me,
            listener_id,
            history: HistoryStatus::Loading,
            subscription_error: None,
            log: Vec::new(),
            echoed: HashMap::new(),
        });
        (self.generation, released)
    }

    /// Drop the log and hand back the listener id to unsubscribe. Safe to call
    /// repeatedly; every call invalidates in-flight results.
    pub(super) fn close(&mut self) -> Option<String> {
        self.generation = self.generation.wrapping_add(1);
        self.open.take().map(|o| o.listener_id)
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut OpenConversation> {
        if generation != self.generation {
            return None;
        }
        self.open.as_mut()
    }

    /// Install a history page. The page becomes a chronological prefix; any
    /// live or optimistic entries that arrived while the fetch was in flight
    /// stay after it. Returns false for stale generations.
    pub(super) fn apply_history(
        &mut self,
        generation: u64,
        result: Result<Vec<RemoteMessage>, String>,
    ) -> bool {
        let Some(conv) = self.current_mut(generation) else {
            return false;
        };
        match result {
            Ok(mut page) => {
                // Stable: equal timestamps keep the backend's order.
                page.sort_by_key(|m| m.sent_at);
                let mut seen = HashSet::new();
                let mut live = std::mem::take(&mut conv.log);
                let mut log = Vec::with_capacity(page.len() + live.len());
                for m in page {
                    if !seen.insert(m.id.clone()) {
                        continue;
                    }
                    // A send that landed before the page was read is in it already.
                    if let Some(i) = pending_slot(&live, &conv.me, &m) {
                        let temp = live.remove(i);
                        conv.echoed.insert(temp.id, m.id.clone());
                    }
                    log.push(chat_message_from_remote(m, &conv.me, MessageDeliveryState::Sent));
                }
                log.extend(live.into_iter().filter(|m| !seen.contains(&m.id)));
                conv.log = log;
                conv.history = HistoryStatus::Loaded;
            }
            Err(reason) => {
                conv.history = HistoryStatus::Failed { reason };
            }
        }
        true
    }

    /// Re-run a failed history fetch without touching the subscription.
    pub(super) fn retry_history(&mut self) -> Option<(u64, ConversationTarget)> {
        let generation = self.generation;
        let conv = self.open.as_mut()?;
        if !matches!(conv.history, HistoryStatus::Failed { .. }) {
            return None;
        }
        conv.history = HistoryStatus::Loading;
        Some((generation, conv.target.clone()))
    }

    pub(super) fn subscription_failed(&mut self, generation: u64, listener_id: &str, reason: String) -> bool {
        let Some(conv) = self.current_mut(generation) else {
            return false;
        };
        if conv.listener_id != listener_id {
            return false;
        }
        conv.subscription_error = Some(reason);
        true
    }

    /// Optimistically append `text` as a pending message from `me`. Blank text
    /// or no open conversation is a no-op.
    pub(super) fn begin_send(&mut self, text: &str, now: i64) -> Option<OutgoingSend> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let generation = self.generation;
        let conv = self.open.as_mut()?;
        self.temp_seq = self.temp_seq.wrapping_add(1);
        let temp_id = format!("{TEMP_ID_PREFIX}{}", self.temp_seq);
        conv.log.push(ChatMessage {
            id: temp_id.clone(),
            text: text.to_string(),
            sender_uid: conv.me.clone(),
            receiver_type: conv.target.receiver_type(),
            receiver_id: conv.target.id().to_string(),
            sent_at: now,
            is_mine: true,
            delivery: MessageDeliveryState::Pending,
        });
        Some(OutgoingSend {
            generation,
            temp_id,
            target: conv.target.clone(),
            text: text.to_string(),
        })
    }

    /// Reconcile a send result with the entry carrying `temp_id`.
    ///
    /// On success the entry is replaced in place by the server record. If the
    /// feed echo of this send already took the entry's slot, the ack is a
    /// no-op. If an echo was matched to the wrong one of two identical
    /// pending sends, the slots are handed back so every send still owns
    /// exactly one entry.
    pub(super) fn complete_send(
        &mut self,
        generation: u64,
        temp_id: &str,
        result: Result<RemoteMessage, String>,
    ) -> bool {
        let Some(conv) = self.current_mut(generation) else {
            return false;
        };
        let Some(mut idx) = conv.log.iter().position(|m| m.id == temp_id) else {
            return conv.settle_echoed(temp_id, result);
        };
        match result {
            Ok(remote) => {
                let confirmed =
                    chat_message_from_remote(remote, &conv.me, MessageDeliveryState::Sent);
                if let Some(j) = conv
                    .log
                    .iter()
                    .position(|m| m.id == confirmed.id)
                    .filter(|j| *j != idx)
                {
                    let claimant = conv
                        .echoed
                        .iter()
                        .find(|(_, server_id)| **server_id == confirmed.id)
                        .map(|(t, _)| t.clone());
                    match claimant {
                        Some(other_temp) => {
                            // Our echo was taken for another pending send; give
                            // that send its optimistic entry back.
                            conv.echoed.remove(&other_temp);
                            conv.log[j].id = other_temp;
                            conv.log[j].delivery = MessageDeliveryState::Pending;
                        }
                        None => {
                            conv.log.remove(j);
                            if j < idx {
                                idx -= 1;
                            }
                        }
                    }
                }
                conv.log[idx] = confirmed;
            }
            Err(reason) => {
                conv.log[idx].delivery = MessageDeliveryState::Failed { reason };
            }
        }
        true
    }

    /// Put a failed optimistic entry back to pending and re-send it under the
    /// same temporary id.
    pub(super) fn retry_send(&mut self, message_id: &str) -> Option<OutgoingSend> {
        let generation = self.generation;
        let conv = self.open.as_mut()?;
        let entry = conv.log.iter_mut().find(|m| m.id == message_id)?;
        if !entry.id.starts_with(TEMP_ID_PREFIX)
            || !matches!(entry.delivery, MessageDeliveryState::Failed { .. })
        {
            return None;
        }
        entry.delivery = MessageDeliveryState::Pending;
        Some(OutgoingSend {
            generation,
            temp_id: entry.id.clone(),
            target: conv.target.clone(),
            text: entry.text.clone(),
        })
    }

    /// Remove a failed entry the user gave up on.
    pub(super) fn discard(&mut self, message_id: &str) -> bool {
        let Some(conv) = self.open.as_mut() else {
            return false;
        };
        let before = conv.log.len();
        conv.log.retain(|m| {
            !(m.id == message_id && matches!(m.delivery, MessageDeliveryState::Failed { .. }))
        });
        conv.log.len() != before
    }

    /// Feed delivery. Dropped unless it came through the current listener,
    /// belongs to the open conversation and is not already in the log.
    pub(super) fn on_incoming(&mut self, listener_id: &str, msg: RemoteMessage) -> bool {
        let Some(conv) = self.open.as_mut() else {
            return false;
        };
        if conv.listener_id != listener_id {
            return false;
        }
        if !belongs_to(&conv.target, &msg) {
            return false;
        }
        if conv.log.iter().any(|m| m.id == msg.id) {
            return false;
        }
        let slot = pending_slot(&conv.log, &conv.me, &msg);
        let message = chat_message_from_remote(msg, &conv.me, MessageDeliveryState::Sent);
        match slot {
            // Our own send echoed back before its ack: it takes the pending slot.
            Some(idx) => {
                let server_id = message.id.clone();
                let temp = std::mem::replace(&mut conv.log[idx], message);
                conv.echoed.insert(temp.id, server_id);
            }
            None => conv.log.push(message),
        }
        true
    }

    pub(super) fn view(&self) -> Option<ChatViewState> {
        let conv = self.open.as_ref()?;
        let (is_loading, load_error) = match &conv.history {
            HistoryStatus::Loading => (true, None),
            HistoryStatus::Loaded => (false, None),
            HistoryStatus::Failed { reason } => (false, Some(reason.clone())),
        };
        Some(ChatViewState {
            target: conv.target.clone(),
            title: conv.title.clone(),
            messages: conv.log.clone(),
            is_loading,
            load_error,
            subscription_error: conv.subscription_error.clone(),
        })
    }
}
