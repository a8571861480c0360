// In-process backend: offline mode and the test harness.
//
// Holds users, groups and messages in memory and fans every stored message
// out to the registered feed listeners of the participants, including the
// sender's own listeners (multi-device echo).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AuthService, BackendError, BackendErrorKind, DirectoryService, FeedCallback, GroupRecord,
    MessagingService, RemoteMessage, SessionContext, UserRecord,
};
use crate::state::{now_seconds, ConversationTarget, ReceiverType};

/// Demo accounts the hosted backend ships with. The user list hides them.
const DEMO_USERS: &[(&str, &str)] = &[
    ("superhero1", "Iron Man"),
    ("superhero2", "Captain America"),
    ("superhero3", "Spiderman"),
    ("superhero4", "Wolverine"),
    ("superhero5", "Cyclops"),
];

struct LocalGroup {
    record: GroupRecord,
    members: BTreeSet<String>,
}

struct Listener {
    owner_uid: String,
    callback: FeedCallback,
}

#[derive(Default)]
struct LocalState {
    users: BTreeMap<String, UserRecord>,
    groups: BTreeMap<String, LocalGroup>,
    messages: Vec<RemoteMessage>,
    next_message_id: u64,
    next_token: u64,
    listeners: HashMap<String, Listener>,
    latency: Duration,
    history_delays: HashMap<String, Duration>,
    fail_next_send: Option<BackendError>,
    fail_next_history: Option<BackendError>,
    fail_next_subscribe: Option<BackendError>,
    send_calls: u64,
}

impl LocalState {
    fn is_participant(&self, uid: &str, msg: &RemoteMessage) -> bool {
        if msg.sender_uid == uid {
            return true;
        }
        match msg.receiver_type {
            ReceiverType::User => msg.receiver_id == uid,
            ReceiverType::Group => self
                .groups
                .get(&msg.receiver_id)
                .map(|g| g.members.contains(uid))
                .unwrap_or(false),
        }
    }

    fn store(&mut self, sender_uid: &str, target: &ConversationTarget, text: &str) -> RemoteMessage {
        self.next_message_id += 1;
        let msg = RemoteMessage {
            id: self.next_message_id.to_string(),
            text: text.to_string(),
            sender_uid: sender_uid.to_string(),
            receiver_type: target.receiver_type(),
            receiver_id: target.id().to_string(),
            sent_at: now_seconds(),
        };
        self.messages.push(msg.clone());
        msg
    }

    fn fanout_targets(&self, msg: &RemoteMessage) -> Vec<FeedCallback> {
        self.listeners
            .values()
            .filter(|l| self.is_participant(&l.owner_uid, msg))
            .map(|l| l.callback.clone())
            .collect()
    }

    fn check_target(&self, target: &ConversationTarget) -> Result<(), BackendError> {
        let known = match target {
            ConversationTarget::User { uid } => self.users.contains_key(uid),
            ConversationTarget::Group { guid } => self.groups.contains_key(guid),
        };
        if known {
            Ok(())
        } else {
            Err(BackendError::new(
                BackendErrorKind::InvalidRequest,
                format!("unknown receiver {}", target.id()),
            ))
        }
    }
}

#[derive(Default)]
pub struct LocalBackend {
    inner: Mutex<LocalState>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend pre-populated with the demo accounts and one group.
    pub fn with_demo_users() -> Self {
        let backend = Self::new();
        for (uid, name) in DEMO_USERS {
            backend.add_user(uid, name);
        }
        let members: Vec<&str> = DEMO_USERS.iter().map(|(uid, _)| *uid).collect();
        backend.add_group("supergroup", "Comic Heros' Hangout", &members);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn add_user(&self, uid: &str, name: &str) {
        self.lock().users.insert(
            uid.to_string(),
            UserRecord {
                uid: uid.to_string(),
                name: name.to_string(),
                avatar: None,
                status: Some("offline".to_string()),
            },
        );
    }

    pub fn set_user_status(&self, uid: &str, status: &str) {
        if let Some(user) = self.lock().users.get_mut(uid) {
            user.status = Some(status.to_string());
        }
    }

    pub fn add_group(&self, guid: &str, name: &str, members: &[&str]) {
        let members: BTreeSet<String> = members.iter().map(|m| m.to_string()).collect();
        self.lock().groups.insert(
            guid.to_string(),
            LocalGroup {
                record: GroupRecord {
                    guid: guid.to_string(),
                    name: name.to_string(),
                    members_count: members.len() as u32,
                },
                members,
            },
        );
    }

    pub fn add_group_member(&self, guid: &str, uid: &str) {
        if let Some(group) = self.lock().groups.get_mut(guid) {
            group.members.insert(uid.to_string());
            group.record.members_count = group.members.len() as u32;
        }
    }

    /// Store a message sent by `from_uid` from some other client and push it to
    /// every listening participant.
    pub fn deliver(&self, from_uid: &str, target: &ConversationTarget, text: &str) -> RemoteMessage {
        let (msg, callbacks) = {
            let mut st = self.lock();
            let msg = st.store(from_uid, target, text);
            let callbacks = st.fanout_targets(&msg);
            (msg, callbacks)
        };
        for cb in callbacks {
            cb(msg.clone());
        }
        msg
    }

    /// Push an already-stored message to listeners again (feed redelivery).
    pub fn redeliver(&self, message_id: &str) -> bool {
        let found = {
            let st = self.lock();
            st.messages
                .iter()
                .find(|m| m.id == message_id)
                .cloned()
                .map(|m| {
                    let callbacks = st.fanout_targets(&m);
                    (m, callbacks)
                })
        };
        let Some((msg, callbacks)) = found else {
            return false;
        };
        for cb in callbacks {
            cb(msg.clone());
        }
        true
    }

    pub fn fail_next_send(&self, reason: &str) {
        self.lock().fail_next_send = Some(BackendError::new(
            BackendErrorKind::ConnectionFailure,
            reason,
        ));
    }

    pub fn fail_next_history(&self, reason: &str) {
        self.lock().fail_next_history = Some(BackendError::new(
            BackendErrorKind::ConnectionFailure,
            reason,
        ));
    }

    pub fn fail_next_subscribe(&self, reason: &str) {
        self.lock().fail_next_subscribe = Some(BackendError::new(
            BackendErrorKind::ConnectionFailure,
            reason,
        ));
    }

    /// Delay applied to every async call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Extra delay for history fetches of one conversation id.
    pub fn delay_history_for(&self, target_id: &str, delay: Duration) {
        self.lock()
            .history_delays
            .insert(target_id.to_string(), delay);
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn send_count(&self) -> u64 {
        self.lock().send_calls
    }

    async fn simulate_latency(&self, extra: Duration) {
        let latency = self.lock().latency + extra;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl AuthService for LocalBackend {
    async fn create_user(&self, uid: &str, name: &str) -> Result<UserRecord, BackendError> {
        self.simulate_latency(Duration::ZERO).await;
        let mut st = self.lock();
        if uid.is_empty() || name.is_empty() {
            return Err(BackendError::new(
                BackendErrorKind::InvalidRequest,
                "uid and name are required",
            ));
        }
        if st.users.contains_key(uid) {
            return Err(BackendError::new(
                BackendErrorKind::UidAlreadyExists,
                format!("user {uid} already exists"),
            ));
        }
        let record = UserRecord {
            uid: uid.to_string(),
            name: name.to_string(),
            avatar: None,
            status: Some("offline".to_string()),
        };
        st.users.insert(uid.to_string(), record.clone());
        Ok(record)
    }

    async fn login(&self, uid: &str) -> Result<SessionContext, BackendError> {
        self.simulate_latency(Duration::ZERO).await;
        let mut st = self.lock();
        let Some(user) = st.users.get_mut(uid) else {
            return Err(BackendError::new(
                BackendErrorKind::UidNotFound,
                format!("user {uid} not found"),
            ));
        };
        user.status = Some("online".to_string());
        let name = user.name.clone();
        st.next_token += 1;
        Ok(SessionContext {
            uid: uid.to_string(),
            name,
            auth_token: Some(format!("local-{}", st.next_token)),
        })
    }

    async fn logout(&self, session: &SessionContext) -> Result<(), BackendError> {
        let mut st = self.lock();
        if let Some(user) = st.users.get_mut(&session.uid) {
            user.status = Some("offline".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryService for LocalBackend {
    async fn fetch_users(
        &self,
        _session: &SessionContext,
        page_size: u32,
    ) -> Result<Vec<UserRecord>, BackendError> {
        self.simulate_latency(Duration::ZERO).await;
        let st = self.lock();
        Ok(st
            .users
            .values()
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn fetch_groups(
        &self,
        session: &SessionContext,
        page_size: u32,
    ) -> Result<Vec<GroupRecord>, BackendError> {
        self.simulate_latency(Duration::ZERO).await;
        let st = self.lock();
        Ok(st
            .groups
            .values()
            .filter(|g| g.members.contains(&session.uid))
            .take(page_size as usize)
            .map(|g| g.record.clone())
            .collect())
    }
}

#[async_trait]
impl MessagingService for LocalBackend {
    async fn fetch_history(
        &self,
        session: &SessionContext,
        target: &ConversationTarget,
        page_size: u32,
    ) -> Result<Vec<RemoteMessage>, BackendError> {
        let extra = self
            .lock()
            .history_delays
            .get(target.id())
            .copied()
            .unwrap_or_default();
        self.simulate_latency(extra).await;

        let mut st = self.lock();
        if let Some(err) = st.fail_next_history.take() {
            return Err(err);
        }
        let me = session.uid.as_str();
        let matching: Vec<RemoteMessage> = st
            .messages
            .iter()
            .filter(|m| match target {
                ConversationTarget::User { uid } => {
                    m.receiver_type == ReceiverType::User
                        && ((m.sender_uid == me && m.receiver_id == *uid)
                            || (m.sender_uid == *uid && m.receiver_id == me))
                }
                ConversationTarget::Group { guid } => {
                    m.receiver_type == ReceiverType::Group && m.receiver_id == *guid
                }
            })
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(page_size as usize);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn send_text(
        &self,
        session: &SessionContext,
        target: &ConversationTarget,
        text: &str,
    ) -> Result<RemoteMessage, BackendError> {
        self.simulate_latency(Duration::ZERO).await;
        let (msg, callbacks) = {
            let mut st = self.lock();
            st.send_calls += 1;
            if let Some(err) = st.fail_next_send.take() {
                return Err(err);
            }
            st.check_target(target)?;
            let msg = st.store(&session.uid, target, text);
            let callbacks = st.fanout_targets(&msg);
            (msg, callbacks)
        };
        for cb in callbacks {
            cb(msg.clone());
        }
        Ok(msg)
    }

    async fn subscribe(
        &self,
        session: &SessionContext,
        listener_id: &str,
        callback: FeedCallback,
    ) -> Result<(), BackendError> {
        self.simulate_latency(Duration::ZERO).await;
        let mut st = self.lock();
        if let Some(err) = st.fail_next_subscribe.take() {
            return Err(err);
        }
        st.listeners.insert(
            listener_id.to_string(),
            Listener {
                owner_uid: session.uid.clone(),
                callback,
            },
        );
        Ok(())
    }

    fn unsubscribe(&self, listener_id: &str) {
        self.lock().listeners.remove(listener_id);
    }
}
