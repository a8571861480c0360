mod config;
mod conversation;
mod directory;
mod session;

use std::sync::{Arc, RwLock};

use anyhow::Context;
use flume::Sender;

use crate::actions::AppAction;
use crate::backend::{BackendError, ChatServices, FeedCallback, SessionContext};
use crate::state::{now_seconds, AppState, BusyState, ConversationTarget, Screen};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use conversation::{ConversationSession, OutgoingSend};

pub(crate) use config::{default_app_config_json, load_app_config, AppConfig};

const HISTORY_FAILED: &str = "Failed to load messages. Please try again.";

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: AppConfig,
    runtime: tokio::runtime::Runtime,
    services: ChatServices,

    // Explicit session context: set at login, cleared at logout.
    session: Option<SessionContext>,
    // Bumped on every sign-in attempt and logout; auth/directory results
    // carrying an older token are dropped.
    session_token: u64,

    conversation: ConversationSession,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        config: AppConfig,
        services: ChatServices,
        shared_state: Arc<RwLock<AppState>>,
    ) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .context("build tokio runtime")?;

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            services,
            session: None,
            session_token: 0,
            conversation: ConversationSession::default(),
        };

        // Ensure FfiApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        Ok(this)
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_auth(&mut self) {
        self.emit_state();
    }

    fn emit_router(&mut self) {
        self.emit_state();
    }

    fn emit_busy(&mut self) {
        self.emit_state();
    }

    fn emit_user_list(&mut self) {
        self.emit_state();
    }

    fn emit_toast(&mut self) {
        self.emit_state();
    }

    /// Re-project the conversation log into `state.current_chat` and publish.
    fn emit_current_chat(&mut self) {
        self.state.current_chat = self.conversation.view();
        self.emit_state();
    }

    fn emit_session_started(&mut self, uid: String) {
        let rev = self.next_rev();
        // Keep snapshot rev in sync with the update stream even though this is a side-effect update.
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::SessionStarted { rev, uid });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Keep toast in state until the UI explicitly clears it.
        self.state.toast = Some(msg.into());
        self.emit_toast();
    }

    fn is_logged_in(&self) -> bool {
        self.session.is_some()
    }

    fn set_busy(&mut self, f: impl FnOnce(&mut BusyState)) {
        let mut next = self.state.busy.clone();
        f(&mut next);
        if next != self.state.busy {
            self.state.busy = next;
            self.emit_busy();
        }
    }

    fn clear_busy(&mut self) {
        self.set_busy(|b| *b = BusyState::idle());
    }

    fn handle_auth_transition(&mut self, logged_in: bool) {
        self.state.router.screen_stack.clear();
        if logged_in {
            self.state.router.default_screen = Screen::UserList;
        } else {
            self.state.router.default_screen = Screen::Login;
            self.state.user_list = crate::state::UserListState::empty();
            self.state.busy = BusyState::idle();
        }
        self.state.current_chat = None;
        self.emit_router();
    }

    fn screen_allowed(&self, screen: &Screen) -> bool {
        match screen {
            Screen::Login | Screen::SignIn | Screen::SignUp => !self.is_logged_in(),
            Screen::UserList | Screen::Chat { .. } => self.is_logged_in(),
        }
    }

    /// The chat on top of the stack is the only open conversation.
    fn sync_conversation_to_router(&mut self) {
        match self.state.router.screen_stack.last().cloned() {
            Some(Screen::Chat { target }) => {
                if self.conversation.target() != Some(&target) {
                    self.open_conversation(target);
                }
            }
            _ => {
                if self.conversation.target().is_some() {
                    self.close_conversation();
                }
            }
        }
    }

    fn open_conversation(&mut self, target: ConversationTarget) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let listener_id = format!("simplechat-listener-{}", uuid::Uuid::new_v4());
        let title = self.conversation_title(&target);
        let (generation, released) = self.conversation.open(
            target.clone(),
            title,
            session.uid.clone(),
            listener_id.clone(),
        );
        // Release before registering the replacement.
        if let Some(old) = released {
            self.services.messaging.unsubscribe(&old);
        }
        tracing::info!(generation, target = %target.id(), "conversation_open");
        self.emit_current_chat();

        let messaging = self.services.messaging.clone();
        let tx = self.core_sender.clone();
        let page_size = self.config.history_page_size();
        let feed_tx = self.core_sender.clone();
        let feed_listener = listener_id.clone();
        let callback: FeedCallback = Arc::new(move |message| {
            let _ = feed_tx.send(CoreMsg::Internal(Box::new(InternalEvent::IncomingMessage {
                listener_id: feed_listener.clone(),
                message,
            })));
        });
        self.runtime.spawn(async move {
            let result = messaging.subscribe(&session, &listener_id, callback).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::SubscriptionRegistered {
                    generation,
                    listener_id,
                    result,
                },
            )));
            let result = messaging.fetch_history(&session, &target, page_size).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::HistoryFetched {
                generation,
                result,
            })));
        });
    }

    fn close_conversation(&mut self) {
        if let Some(listener_id) = self.conversation.close() {
            self.services.messaging.unsubscribe(&listener_id);
            tracing::info!(listener = %listener_id, "conversation_closed");
        }
        if self.state.current_chat.is_some() {
            self.emit_current_chat();
        }
    }

    fn spawn_history_fetch(&mut self, generation: u64, target: ConversationTarget) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let messaging = self.services.messaging.clone();
        let tx = self.core_sender.clone();
        let page_size = self.config.history_page_size();
        self.runtime.spawn(async move {
            let result = messaging.fetch_history(&session, &target, page_size).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::HistoryFetched {
                generation,
                result,
            })));
        });
    }

    fn spawn_send(&mut self, out: OutgoingSend) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let messaging = self.services.messaging.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = messaging.send_text(&session, &out.target, &out.text).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SendCompleted {
                generation: out.generation,
                temp_id: out.temp_id,
                result,
            })));
        });
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it carries message text.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::SignInCompleted { token, result } => {
                self.handle_sign_in_completed(token, result);
            }
            InternalEvent::AccountCreated { token, result } => {
                self.handle_account_created(token, result);
            }
            InternalEvent::DirectoryFetched {
                token,
                users,
                groups,
            } => {
                // Ignore stale results (e.g., logout/login during the fetch).
                if token != self.session_token {
                    return;
                }
                self.handle_directory_fetched(users, groups);
            }
            InternalEvent::HistoryFetched { generation, result } => {
                let result = result.map_err(|e| {
                    tracing::warn!(generation, err = %e, "history fetch failed");
                    HISTORY_FAILED.to_string()
                });
                if self.conversation.apply_history(generation, result) {
                    self.emit_current_chat();
                } else {
                    tracing::debug!(generation, "stale history dropped");
                }
            }
            InternalEvent::SubscriptionRegistered {
                generation,
                listener_id,
                result,
            } => match result {
                Ok(()) => {
                    // The conversation moved on while registering; release the orphan.
                    if self.conversation.listener_id() != Some(listener_id.as_str()) {
                        tracing::debug!(listener = %listener_id, "releasing stale listener");
                        self.services.messaging.unsubscribe(&listener_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(listener = %listener_id, err = %e, "feed subscription failed");
                    let reason = format!("Live updates unavailable: {e}");
                    if self
                        .conversation
                        .subscription_failed(generation, &listener_id, reason)
                    {
                        self.emit_current_chat();
                    }
                }
            },
            InternalEvent::SendCompleted {
                generation,
                temp_id,
                result,
            } => {
                let result = result.map_err(|e| {
                    tracing::warn!(%temp_id, err = %e, "send failed");
                    e.to_string()
                });
                if self.conversation.complete_send(generation, &temp_id, result) {
                    self.emit_current_chat();
                }
            }
            InternalEvent::IncomingMessage {
                listener_id,
                message,
            } => {
                let id = message.id.clone();
                if self.conversation.on_incoming(&listener_id, message) {
                    tracing::debug!(message_id = %id, "incoming message appended");
                    self.emit_current_chat();
                }
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Auth
            AppAction::SignIn { uid } | AppAction::RestoreSession { uid } => {
                self.begin_sign_in(&uid);
            }
            AppAction::CreateAccount { uid, name } => {
                self.begin_create_account(&uid, &name);
            }
            AppAction::Logout => {
                self.logout();
            }

            // Navigation
            AppAction::PushScreen { screen } => {
                if !self.screen_allowed(&screen) {
                    tracing::debug!(?screen, "push ignored");
                    return;
                }
                self.state.router.screen_stack.push(screen);
                self.emit_router();
                self.sync_conversation_to_router();
            }
            AppAction::UpdateScreenStack { stack } => {
                self.state.router.screen_stack = stack
                    .into_iter()
                    .filter(|s| self.screen_allowed(s))
                    .collect();
                self.emit_router();
                self.sync_conversation_to_router();
            }

            // Directory
            AppAction::RefreshUsers => {
                self.refresh_user_list();
            }

            // Chat
            AppAction::OpenChat { target } => {
                if !self.is_logged_in() {
                    self.toast("Please log in first");
                    return;
                }
                let screen = Screen::Chat { target };
                if self.state.router.screen_stack.last() != Some(&screen) {
                    self.state.router.screen_stack.push(screen);
                    self.emit_router();
                }
                self.sync_conversation_to_router();
            }
            AppAction::SendMessage { text } => {
                if !self.is_logged_in() {
                    self.toast("Please log in first");
                    return;
                }
                let Some(out) = self.conversation.begin_send(&text, now_seconds()) else {
                    return;
                };
                tracing::info!(temp_id = %out.temp_id, target = %out.target.id(), "send_optimistic");
                self.emit_current_chat();
                self.spawn_send(out);
            }
            AppAction::RetryMessage { message_id } => {
                let Some(out) = self.conversation.retry_send(&message_id) else {
                    self.toast("Nothing to retry");
                    return;
                };
                self.emit_current_chat();
                self.spawn_send(out);
            }
            AppAction::DiscardMessage { message_id } => {
                if self.conversation.discard(&message_id) {
                    self.emit_current_chat();
                }
            }
            AppAction::RetryLoadHistory => {
                if let Some((generation, target)) = self.conversation.retry_history() {
                    self.emit_current_chat();
                    self.spawn_history_fetch(generation, target);
                }
            }

            // UI
            AppAction::ClearToast => {
                if self.state.toast.is_some() {
                    self.state.toast = None;
                    self.emit_toast();
                }
            }

            // Lifecycle
            AppAction::Foregrounded => {
                // Native should send lifecycle signals as actions. Rust owns all state changes.
                if self.is_logged_in() {
                    self.refresh_user_list();
                }
            }
        }
    }
}

impl Drop for AppCore {
    fn drop(&mut self) {
        if let Some(listener_id) = self.conversation.close() {
            self.services.messaging.unsubscribe(&listener_id);
        }
    }
}
