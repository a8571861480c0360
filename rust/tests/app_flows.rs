use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use simplechat_core::{
    AppAction, AppReconciler, AppState, AppUpdate, AuthState, BusyState, ChatServices,
    ConversationTarget, FfiApp, LocalBackend, MessageDeliveryState, Screen,
};
use tempfile::{tempdir, TempDir};

const TIMEOUT: Duration = Duration::from_secs(5);

fn write_config(data_dir: &str, disable_network: bool) {
    let path = std::path::Path::new(data_dir).join("simplechat_config.json");
    let v = serde_json::json!({
        "disable_network": disable_network,
        "history_page_size": 50,
    });
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

struct TestReconciler {
    updates: Arc<Mutex<Vec<AppUpdate>>>,
}

impl TestReconciler {
    fn new() -> (Self, Arc<Mutex<Vec<AppUpdate>>>) {
        let updates = Arc::new(Mutex::new(vec![]));
        (
            Self {
                updates: updates.clone(),
            },
            updates,
        )
    }
}

impl AppReconciler for TestReconciler {
    fn reconcile(&self, update: AppUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

fn backend() -> Arc<LocalBackend> {
    let backend = LocalBackend::with_demo_users();
    backend.add_user("alice", "Alice");
    backend.add_user("bob", "Bob");
    backend.add_user("carol", "Carol");
    Arc::new(backend)
}

fn start(backend: &Arc<LocalBackend>) -> (TempDir, Arc<FfiApp>) {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().to_string_lossy().to_string();
    write_config(&data_dir, true);
    let app = FfiApp::with_services(data_dir, ChatServices::from_backend(backend.clone()));
    (dir, app)
}

fn user(uid: &str) -> ConversationTarget {
    ConversationTarget::User {
        uid: uid.to_string(),
    }
}

fn sign_in(app: &FfiApp, uid: &str) {
    app.dispatch(AppAction::SignIn {
        uid: uid.to_string(),
    });
    wait_until("logged in", TIMEOUT, || {
        matches!(app.state().auth, AuthState::LoggedIn { .. })
    });
    wait_until("user list fetched", TIMEOUT, || {
        let s = app.state();
        !s.busy.fetching_users && (!s.user_list.users.is_empty() || s.user_list.error.is_some())
    });
}

fn open_chat(app: &FfiApp, target: ConversationTarget) {
    app.dispatch(AppAction::OpenChat {
        target: target.clone(),
    });
    wait_until("chat loaded", TIMEOUT, || {
        app.state()
            .current_chat
            .map(|c| c.target == target && !c.is_loading)
            .unwrap_or(false)
    });
}

fn chat_texts(state: &AppState) -> Vec<String> {
    state
        .current_chat
        .as_ref()
        .map(|c| c.messages.iter().map(|m| m.text.clone()).collect())
        .unwrap_or_default()
}

#[test]
fn sign_in_navigates_to_user_list_and_hides_samples() {
    let backend = backend();
    let (_dir, app) = start(&backend);
    let (reconciler, updates) = TestReconciler::new();
    app.listen_for_updates(Box::new(reconciler));

    assert_eq!(app.state().router.default_screen, Screen::Login);
    sign_in(&app, "  alice ");

    let s = app.state();
    assert_eq!(s.router.default_screen, Screen::UserList);
    assert!(s.router.screen_stack.is_empty());
    match &s.auth {
        AuthState::LoggedIn {
            uid, display_name, ..
        } => {
            assert_eq!(uid, "alice");
            assert_eq!(display_name, "Alice");
        }
        other => panic!("unexpected auth state: {other:?}"),
    }
    let uids: Vec<&str> = s.user_list.users.iter().map(|u| u.uid.as_str()).collect();
    assert_eq!(uids, vec!["bob", "carol"]);
    assert!(s.user_list.groups.is_empty());
    assert!(s.user_list.error.is_none());
    assert!(!s.busy.signing_in);

    wait_until("session started update", TIMEOUT, || {
        updates.lock().unwrap().iter().any(
            |u| matches!(u, AppUpdate::SessionStarted { uid, .. } if uid == "alice"),
        )
    });

    // Revs are strictly increasing across the update stream.
    let revs: Vec<u64> = updates.lock().unwrap().iter().map(|u| u.rev()).collect();
    assert!(revs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn sign_in_errors_surface_as_toasts() {
    let backend = backend();
    let (_dir, app) = start(&backend);

    app.dispatch(AppAction::SignIn {
        uid: "   ".to_string(),
    });
    wait_until("empty uid toast", TIMEOUT, || {
        app.state().toast.as_deref() == Some("User ID cannot be empty")
    });

    app.dispatch(AppAction::ClearToast);
    app.dispatch(AppAction::SignIn {
        uid: "nobody".to_string(),
    });
    wait_until("unknown uid toast", TIMEOUT, || {
        app.state().toast.as_deref()
            == Some("User not found. Please check the User ID or create a new account.")
    });
    let s = app.state();
    assert_eq!(s.auth, AuthState::LoggedOut);
    assert!(!s.busy.signing_in);
    assert_eq!(s.router.default_screen, Screen::Login);
}

#[test]
fn sign_in_rejects_ids_that_are_not_a_single_path_segment() {
    let backend = backend();
    let (_dir, app) = start(&backend);

    for uid in ["bob/auth_tokens", "../users", "bob?x=1"] {
        app.dispatch(AppAction::ClearToast);
        app.dispatch(AppAction::SignIn {
            uid: uid.to_string(),
        });
        wait_until("invalid uid toast", TIMEOUT, || {
            app.state().toast.as_deref()
                == Some("User ID can only contain letters, numbers, underscores and hyphens")
        });
        let s = app.state();
        assert_eq!(s.auth, AuthState::LoggedOut);
        assert_eq!(s.busy, BusyState::idle());
        assert_eq!(s.router.default_screen, Screen::Login);
    }
}

#[test]
fn create_account_logs_in_and_rejects_duplicates() {
    let backend = backend();
    let (_dir, app) = start(&backend);

    app.dispatch(AppAction::CreateAccount {
        uid: "da ve".to_string(),
        name: "Dave".to_string(),
    });
    wait_until("invalid uid toast", TIMEOUT, || {
        app.state().toast.as_deref()
            == Some("User ID can only contain letters, numbers, underscores and hyphens")
    });

    app.dispatch(AppAction::CreateAccount {
        uid: "dave".to_string(),
        name: " ".to_string(),
    });
    wait_until("missing name toast", TIMEOUT, || {
        app.state().toast.as_deref() == Some("Name is required")
    });

    app.dispatch(AppAction::CreateAccount {
        uid: "dave".to_string(),
        name: "Dave".to_string(),
    });
    wait_until("logged in as dave", TIMEOUT, || {
        matches!(&app.state().auth, AuthState::LoggedIn { uid, .. } if uid == "dave")
    });
    assert_eq!(app.state().router.default_screen, Screen::UserList);

    app.dispatch(AppAction::Logout);
    wait_until("logged out", TIMEOUT, || {
        app.state().auth == AuthState::LoggedOut
    });

    app.dispatch(AppAction::CreateAccount {
        uid: "dave".to_string(),
        name: "Dave Again".to_string(),
    });
    wait_until("duplicate toast", TIMEOUT, || {
        app.state().toast.as_deref() == Some("User ID already exists. Please try a different one.")
    });
    assert_eq!(app.state().auth, AuthState::LoggedOut);
    assert!(!app.state().busy.creating_account);
}

#[test]
fn only_sample_users_yields_a_hint() {
    let backend = LocalBackend::with_demo_users();
    backend.add_user("alice", "Alice");
    let backend = Arc::new(backend);
    let (_dir, app) = start(&backend);

    sign_in(&app, "alice");
    let s = app.state();
    assert!(s.user_list.users.is_empty());
    assert_eq!(
        s.user_list.error.as_deref(),
        Some("No custom users found. Only sample users are available.")
    );
}

#[test]
fn open_chat_loads_history_in_order() {
    let backend = backend();
    backend.deliver("bob", &user("alice"), "hi alice");
    backend.deliver("alice", &user("bob"), "hey bob");
    backend.deliver("carol", &user("alice"), "not for this chat");
    let (_dir, app) = start(&backend);

    sign_in(&app, "alice");
    open_chat(&app, user("bob"));

    let s = app.state();
    assert_eq!(chat_texts(&s), vec!["hi alice", "hey bob"]);
    let chat = s.current_chat.unwrap();
    assert_eq!(chat.title, "Bob");
    assert!(chat.load_error.is_none());
    assert!(!chat.messages[0].is_mine);
    assert!(chat.messages[1].is_mine);
    assert_eq!(
        s.router.screen_stack,
        vec![Screen::Chat {
            target: user("bob")
        }]
    );
    wait_until("listener registered", TIMEOUT, || backend.listener_count() == 1);
}

#[test]
fn send_goes_pending_then_sent_without_duplicates() {
    let backend = backend();
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");
    open_chat(&app, user("bob"));
    wait_until("listener registered", TIMEOUT, || backend.listener_count() == 1);

    backend.set_latency(Duration::from_millis(300));
    app.dispatch(AppAction::SendMessage {
        text: "  hello bob  ".to_string(),
    });
    wait_until("optimistic entry", TIMEOUT, || {
        app.state()
            .current_chat
            .map(|c| {
                c.messages.iter().any(|m| {
                    m.id.starts_with("temp-")
                        && m.text == "hello bob"
                        && m.delivery == MessageDeliveryState::Pending
                })
            })
            .unwrap_or(false)
    });
    wait_until("confirmed entry", TIMEOUT, || {
        app.state()
            .current_chat
            .map(|c| {
                c.messages.len() == 1
                    && !c.messages[0].id.starts_with("temp-")
                    && c.messages[0].delivery == MessageDeliveryState::Sent
            })
            .unwrap_or(false)
    });

    // The feed echo of our own send must not produce a second entry.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(chat_texts(&app.state()), vec!["hello bob"]);

    // Blank sends are ignored.
    let sends = backend.send_count();
    app.dispatch(AppAction::SendMessage {
        text: "   ".to_string(),
    });
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(backend.send_count(), sends);
}

#[test]
fn every_published_snapshot_shows_a_send_once() {
    let backend = backend();
    let (_dir, app) = start(&backend);
    let (reconciler, updates) = TestReconciler::new();
    app.listen_for_updates(Box::new(reconciler));
    sign_in(&app, "alice");
    open_chat(&app, user("bob"));
    wait_until("listener registered", TIMEOUT, || backend.listener_count() == 1);

    // The local backend echoes the send to our own listener before it acks.
    app.dispatch(AppAction::SendMessage {
        text: "hello bob".to_string(),
    });
    wait_until("send confirmed", TIMEOUT, || {
        app.state()
            .current_chat
            .map(|c| {
                c.messages.len() == 1 && c.messages[0].delivery == MessageDeliveryState::Sent
            })
            .unwrap_or(false)
    });
    std::thread::sleep(Duration::from_millis(100));

    let updates = updates.lock().unwrap();
    let snapshots: Vec<&AppState> = updates
        .iter()
        .filter_map(|u| match u {
            AppUpdate::FullState(s) => Some(s),
            _ => None,
        })
        .collect();
    assert!(snapshots
        .iter()
        .any(|s| s.current_chat.as_ref().map(|c| !c.messages.is_empty()).unwrap_or(false)));
    for snapshot in snapshots {
        let Some(chat) = snapshot.current_chat.as_ref() else {
            continue;
        };
        let entries: Vec<(&str, &MessageDeliveryState)> = chat
            .messages
            .iter()
            .filter(|m| m.text == "hello bob")
            .map(|m| (m.id.as_str(), &m.delivery))
            .collect();
        assert!(
            entries.len() <= 1,
            "rev {}: one send shown as {entries:?}",
            snapshot.rev
        );
    }
}

#[test]
fn incoming_feed_is_filtered_to_the_open_conversation() {
    let backend = backend();
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");
    open_chat(&app, user("bob"));
    wait_until("listener registered", TIMEOUT, || backend.listener_count() == 1);

    backend.deliver("carol", &user("alice"), "from carol");
    let from_bob = backend.deliver("bob", &user("alice"), "from bob");
    wait_until("bob's message", TIMEOUT, || {
        chat_texts(&app.state()).contains(&"from bob".to_string())
    });
    assert_eq!(chat_texts(&app.state()), vec!["from bob"]);

    // Redelivery of a known id is dropped.
    assert!(backend.redeliver(&from_bob.id));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(chat_texts(&app.state()), vec!["from bob"]);
}

#[test]
fn failed_send_can_be_retried_or_discarded() {
    let backend = backend();
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");
    open_chat(&app, user("bob"));

    let failed_id = |app: &FfiApp| -> Option<String> {
        app.state().current_chat.and_then(|c| {
            c.messages
                .iter()
                .find(|m| matches!(m.delivery, MessageDeliveryState::Failed { .. }))
                .map(|m| m.id.clone())
        })
    };

    backend.fail_next_send("network down");
    app.dispatch(AppAction::SendMessage {
        text: "first".to_string(),
    });
    wait_until("send failed", TIMEOUT, || failed_id(&app).is_some());
    let id = failed_id(&app).unwrap();
    assert!(id.starts_with("temp-"));

    app.dispatch(AppAction::RetryMessage { message_id: id });
    wait_until("retry delivered", TIMEOUT, || {
        app.state()
            .current_chat
            .map(|c| {
                c.messages.len() == 1 && c.messages[0].delivery == MessageDeliveryState::Sent
            })
            .unwrap_or(false)
    });

    backend.fail_next_send("network down");
    app.dispatch(AppAction::SendMessage {
        text: "second".to_string(),
    });
    wait_until("second send failed", TIMEOUT, || failed_id(&app).is_some());
    let id = failed_id(&app).unwrap();
    app.dispatch(AppAction::DiscardMessage { message_id: id });
    wait_until("failed entry discarded", TIMEOUT, || {
        chat_texts(&app.state()) == vec!["first".to_string()]
    });

    // Nothing left to retry.
    app.dispatch(AppAction::RetryMessage {
        message_id: "temp-999".to_string(),
    });
    wait_until("nothing to retry toast", TIMEOUT, || {
        app.state().toast.as_deref() == Some("Nothing to retry")
    });
}

#[test]
fn switching_conversations_drops_stale_history() {
    let backend = backend();
    backend.deliver("bob", &user("alice"), "old bob");
    backend.deliver("carol", &user("alice"), "old carol");
    backend.delay_history_for("bob", Duration::from_millis(400));
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");

    app.dispatch(AppAction::OpenChat {
        target: user("bob"),
    });
    app.dispatch(AppAction::OpenChat {
        target: user("carol"),
    });
    wait_until("carol loaded", TIMEOUT, || {
        app.state()
            .current_chat
            .map(|c| c.target == user("carol") && !c.is_loading)
            .unwrap_or(false)
    });

    // Let bob's delayed page arrive; it must not land in carol's chat.
    std::thread::sleep(Duration::from_millis(700));
    let s = app.state();
    assert_eq!(s.current_chat.as_ref().unwrap().target, user("carol"));
    assert_eq!(chat_texts(&s), vec!["old carol"]);
    wait_until("single listener", TIMEOUT, || backend.listener_count() == 1);
}

#[test]
fn leaving_the_chat_screen_closes_the_conversation() {
    let backend = backend();
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");
    open_chat(&app, user("bob"));
    wait_until("listener registered", TIMEOUT, || backend.listener_count() == 1);

    app.dispatch(AppAction::UpdateScreenStack { stack: vec![] });
    wait_until("chat closed", TIMEOUT, || app.state().current_chat.is_none());
    wait_until("listener released", TIMEOUT, || backend.listener_count() == 0);

    // Messages for a closed conversation go nowhere.
    backend.deliver("bob", &user("alice"), "late");
    std::thread::sleep(Duration::from_millis(100));
    assert!(app.state().current_chat.is_none());
}

#[test]
fn logout_resets_state_and_releases_listener() {
    let backend = backend();
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");
    open_chat(&app, user("bob"));
    wait_until("listener registered", TIMEOUT, || backend.listener_count() == 1);

    app.dispatch(AppAction::Logout);
    wait_until("logged out", TIMEOUT, || {
        app.state().auth == AuthState::LoggedOut
    });
    let s = app.state();
    assert_eq!(s.router.default_screen, Screen::Login);
    assert!(s.router.screen_stack.is_empty());
    assert!(s.current_chat.is_none());
    assert!(s.user_list.users.is_empty());
    assert_eq!(s.busy, BusyState::idle());
    wait_until("listener released", TIMEOUT, || backend.listener_count() == 0);

    // Chat actions need a session again.
    app.dispatch(AppAction::SendMessage {
        text: "anyone?".to_string(),
    });
    wait_until("login required toast", TIMEOUT, || {
        app.state().toast.as_deref() == Some("Please log in first")
    });
}

#[test]
fn subscription_failure_is_surfaced_but_history_loads() {
    let backend = backend();
    backend.deliver("bob", &user("alice"), "hi");
    backend.fail_next_subscribe("feed unavailable");
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");
    open_chat(&app, user("bob"));

    wait_until("subscription error", TIMEOUT, || {
        app.state()
            .current_chat
            .and_then(|c| c.subscription_error)
            .map(|e| e.starts_with("Live updates unavailable"))
            .unwrap_or(false)
    });
    assert_eq!(chat_texts(&app.state()), vec!["hi"]);
    assert_eq!(backend.listener_count(), 0);
}

#[test]
fn history_failure_can_be_retried() {
    let backend = backend();
    backend.deliver("bob", &user("alice"), "hi");
    backend.fail_next_history("timeout");
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");

    app.dispatch(AppAction::OpenChat {
        target: user("bob"),
    });
    wait_until("history failed", TIMEOUT, || {
        app.state()
            .current_chat
            .and_then(|c| c.load_error)
            .as_deref()
            == Some("Failed to load messages. Please try again.")
    });

    app.dispatch(AppAction::RetryLoadHistory);
    wait_until("history loaded", TIMEOUT, || {
        app.state()
            .current_chat
            .map(|c| !c.is_loading && c.load_error.is_none() && c.messages.len() == 1)
            .unwrap_or(false)
    });
}

#[test]
fn group_chat_receives_member_messages() {
    let backend = backend();
    backend.add_group("hikers", "Hikers", &["alice", "bob", "carol"]);
    let (_dir, app) = start(&backend);
    sign_in(&app, "alice");
    assert_eq!(app.state().user_list.groups.len(), 1);

    let hikers = ConversationTarget::Group {
        guid: "hikers".to_string(),
    };
    open_chat(&app, hikers.clone());
    assert_eq!(app.state().current_chat.unwrap().title, "Hikers");
    wait_until("listener registered", TIMEOUT, || backend.listener_count() == 1);

    backend.deliver("bob", &user("alice"), "direct, not group");
    backend.deliver("carol", &hikers, "trail at 9");
    wait_until("group message", TIMEOUT, || {
        chat_texts(&app.state()) == vec!["trail at 9".to_string()]
    });
}
