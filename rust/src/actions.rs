use crate::state::{ConversationTarget, Screen};

#[derive(uniffi::Enum, Debug, Clone)]
pub enum AppAction {
    // Auth
    SignIn {
        uid: String,
    },
    RestoreSession {
        uid: String,
    },
    CreateAccount {
        uid: String,
        name: String,
    },
    Logout,

    // Navigation
    PushScreen {
        screen: Screen,
    },
    UpdateScreenStack {
        stack: Vec<Screen>,
    },

    // Directory
    RefreshUsers,

    // Chat
    OpenChat {
        target: ConversationTarget,
    },
    SendMessage {
        text: String,
    },
    RetryMessage {
        message_id: String,
    },
    DiscardMessage {
        message_id: String,
    },
    RetryLoadHistory,

    // UI
    ClearToast,

    // Lifecycle
    Foregrounded,
}

impl AppAction {
    /// Log-safe action tag (never includes message text).
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::SignIn { .. } => "SignIn",
            AppAction::RestoreSession { .. } => "RestoreSession",
            AppAction::CreateAccount { .. } => "CreateAccount",
            AppAction::Logout => "Logout",

            // Navigation
            AppAction::PushScreen { .. } => "PushScreen",
            AppAction::UpdateScreenStack { .. } => "UpdateScreenStack",

            // Directory
            AppAction::RefreshUsers => "RefreshUsers",

            // Chat
            AppAction::OpenChat { .. } => "OpenChat",
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::RetryMessage { .. } => "RetryMessage",
            AppAction::DiscardMessage { .. } => "DiscardMessage",
            AppAction::RetryLoadHistory => "RetryLoadHistory",

            // UI
            AppAction::ClearToast => "ClearToast",

            // Lifecycle
            AppAction::Foregrounded => "Foregrounded",
        }
    }
}
