#[derive(uniffi::Record, Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub router: Router,
    pub auth: AuthState,
    pub busy: BusyState,
    pub user_list: UserListState,
    pub current_chat: Option<ChatViewState>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            router: Router {
                default_screen: Screen::Login,
                screen_stack: vec![],
            },
            auth: AuthState::LoggedOut,
            busy: BusyState::idle(),
            user_list: UserListState::empty(),
            current_chat: None,
            toast: None,
        }
    }
}

/// "In flight" flags for long-ish operations that the UI should reflect.
///
/// Per-conversation loading lives on `ChatViewState` instead, since it is
/// scoped to the open conversation and discarded with it.
#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct BusyState {
    pub signing_in: bool,
    pub creating_account: bool,
    pub fetching_users: bool,
}

impl BusyState {
    pub fn idle() -> Self {
        Self {
            signing_in: false,
            creating_account: false,
            fetching_users: false,
        }
    }
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct Router {
    pub default_screen: Screen,
    pub screen_stack: Vec<Screen>,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq)]
pub enum Screen {
    Login,
    SignIn,
    SignUp,
    UserList,
    Chat { target: ConversationTarget },
}

/// The single user or group a conversation screen is bound to.
#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConversationTarget {
    User { uid: String },
    Group { guid: String },
}

impl ConversationTarget {
    pub fn id(&self) -> &str {
        match self {
            Self::User { uid } => uid,
            Self::Group { guid } => guid,
        }
    }

    pub fn receiver_type(&self) -> ReceiverType {
        match self {
            Self::User { .. } => ReceiverType::User,
            Self::Group { .. } => ReceiverType::Group,
        }
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiverType {
    User,
    Group,
}

impl ReceiverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn {
        uid: String,
        name: String,
        display_name: String,
    },
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct UserListState {
    pub users: Vec<UserSummary>,
    pub groups: Vec<GroupSummary>,
    pub error: Option<String>,
}

impl UserListState {
    pub fn empty() -> Self {
        Self {
            users: vec![],
            groups: vec![],
            error: None,
        }
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct UserSummary {
    pub uid: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct GroupSummary {
    pub guid: String,
    pub name: String,
    pub member_count: u32,
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct ChatViewState {
    pub target: ConversationTarget,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub is_loading: bool,
    /// Set when the history fetch failed; `RetryLoadHistory` clears it.
    pub load_error: Option<String>,
    /// Set when the live feed could not be registered. Messages then only
    /// show up after an explicit reload, so the UI should say so.
    pub subscription_error: Option<String>,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender_uid: String,
    pub receiver_type: ReceiverType,
    pub receiver_id: String,
    pub sent_at: i64,
    pub is_mine: bool,
    pub delivery: MessageDeliveryState,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq)]
pub enum MessageDeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

pub fn now_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Header name for the signed-in user: the profile name when it has content,
/// otherwise the uid.
pub fn display_name(name: &str, uid: &str) -> String {
    let trimmed = name.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    if !uid.trim().is_empty() {
        return uid.trim().to_string();
    }
    "User".to_string()
}
