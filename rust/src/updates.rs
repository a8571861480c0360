use crate::backend::{BackendError, GroupRecord, RemoteMessage, SessionContext, UserRecord};
use crate::state::AppState;
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    /// Side-effect update: native persists `uid` so it can dispatch
    /// `RestoreSession` on the next launch.
    SessionStarted {
        rev: u64,
        uid: String,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::SessionStarted { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Auth results. `token` identifies the session epoch the request was issued in.
    SignInCompleted {
        token: u64,
        result: Result<SessionContext, BackendError>,
    },
    AccountCreated {
        token: u64,
        result: Result<SessionContext, CreateAccountFailure>,
    },

    // Directory
    DirectoryFetched {
        token: u64,
        users: Result<Vec<UserRecord>, BackendError>,
        groups: Result<Vec<GroupRecord>, BackendError>,
    },

    // Conversation. `generation` identifies the `open` the request belongs to.
    HistoryFetched {
        generation: u64,
        result: Result<Vec<RemoteMessage>, BackendError>,
    },
    SubscriptionRegistered {
        generation: u64,
        listener_id: String,
        result: Result<(), BackendError>,
    },
    SendCompleted {
        generation: u64,
        temp_id: String,
        result: Result<RemoteMessage, BackendError>,
    },
    // Feed receive path. Tagged with the listener that delivered it.
    IncomingMessage {
        listener_id: String,
        message: RemoteMessage,
    },
}

/// Which step of create-then-login failed.
#[derive(Debug)]
pub enum CreateAccountFailure {
    Create(BackendError),
    Login(BackendError),
}
