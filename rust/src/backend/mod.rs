//! Seams to the hosted chat backend.
//!
//! The core never talks to the network directly: it holds a `ChatServices`
//! bundle and calls these traits from tasks on its runtime. Every call that
//! acts on behalf of a user takes the `SessionContext` explicitly.

mod local;
mod rest;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::state::{ConversationTarget, ReceiverType};

pub use local::LocalBackend;
pub use rest::{RestBackend, RestBackendOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    UidNotFound,
    UidAlreadyExists,
    ConnectionFailure,
    Unauthorized,
    InvalidRequest,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Other, message)
    }

    /// Map the backend's string error codes (`ERR_UID_NOT_FOUND`, ...) to a kind.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let kind = match code {
            "ERR_UID_NOT_FOUND" => BackendErrorKind::UidNotFound,
            "ERR_UID_ALREADY_EXISTS" => BackendErrorKind::UidAlreadyExists,
            "ERR_CONNECTION_FAILURE" => BackendErrorKind::ConnectionFailure,
            "ERR_AUTH_TOKEN_NOT_FOUND" | "ERR_APIKEY_NOT_FOUND" | "ERR_UNAUTHORIZED" => {
                BackendErrorKind::Unauthorized
            }
            c if c.starts_with("ERR_BAD") || c.starts_with("ERR_INVALID") => {
                BackendErrorKind::InvalidRequest
            }
            _ => BackendErrorKind::Other,
        };
        Self::new(kind, message)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for BackendError {}

/// Who is logged in. Created by `AuthService::login`, dropped at logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub uid: String,
    pub name: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub uid: String,
    pub name: String,
    pub avatar: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub guid: String,
    pub name: String,
    pub members_count: u32,
}

/// A message as the backend reports it (history page, send ack, feed event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: String,
    pub text: String,
    pub sender_uid: String,
    pub receiver_type: ReceiverType,
    pub receiver_id: String,
    pub sent_at: i64,
}

/// Feed callback: invoked once per inbound message, from any thread.
pub type FeedCallback = Arc<dyn Fn(RemoteMessage) + Send + Sync>;

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn create_user(&self, uid: &str, name: &str) -> Result<UserRecord, BackendError>;

    async fn login(&self, uid: &str) -> Result<SessionContext, BackendError>;

    async fn logout(&self, session: &SessionContext) -> Result<(), BackendError>;
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn fetch_users(
        &self,
        session: &SessionContext,
        page_size: u32,
    ) -> Result<Vec<UserRecord>, BackendError>;

    async fn fetch_groups(
        &self,
        session: &SessionContext,
        page_size: u32,
    ) -> Result<Vec<GroupRecord>, BackendError>;
}

#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Most recent page for `target`. Order is backend-defined; callers sort.
    async fn fetch_history(
        &self,
        session: &SessionContext,
        target: &ConversationTarget,
        page_size: u32,
    ) -> Result<Vec<RemoteMessage>, BackendError>;

    async fn send_text(
        &self,
        session: &SessionContext,
        target: &ConversationTarget,
        text: &str,
    ) -> Result<RemoteMessage, BackendError>;

    /// Register `callback` under `listener_id`. The feed is global: it carries
    /// every message visible to the session user, for every conversation.
    async fn subscribe(
        &self,
        session: &SessionContext,
        listener_id: &str,
        callback: FeedCallback,
    ) -> Result<(), BackendError>;

    /// Idempotent. Unknown ids are ignored.
    fn unsubscribe(&self, listener_id: &str);
}

#[derive(Clone)]
pub struct ChatServices {
    pub auth: Arc<dyn AuthService>,
    pub directory: Arc<dyn DirectoryService>,
    pub messaging: Arc<dyn MessagingService>,
}

impl ChatServices {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: AuthService + DirectoryService + MessagingService + 'static,
    {
        Self {
            auth: backend.clone(),
            directory: backend.clone(),
            messaging: backend,
        }
    }
}

impl fmt::Debug for ChatServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatServices").finish_non_exhaustive()
    }
}
