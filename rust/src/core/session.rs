// Session lifecycle: sign in, create account, logout.

use super::*;

use crate::backend::BackendErrorKind;
use crate::state::{display_name, AuthState, UserListState};
use crate::updates::CreateAccountFailure;

const INVALID_USER_ID: &str =
    "User ID can only contain letters, numbers, underscores and hyphens";

fn sign_in_error_message(e: &BackendError) -> &'static str {
    match e.kind {
        BackendErrorKind::UidNotFound => {
            "User not found. Please check the User ID or create a new account."
        }
        BackendErrorKind::ConnectionFailure => {
            "Connection failed. Please check your internet connection."
        }
        _ => "Login failed. Please try again.",
    }
}

fn create_account_error_message(e: &CreateAccountFailure) -> &'static str {
    match e {
        CreateAccountFailure::Create(e) if e.kind == BackendErrorKind::UidAlreadyExists => {
            "User ID already exists. Please try a different one."
        }
        CreateAccountFailure::Create(_) => "Failed to create user. Please try again.",
        CreateAccountFailure::Login(_) => {
            "User created but login failed. Please try logging in manually."
        }
    }
}

impl AppCore {
    fn next_session_token(&mut self) -> u64 {
        self.session_token = self.session_token.wrapping_add(1);
        self.session_token
    }

    pub(super) fn begin_sign_in(&mut self, uid: &str) {
        let uid = crate::normalize_user_id(uid.to_string());
        if uid.is_empty() {
            self.toast("User ID cannot be empty");
            return;
        }
        if !crate::is_valid_user_id(uid.clone()) {
            self.toast(INVALID_USER_ID);
            return;
        }
        self.set_busy(|b| {
            b.signing_in = true;
            b.creating_account = false;
        });

        let token = self.next_session_token();
        let auth = self.services.auth.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = auth.login(&uid).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SignInCompleted {
                token,
                result,
            })));
        });
    }

    pub(super) fn begin_create_account(&mut self, uid: &str, name: &str) {
        let uid = crate::normalize_user_id(uid.to_string());
        let name = name.trim().to_string();
        if uid.is_empty() {
            self.toast("User ID is required");
            return;
        }
        if name.is_empty() {
            self.toast("Name is required");
            return;
        }
        if !crate::is_valid_user_id(uid.clone()) {
            self.toast(INVALID_USER_ID);
            return;
        }
        self.set_busy(|b| {
            b.creating_account = true;
            b.signing_in = false;
        });

        let token = self.next_session_token();
        let auth = self.services.auth.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = match auth.create_user(&uid, &name).await {
                Ok(_) => auth.login(&uid).await.map_err(CreateAccountFailure::Login),
                Err(e) => Err(CreateAccountFailure::Create(e)),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::AccountCreated {
                token,
                result,
            })));
        });
    }

    pub(super) fn handle_sign_in_completed(
        &mut self,
        token: u64,
        result: Result<SessionContext, BackendError>,
    ) {
        if token != self.session_token {
            tracing::debug!(token, "stale sign-in result dropped");
            return;
        }
        self.clear_busy();
        match result {
            Ok(ctx) => self.start_session(ctx),
            Err(e) => {
                tracing::warn!(err = %e, "sign-in failed");
                self.toast(sign_in_error_message(&e));
            }
        }
    }

    pub(super) fn handle_account_created(
        &mut self,
        token: u64,
        result: Result<SessionContext, CreateAccountFailure>,
    ) {
        if token != self.session_token {
            tracing::debug!(token, "stale create-account result dropped");
            return;
        }
        self.clear_busy();
        match result {
            Ok(ctx) => self.start_session(ctx),
            Err(e) => {
                tracing::warn!(err = ?e, "create account failed");
                self.toast(create_account_error_message(&e));
            }
        }
    }

    fn start_session(&mut self, ctx: SessionContext) {
        // Tear down any existing session first.
        self.stop_session();

        tracing::info!(uid = %ctx.uid, "start_session");
        let uid = ctx.uid.clone();
        self.state.auth = AuthState::LoggedIn {
            uid: ctx.uid.clone(),
            name: ctx.name.clone(),
            display_name: display_name(&ctx.name, &ctx.uid),
        };
        self.session = Some(ctx);
        self.emit_auth();
        self.emit_session_started(uid);
        self.handle_auth_transition(true);
        self.refresh_user_list();
    }

    /// Drops the session and its conversation. Returns the context so the
    /// caller can still talk to the backend on its behalf.
    pub(super) fn stop_session(&mut self) -> Option<SessionContext> {
        // Invalidate in-flight auth/directory results.
        self.next_session_token();
        if let Some(listener_id) = self.conversation.close() {
            self.services.messaging.unsubscribe(&listener_id);
        }
        self.session.take()
    }

    pub(super) fn logout(&mut self) {
        let Some(ctx) = self.stop_session() else {
            // Still reset: a sign-in may be in flight.
            self.state.auth = AuthState::LoggedOut;
            self.handle_auth_transition(false);
            return;
        };
        tracing::info!(uid = %ctx.uid, "logout");

        // Best effort: the local state resets regardless of what the backend says.
        let auth = self.services.auth.clone();
        self.runtime.spawn(async move {
            if let Err(e) = auth.logout(&ctx).await {
                tracing::warn!(err = %e, "backend logout failed");
            }
        });

        self.state.auth = AuthState::LoggedOut;
        self.state.user_list = UserListState::empty();
        self.state.toast = None;
        self.emit_auth();
        self.handle_auth_transition(false);
    }
}
