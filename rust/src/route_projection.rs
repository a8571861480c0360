use crate::{AppState, AuthState, ConversationTarget, Router, Screen};

#[derive(Clone, Debug, PartialEq)]
pub struct MobileRouteState {
    pub root_screen: Screen,
    pub stack: Vec<Screen>,
    pub active_screen: Screen,
    pub can_pop: bool,
    /// Target of the chat screen on top, if any.
    pub active_conversation: Option<ConversationTarget>,
}

/// Maps core router semantics to the navigation model shared by iOS and Android.
///
/// Logged out, only the auth screens may sit on top of `Login`. Logged in,
/// the auth screens are dropped from whatever stack the router carries.
pub fn project_mobile(state: &AppState) -> MobileRouteState {
    let logged_out = matches!(state.router.default_screen, Screen::Login)
        || matches!(state.auth, AuthState::LoggedOut);
    if logged_out {
        let stack: Vec<Screen> = state
            .router
            .screen_stack
            .iter()
            .filter(|s| is_auth_screen(s))
            .cloned()
            .collect();
        let active_screen = stack.last().cloned().unwrap_or(Screen::Login);
        return MobileRouteState {
            root_screen: Screen::Login,
            can_pop: !stack.is_empty(),
            stack,
            active_screen,
            active_conversation: None,
        };
    }

    let stack: Vec<Screen> = state
        .router
        .screen_stack
        .iter()
        .filter(|s| !is_auth_screen(s))
        .cloned()
        .collect();
    let router = Router {
        default_screen: state.router.default_screen.clone(),
        screen_stack: stack.clone(),
    };
    let active_screen = active_screen(&router);
    let active_conversation = match &active_screen {
        Screen::Chat { target } => Some(target.clone()),
        _ => None,
    };
    MobileRouteState {
        root_screen: router.default_screen,
        can_pop: !stack.is_empty(),
        stack,
        active_screen,
        active_conversation,
    }
}

fn is_auth_screen(screen: &Screen) -> bool {
    matches!(screen, Screen::Login | Screen::SignIn | Screen::SignUp)
}

fn active_screen(router: &Router) -> Screen {
    router
        .screen_stack
        .last()
        .cloned()
        .unwrap_or_else(|| router.default_screen.clone())
}
