// User list: fetch, filter, map.

use super::*;

use crate::backend::{GroupRecord, UserRecord};
use crate::state::{GroupSummary, UserListState, UserSummary};

/// Accounts every fresh backend app ships with. Matched as case-insensitive
/// substrings of uid or name.
pub(super) const SAMPLE_USERS: &[&str] = &[
    "superhero1",
    "superhero2",
    "superhero3",
    "superhero4",
    "superhero5",
    "ironman",
    "captainamerica",
    "spiderman",
    "wolverine",
    "andrew",
    "joseph",
    "john",
    "paul",
];

const NO_CUSTOM_USERS: &str = "No custom users found. Only sample users are available.";
const NO_USERS: &str = "No users found in your app.";
const USERS_FAILED: &str = "Failed to load users. Pull down to refresh.";

pub(super) fn is_sample_user(user: &UserRecord, denylist: &[String]) -> bool {
    let name = user.name.to_lowercase();
    let uid = user.uid.to_lowercase();
    denylist.iter().any(|sample| {
        let sample = sample.to_lowercase();
        !sample.is_empty() && (name.contains(&sample) || uid.contains(&sample))
    })
}

/// Rows for the user list, with the error line the screen should show.
pub(super) fn build_user_list(
    users: Vec<UserRecord>,
    groups: Vec<GroupRecord>,
    me: &str,
    denylist: &[String],
) -> UserListState {
    let fetched = users.len();
    let users: Vec<UserSummary> = users
        .into_iter()
        .filter(|u| u.uid != me && !is_sample_user(u, denylist))
        .map(|u| UserSummary {
            is_online: u.status.as_deref() == Some("online"),
            uid: u.uid,
            name: u.name,
            avatar_url: u.avatar,
        })
        .collect();
    let error = if fetched == 0 {
        Some(NO_USERS.to_string())
    } else if users.is_empty() {
        Some(NO_CUSTOM_USERS.to_string())
    } else {
        None
    };
    UserListState {
        users,
        groups: groups
            .into_iter()
            .map(|g| GroupSummary {
                guid: g.guid,
                name: g.name,
                member_count: g.members_count,
            })
            .collect(),
        error,
    }
}

impl AppCore {
    pub(super) fn refresh_user_list(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        self.set_busy(|b| b.fetching_users = true);

        let token = self.session_token;
        let directory = self.services.directory.clone();
        let user_page = self.config.user_page_size();
        let group_page = self.config.group_page_size();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let (users, groups) = tokio::join!(
                directory.fetch_users(&session, user_page),
                directory.fetch_groups(&session, group_page),
            );
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::DirectoryFetched {
                token,
                users,
                groups,
            })));
        });
    }

    pub(super) fn handle_directory_fetched(
        &mut self,
        users: Result<Vec<UserRecord>, BackendError>,
        groups: Result<Vec<GroupRecord>, BackendError>,
    ) {
        self.set_busy(|b| b.fetching_users = false);
        let Some(me) = self.session.as_ref().map(|s| s.uid.clone()) else {
            return;
        };
        let groups = groups.unwrap_or_else(|e| {
            tracing::warn!(err = %e, "group fetch failed");
            vec![]
        });
        self.state.user_list = match users {
            Ok(users) => {
                tracing::info!(fetched = users.len(), "users fetched");
                build_user_list(users, groups, &me, &self.config.sample_user_denylist())
            }
            Err(e) => {
                tracing::warn!(err = %e, "user fetch failed");
                UserListState {
                    users: vec![],
                    groups: vec![],
                    error: Some(USERS_FAILED.to_string()),
                }
            }
        };
        self.emit_user_list();
    }

    /// Title for a chat screen: the peer/group name when the list knows it.
    pub(super) fn conversation_title(&self, target: &ConversationTarget) -> String {
        let known = match target {
            ConversationTarget::User { uid } => self
                .state
                .user_list
                .users
                .iter()
                .find(|u| &u.uid == uid)
                .map(|u| u.name.clone()),
            ConversationTarget::Group { guid } => self
                .state
                .user_list
                .groups
                .iter()
                .find(|g| &g.guid == guid)
                .map(|g| g.name.clone()),
        };
        known
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Chat".to_string())
    }
}
