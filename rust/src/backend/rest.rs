// Hosted backend over its v3 REST API.
//
// Every request carries the `appid` and `apikey` headers; requests made on a
// user's behalf add `onBehalfOf`. Success bodies are `{"data": ...}`, failures
// `{"error": {"code": "...", "message": "..."}}`. The REST surface has no push
// channel, so the feed is a per-listener polling task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    AuthService, BackendError, BackendErrorKind, DirectoryService, FeedCallback, GroupRecord,
    MessagingService, RemoteMessage, SessionContext, UserRecord,
};
use crate::state::{now_seconds, ConversationTarget, ReceiverType};

const FEED_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct RestBackendOptions {
    pub app_id: String,
    pub region: String,
    pub api_key: String,
    /// Overrides the region-derived base URL (staging, local mocks).
    pub api_base_url: Option<String>,
    pub feed_poll_interval: Duration,
}

impl RestBackendOptions {
    pub fn base_url(&self) -> String {
        match self.api_base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!(
                "https://{}.api-{}.cometchat.io/v3",
                self.app_id.trim(),
                self.region.trim()
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    uid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl From<WireUser> for UserRecord {
    fn from(u: WireUser) -> Self {
        UserRecord {
            uid: u.uid,
            name: u.name,
            avatar: u.avatar.filter(|a| !a.trim().is_empty()),
            status: u.status,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGroup {
    guid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    members_count: u32,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessageData {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: serde_json::Value,
    sender: String,
    receiver: String,
    receiver_type: String,
    #[serde(default)]
    sent_at: i64,
    #[serde(default)]
    data: WireMessageData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAuthToken {
    auth_token: String,
}

fn wire_id(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Text messages only; action/custom/media entries have no `data.text`.
fn remote_from_wire(m: WireMessage) -> Option<RemoteMessage> {
    let id = wire_id(&m.id)?;
    let text = m.data.text?;
    let receiver_type = ReceiverType::parse(&m.receiver_type)?;
    Some(RemoteMessage {
        id,
        text,
        sender_uid: m.sender,
        receiver_type,
        receiver_id: m.receiver,
        sent_at: m.sent_at,
    })
}

/// Where the next feed poll starts. The first poll asks for everything sent
/// since the listener registered; every later one asks for messages after the
/// last id seen, so a busy second can never stall the feed.
#[derive(Debug, Clone, PartialEq)]
enum FeedCursor {
    SentSince(i64),
    After(String),
}

impl FeedCursor {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("perPage", FEED_PAGE_SIZE.to_string()),
            ("affix", "append".to_string()),
        ];
        match self {
            FeedCursor::SentSince(ts) => query.push(("sentAt", ts.to_string())),
            FeedCursor::After(id) => query.push(("id", id.clone())),
        }
        query
    }

    /// Move past the page, including entries that were not text messages.
    fn advance(&mut self, page: &[WireMessage]) {
        if let Some(id) = page.last().and_then(|m| wire_id(&m.id)) {
            *self = FeedCursor::After(id);
        }
    }
}

#[derive(Clone)]
struct RestClient {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    api_key: String,
}

impl RestClient {
    /// `base_url` plus `segments`, each percent-encoded as a single path
    /// segment so ids can never reach another endpoint.
    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            BackendError::new(
                BackendErrorKind::InvalidRequest,
                format!("bad api base url {}: {e}", self.base_url),
            )
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::new(
                    BackendErrorKind::InvalidRequest,
                    format!("api base url {} cannot take a path", self.base_url),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        on_behalf_of: Option<&str>,
    ) -> Result<RequestBuilder, BackendError> {
        let mut req = self
            .client
            .request(method, self.url(segments)?)
            .header("appid", &self.app_id)
            .header("apikey", &self.api_key)
            .header("accept", "application/json");
        if let Some(uid) = on_behalf_of {
            req = req.header("onBehalfOf", uid);
        }
        Ok(req)
    }

    async fn execute<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        let resp = req.send().await.map_err(|e| {
            BackendError::new(
                BackendErrorKind::ConnectionFailure,
                format!("request failed: {e}"),
            )
        })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| {
            BackendError::new(
                BackendErrorKind::ConnectionFailure,
                format!("read response: {e}"),
            )
        })?;
        if !status.is_success() {
            if let Ok(env) = serde_json::from_slice::<ErrorEnvelope>(&body) {
                return Err(BackendError::from_code(&env.error.code, env.error.message));
            }
            let kind = match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendErrorKind::Unauthorized,
                StatusCode::BAD_REQUEST => BackendErrorKind::InvalidRequest,
                _ => BackendErrorKind::Other,
            };
            return Err(BackendError::new(kind, format!("http {status}")));
        }
        serde_json::from_slice::<Envelope<T>>(&body)
            .map(|env| env.data)
            .map_err(|e| BackendError::other(format!("decode response: {e}")))
    }

    async fn messages(
        &self,
        req: RequestBuilder,
    ) -> Result<Vec<RemoteMessage>, BackendError> {
        let wire: Vec<WireMessage> = self.execute(req).await?;
        Ok(wire.into_iter().filter_map(remote_from_wire).collect())
    }

    /// One feed page. Returns the text messages and whether the page was full.
    async fn feed_page(
        &self,
        uid: &str,
        cursor: &mut FeedCursor,
    ) -> Result<(Vec<RemoteMessage>, bool), BackendError> {
        let req = self
            .request(Method::GET, &["messages"], Some(uid))?
            .query(&cursor.query());
        let wire: Vec<WireMessage> = self.execute(req).await?;
        let full = wire.len() >= FEED_PAGE_SIZE as usize;
        cursor.advance(&wire);
        Ok((wire.into_iter().filter_map(remote_from_wire).collect(), full))
    }
}

pub struct RestBackend {
    http: RestClient,
    poll_interval: Duration,
    // listener id -> liveness flag of its polling task
    feeds: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl RestBackend {
    pub fn new(options: RestBackendOptions) -> Self {
        Self {
            http: RestClient {
                client: reqwest::Client::new(),
                base_url: options.base_url(),
                app_id: options.app_id,
                api_key: options.api_key,
            },
            poll_interval: options.feed_poll_interval,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        match self.feeds.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

#[async_trait]
impl AuthService for RestBackend {
    async fn create_user(&self, uid: &str, name: &str) -> Result<UserRecord, BackendError> {
        let req = self
            .http
            .request(Method::POST, &["users"], None)?
            .json(&serde_json::json!({ "uid": uid, "name": name }));
        let user: WireUser = self.http.execute(req).await?;
        Ok(user.into())
    }

    async fn login(&self, uid: &str) -> Result<SessionContext, BackendError> {
        let user: WireUser = self
            .http
            .execute(self.http.request(Method::GET, &["users", uid], None)?)
            .await?;
        let token: WireAuthToken = self
            .http
            .execute(
                self.http
                    .request(Method::POST, &["users", uid, "auth_tokens"], None)?
                    .json(&serde_json::json!({})),
            )
            .await?;
        Ok(SessionContext {
            uid: user.uid,
            name: user.name,
            auth_token: Some(token.auth_token),
        })
    }

    async fn logout(&self, session: &SessionContext) -> Result<(), BackendError> {
        let Some(token) = session.auth_token.as_deref() else {
            return Ok(());
        };
        let req = self.http.request(
            Method::DELETE,
            &["users", &session.uid, "auth_tokens", token],
            None,
        )?;
        let _: serde_json::Value = self.http.execute(req).await?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryService for RestBackend {
    async fn fetch_users(
        &self,
        session: &SessionContext,
        page_size: u32,
    ) -> Result<Vec<UserRecord>, BackendError> {
        let req = self
            .http
            .request(Method::GET, &["users"], Some(&session.uid))?
            .query(&[("perPage", page_size)]);
        let users: Vec<WireUser> = self.http.execute(req).await?;
        Ok(users.into_iter().map(UserRecord::from).collect())
    }

    async fn fetch_groups(
        &self,
        session: &SessionContext,
        page_size: u32,
    ) -> Result<Vec<GroupRecord>, BackendError> {
        let req = self
            .http
            .request(Method::GET, &["groups"], Some(&session.uid))?
            .query(&[("perPage", page_size.to_string())])
            .query(&[("hasJoined", "true")]);
        let groups: Vec<WireGroup> = self.http.execute(req).await?;
        Ok(groups
            .into_iter()
            .map(|g| GroupRecord {
                guid: g.guid,
                name: g.name,
                members_count: g.members_count,
            })
            .collect())
    }
}

#[async_trait]
impl MessagingService for RestBackend {
    async fn fetch_history(
        &self,
        session: &SessionContext,
        target: &ConversationTarget,
        page_size: u32,
    ) -> Result<Vec<RemoteMessage>, BackendError> {
        let segments = match target {
            ConversationTarget::User { uid } => ["users", uid.as_str(), "messages"],
            ConversationTarget::Group { guid } => ["groups", guid.as_str(), "messages"],
        };
        let req = self
            .http
            .request(Method::GET, &segments, Some(&session.uid))?
            .query(&[("perPage", page_size)]);
        self.http.messages(req).await
    }

    async fn send_text(
        &self,
        session: &SessionContext,
        target: &ConversationTarget,
        text: &str,
    ) -> Result<RemoteMessage, BackendError> {
        let body = serde_json::json!({
            "receiver": target.id(),
            "receiverType": target.receiver_type().as_str(),
            "category": "message",
            "type": "text",
            "data": { "text": text },
        });
        let req = self
            .http
            .request(Method::POST, &["messages"], Some(&session.uid))?
            .json(&body);
        let wire: WireMessage = self.http.execute(req).await?;
        remote_from_wire(wire)
            .ok_or_else(|| BackendError::other("send acknowledged with a non-text message"))
    }

    async fn subscribe(
        &self,
        session: &SessionContext,
        listener_id: &str,
        callback: FeedCallback,
    ) -> Result<(), BackendError> {
        // Poll once so credential problems surface as a subscription error
        // instead of a silently dead poller.
        let first = self
            .http
            .request(Method::GET, &["messages"], Some(&session.uid))?
            .query(&[("perPage", 1u32)]);
        self.http.messages(first).await?;

        let alive = Arc::new(AtomicBool::new(true));
        if let Some(previous) = self
            .feeds()
            .insert(listener_id.to_string(), alive.clone())
        {
            previous.store(false, Ordering::SeqCst);
        }

        let http = self.http.clone();
        let uid = session.uid.clone();
        let interval = self.poll_interval;
        let listener = listener_id.to_string();
        tokio::spawn(async move {
            let mut cursor = FeedCursor::SentSince(now_seconds());
            let mut wait = true;
            loop {
                if wait {
                    tokio::time::sleep(interval).await;
                }
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                match http.feed_page(&uid, &mut cursor).await {
                    Ok((batch, full)) => {
                        // A full page means more is waiting: fetch it right away.
                        wait = !full;
                        for msg in batch {
                            if !alive.load(Ordering::SeqCst) {
                                break;
                            }
                            callback(msg);
                        }
                    }
                    Err(e) => {
                        wait = true;
                        tracing::warn!(listener = %listener, err = %e, "feed poll failed");
                    }
                }
            }
            tracing::debug!(listener = %listener, "feed poller stopped");
        });
        Ok(())
    }

    fn unsubscribe(&self, listener_id: &str) {
        if let Some(alive) = self.feeds().remove(listener_id) {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;

    use super::{remote_from_wire, FeedCursor, RestBackend, RestBackendOptions, WireMessage};
    use crate::state::ReceiverType;

    fn options(base: Option<&str>) -> RestBackendOptions {
        RestBackendOptions {
            app_id: "2561abc".to_string(),
            region: "us".to_string(),
            api_key: "key".to_string(),
            api_base_url: base.map(str::to_string),
            feed_poll_interval: Duration::from_secs(2),
        }
    }

    #[test]
    fn base_url_is_derived_from_app_and_region() {
        assert_eq!(
            options(None).base_url(),
            "https://2561abc.api-us.cometchat.io/v3"
        );
        assert_eq!(
            options(Some("http://127.0.0.1:8080/v3/")).base_url(),
            "http://127.0.0.1:8080/v3"
        );
        assert_eq!(
            options(Some("  ")).base_url(),
            "https://2561abc.api-us.cometchat.io/v3"
        );
    }

    #[test]
    fn wire_messages_map_numeric_and_string_ids() {
        let numeric: WireMessage = serde_json::from_value(serde_json::json!({
            "id": 1042,
            "sender": "bob",
            "receiver": "alice",
            "receiverType": "user",
            "sentAt": 1700000000,
            "data": { "text": "hi" }
        }))
        .unwrap();
        let m = remote_from_wire(numeric).unwrap();
        assert_eq!(m.id, "1042");
        assert_eq!(m.receiver_type, ReceiverType::User);
        assert_eq!(m.sent_at, 1_700_000_000);

        let string: WireMessage = serde_json::from_value(serde_json::json!({
            "id": "77",
            "sender": "bob",
            "receiver": "hikers",
            "receiverType": "group",
            "data": { "text": "trail?" }
        }))
        .unwrap();
        let m = remote_from_wire(string).unwrap();
        assert_eq!(m.id, "77");
        assert_eq!(m.receiver_type, ReceiverType::Group);
    }

    #[test]
    fn non_text_messages_are_skipped() {
        let action: WireMessage = serde_json::from_value(serde_json::json!({
            "id": 5,
            "sender": "app_system",
            "receiver": "hikers",
            "receiverType": "group",
            "data": { "action": "joined" }
        }))
        .unwrap();
        assert!(remote_from_wire(action).is_none());
    }

    fn wire(id: serde_json::Value, text: Option<&str>) -> WireMessage {
        let data = match text {
            Some(t) => serde_json::json!({ "text": t }),
            None => serde_json::json!({ "action": "joined" }),
        };
        serde_json::from_value(serde_json::json!({
            "id": id,
            "sender": "bob",
            "receiver": "alice",
            "receiverType": "user",
            "sentAt": 1700000000,
            "data": data
        }))
        .unwrap()
    }

    #[test]
    fn ids_are_encoded_as_single_path_segments() {
        let backend = RestBackend::new(options(Some("http://127.0.0.1:8080/v3/")));
        let req = backend
            .http
            .request(Method::GET, &["users", "bob/auth_tokens"], None)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.url().path(), "/v3/users/bob%2Fauth_tokens");

        let req = backend
            .http
            .request(Method::GET, &["groups", "a?b#c", "messages"], Some("alice"))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.url().path(), "/v3/groups/a%3Fb%23c/messages");
        assert_eq!(req.url().query(), None);
    }

    #[test]
    fn unusable_base_url_is_an_invalid_request() {
        let backend = RestBackend::new(options(Some("not a url")));
        let err = backend
            .http
            .request(Method::GET, &["users"], None)
            .unwrap_err();
        assert_eq!(err.kind, crate::backend::BackendErrorKind::InvalidRequest);
    }

    #[test]
    fn feed_cursor_moves_past_every_polled_message() {
        let mut cursor = FeedCursor::SentSince(1_700_000_000);
        assert!(cursor
            .query()
            .contains(&("sentAt", "1700000000".to_string())));

        cursor.advance(&[]);
        assert_eq!(cursor, FeedCursor::SentSince(1_700_000_000));

        // A page ending on a non-text entry still moves the cursor past it.
        cursor.advance(&[
            wire(serde_json::json!(10), Some("one")),
            wire(serde_json::json!(11), None),
        ]);
        assert_eq!(cursor, FeedCursor::After("11".to_string()));
        let query = cursor.query();
        assert!(query.contains(&("id", "11".to_string())));
        assert!(!query.iter().any(|(k, _)| *k == "sentAt"));
    }

    #[test]
    fn a_second_with_more_than_a_page_of_messages_does_not_stall() {
        let mut cursor = FeedCursor::SentSince(1_700_000_000);
        let first: Vec<WireMessage> = (1..=100)
            .map(|i| wire(serde_json::json!(i), Some("burst")))
            .collect();
        cursor.advance(&first);
        let after_first = cursor.clone();
        let second: Vec<WireMessage> = (101..=150)
            .map(|i| wire(serde_json::json!(i), Some("burst")))
            .collect();
        cursor.advance(&second);
        assert_eq!(after_first, FeedCursor::After("100".to_string()));
        assert_eq!(cursor, FeedCursor::After("150".to_string()));
    }
}
