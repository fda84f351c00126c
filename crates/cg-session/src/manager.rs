//! Session management
//!
//! [`SessionManager`] owns the access/refresh token pair and the cached user
//! profile, mirrors every change into a [`KeyValueStore`], and wraps outgoing
//! requests so an expired access token is refreshed and the request retried
//! at most once.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use cg_core::{Config, Error, Result, UnauthorizedRetryPolicy};

use crate::claims;
use crate::events::{EVENT_CAPACITY, LogoutReason, SessionEvent};
use crate::store::{KeyValueStore, StorageKeys};
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::{Credentials, Session, TokenResponse, UserProfile};

/// In-memory session plus a counter bumped on every access token change
#[derive(Default)]
struct State {
    session: Session,
    generation: u64,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    keys: StorageKeys,
    refresh_url: String,
    profile_url: String,
    login_url: String,
    refresh_margin: Duration,
    retry_policy: UnauthorizedRetryPolicy,
    /// Never held across an `.await`
    state: RwLock<State>,
    /// Serializes refresh calls
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

/// Client-side authentication session.
///
/// Cloning is cheap; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("SessionManager")
            .field("authenticated", &state.session.is_authenticated())
            .field("expiry_epoch_millis", &state.session.expiry_epoch_millis)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create an empty session manager. Call [`initialize`](Self::initialize)
    /// to restore a persisted session.
    pub fn new(config: &Config, store: Arc<dyn KeyValueStore>, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                keys: StorageKeys::with_prefix(&config.storage.key_prefix),
                refresh_url: config.refresh_url(),
                profile_url: config.profile_url(),
                login_url: config.login_url(),
                refresh_margin: config.refresh_margin(),
                retry_policy: config.auth.retry_policy,
                state: RwLock::new(State::default()),
                refresh_lock: Mutex::new(()),
                events,
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Receive session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    pub fn is_authenticated(&self) -> bool {
        self.read_state().session.is_authenticated()
    }

    /// Whether the access token expires within the refresh margin.
    ///
    /// Always true when the expiry is unknown.
    pub fn is_token_expiring_soon(&self) -> bool {
        let expiry = self.read_state().session.expiry_epoch_millis;
        claims::is_expiring_soon(expiry, claims::now_millis(), self.inner.refresh_margin)
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.read_state().session.user.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_state().session.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_state().session.refresh_token.clone()
    }

    pub fn expiry_epoch_millis(&self) -> Option<i64> {
        self.read_state().session.expiry_epoch_millis
    }

    /// Copy of the whole session
    pub fn snapshot(&self) -> Session {
        self.read_state().session.clone()
    }

    // ------------------------------------------------------------------
    // Write-through mutations
    // ------------------------------------------------------------------

    fn write_key(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.inner.store.set(key, value),
            None => self.inner.store.remove(key),
        }
    }

    /// Write `next` to the store, then swap it into memory.
    ///
    /// On a store failure the session is cleared in both places before the
    /// error is returned.
    fn commit(&self, state: &mut State, next: Session) -> Result<()> {
        let keys = &self.inner.keys;
        let written = next
            .user
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(Error::from)
            .and_then(|user| {
                self.write_key(&keys.access_token, next.access_token.as_deref())?;
                self.write_key(&keys.refresh_token, next.refresh_token.as_deref())?;
                self.write_key(&keys.user, user.as_deref())
            });

        if let Err(e) = written {
            warn!("Session store write failed, clearing session: {}", e);
            if self.clear_session(state) {
                self.emit(SessionEvent::LoggedOut(LogoutReason::StoreUnavailable));
            }
            return Err(e);
        }

        if state.session.access_token != next.access_token || state.session.refresh_token != next.refresh_token {
            state.generation += 1;
        }
        state.session = next;
        Ok(())
    }

    /// Remove the session from the store and memory; true if there was one
    fn clear_session(&self, state: &mut State) -> bool {
        let keys = &self.inner.keys;
        for key in [&keys.access_token, &keys.refresh_token, &keys.user] {
            if let Err(e) = self.inner.store.remove(key) {
                warn!("Failed to remove {} from session store: {}", key, e);
            }
        }

        let had_session = state.session.is_authenticated() || state.session.has_refresh_token();
        state.session = Session::default();
        state.generation += 1;
        had_session
    }

    /// Replace the access token. Clearing it also clears the cached user.
    pub fn set_token(&self, token: Option<&str>) -> Result<()> {
        let mut state = self.write_state();
        let next = Session {
            access_token: token.map(str::to_string),
            expiry_epoch_millis: token.and_then(decode_expiry),
            refresh_token: state.session.refresh_token.clone(),
            user: token.and(state.session.user.clone()),
        };
        self.commit(&mut state, next)
    }

    pub fn set_refresh_token(&self, token: Option<&str>) -> Result<()> {
        let mut state = self.write_state();
        let next = Session {
            refresh_token: token.map(str::to_string),
            ..state.session.clone()
        };
        self.commit(&mut state, next)
    }

    /// Replace the cached user profile.
    ///
    /// A profile is only cached alongside an access token.
    pub fn set_user(&self, user: Option<UserProfile>) -> Result<()> {
        let mut state = self.write_state();
        if user.is_some() && !state.session.is_authenticated() {
            warn!("Ignoring user profile update without an access token");
            return Ok(());
        }
        let next = Session {
            user,
            ..state.session.clone()
        };
        self.commit(&mut state, next)
    }

    /// Install a session obtained from a prior authentication request
    pub fn login(&self, access_token: &str, refresh_token: Option<&str>, user: UserProfile) -> Result<()> {
        let username = user.username().unwrap_or("<unknown>").to_string();
        {
            let mut state = self.write_state();
            let next = Session {
                access_token: Some(access_token.to_string()),
                refresh_token: refresh_token.map(str::to_string),
                expiry_epoch_millis: decode_expiry(access_token),
                user: Some(user),
            };
            self.commit(&mut state, next)?;
        }

        info!("Logged in as {}", username);
        self.emit(SessionEvent::LoggedIn);
        Ok(())
    }

    /// Clear the session from memory and the store. Never fails.
    pub fn logout(&self) {
        self.logout_with(LogoutReason::Requested);
    }

    fn logout_with(&self, reason: LogoutReason) {
        let had_session = {
            let mut state = self.write_state();
            self.clear_session(&mut state)
        };

        if had_session {
            info!("Logged out ({:?})", reason);
            self.emit(SessionEvent::LoggedOut(reason));
        }
    }

    /// Log out and tell subscribers to send the user back to a login flow
    fn expire_session(&self, reason: LogoutReason) -> Error {
        self.logout_with(reason);
        self.emit(SessionEvent::SessionExpired);
        Error::SessionExpired
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Restore the session from the store.
    ///
    /// Always starts from what the store holds, discarding in-memory state.
    /// When a token is stored without a user profile, the profile is fetched;
    /// if that fails the session is cleared.
    pub async fn initialize(&self) -> Result<()> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let access_token = store.get(&keys.access_token)?;
        let refresh_token = store.get(&keys.refresh_token)?;
        let mut user = match store.get(&keys.user)? {
            Some(raw) => match serde_json::from_str::<UserProfile>(&raw) {
                Ok(user) if !user.as_json().is_null() => Some(user),
                Ok(_) => None,
                Err(e) => {
                    warn!("Discarding unreadable stored user: {}", e);
                    store.remove(&keys.user)?;
                    None
                }
            },
            None => None,
        };

        if access_token.is_none() && user.is_some() {
            debug!("Discarding stored user without an access token");
            store.remove(&keys.user)?;
            user = None;
        }

        {
            let mut state = self.write_state();
            state.session = Session {
                expiry_epoch_millis: access_token.as_deref().and_then(decode_expiry),
                access_token,
                refresh_token,
                user,
            };
            state.generation += 1;
        }

        if self.is_authenticated() && self.current_user().is_none() {
            debug!("Stored session has no user profile, fetching it");
            match self.fetch_profile().await {
                Ok(user) => self.set_user(Some(user))?,
                Err(Error::SessionExpired) => {
                    warn!("Stored session is no longer valid");
                }
                Err(e) => {
                    warn!("Failed to fetch user info: {}", e);
                    self.logout_with(LogoutReason::ProfileUnavailable);
                }
            }
        }

        debug!("Session initialized (authenticated: {})", self.is_authenticated());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Network operations
    // ------------------------------------------------------------------

    /// Log in with a username and password, then load the user profile
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<UserProfile> {
        if credentials.username.trim().is_empty() {
            return Err(Error::InvalidCredentials("username must not be empty".to_string()));
        }
        if credentials.password.trim().is_empty() {
            return Err(Error::InvalidCredentials("password must not be empty".to_string()));
        }

        let request = HttpRequest::post(&self.inner.login_url).with_json(serde_json::to_value(credentials)?);
        let response = self.inner.transport.send(&request).await?;
        if !response.is_success() {
            warn!("Login failed for {}: {}", credentials.username, response.status);
            return Err(api_error(&response));
        }
        let tokens: TokenResponse = response.json()?;

        let mut request = HttpRequest::get(&self.inner.profile_url);
        request.set_bearer(Some(&tokens.access_token));
        let response = self.inner.transport.send(&request).await?;
        if !response.is_success() {
            return Err(api_error(&response));
        }
        let user: UserProfile = response.json()?;

        self.login(&tokens.access_token, tokens.refresh_token.as_deref(), user.clone())?;
        Ok(user)
    }

    async fn fetch_profile(&self) -> Result<UserProfile> {
        let response = self.fetch_with_auth(HttpRequest::get(&self.inner.profile_url)).await?;
        if !response.is_success() {
            return Err(api_error(&response));
        }
        response.json()
    }

    /// Reload the user profile from the backend.
    ///
    /// Returns `Ok(None)` when logged out. Any failure clears the session.
    pub async fn refresh_user(&self) -> Result<Option<UserProfile>> {
        if !self.is_authenticated() {
            return Ok(None);
        }

        match self.fetch_profile().await {
            Ok(user) => {
                self.set_user(Some(user.clone()))?;
                Ok(Some(user))
            }
            Err(Error::SessionExpired) => Err(Error::SessionExpired),
            Err(e) => {
                warn!("Failed to refresh user info: {}", e);
                self.logout_with(LogoutReason::ProfileUnavailable);
                Err(e)
            }
        }
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// `Ok(None)` means the session was cleared and the user has to log in
    /// again. Transport failures are returned as errors and leave the session
    /// alone.
    pub async fn refresh_access_token(&self) -> Result<Option<String>> {
        let observed = self.read_state().generation;
        self.refresh_since(observed).await
    }

    /// Refresh unless the token already changed after generation `observed`.
    ///
    /// Runs on its own task so an abandoned caller cannot interrupt the
    /// persistence or logout that follows the network call.
    async fn refresh_since(&self, observed: u64) -> Result<Option<String>> {
        let this = self.clone();
        tokio::spawn(async move { this.refresh_single_flight(observed).await })
            .await
            .map_err(|e| Error::Transport(format!("token refresh task failed: {}", e)))?
    }

    async fn refresh_single_flight(&self, observed: u64) -> Result<Option<String>> {
        let _guard = self.inner.refresh_lock.lock().await;

        let (generation, access_token, refresh_token) = {
            let state = self.read_state();
            (
                state.generation,
                state.session.access_token.clone(),
                state.session.refresh_token.clone(),
            )
        };

        if generation != observed {
            if let Some(token) = access_token {
                debug!("Access token already replaced, skipping refresh");
                return Ok(Some(token));
            }
        }

        let Some(refresh_token) = refresh_token else {
            debug!("No refresh token available");
            self.logout_with(LogoutReason::RefreshFailed);
            return Ok(None);
        };

        let mut request = HttpRequest::post(&self.inner.refresh_url);
        request.set_bearer(Some(&refresh_token));

        let response = self.inner.transport.send(&request).await?;
        let tokens = if response.is_success() {
            match response.json::<TokenResponse>() {
                Ok(tokens) => Some(tokens),
                Err(e) => {
                    warn!("Unreadable token refresh response: {}", e);
                    None
                }
            }
        } else {
            warn!("Token refresh rejected: {}", response.status);
            None
        };

        let mut state = self.write_state();

        // A login or logout while the request was in flight wins.
        if state.generation != generation {
            debug!("Session changed during token refresh, discarding the result");
            return Ok(state.session.access_token.clone());
        }

        let Some(tokens) = tokens else {
            let had_session = self.clear_session(&mut state);
            drop(state);
            if had_session {
                info!("Logged out ({:?})", LogoutReason::RefreshFailed);
                self.emit(SessionEvent::LoggedOut(LogoutReason::RefreshFailed));
            }
            return Ok(None);
        };

        let next = Session {
            access_token: Some(tokens.access_token.clone()),
            expiry_epoch_millis: decode_expiry(&tokens.access_token),
            refresh_token: tokens.refresh_token.or_else(|| state.session.refresh_token.clone()),
            user: state.session.user.clone(),
        };
        self.commit(&mut state, next)?;
        drop(state);

        info!("Access token refreshed");
        self.emit(SessionEvent::TokenRefreshed);
        Ok(Some(tokens.access_token))
    }

    /// Send a request with the current access token.
    ///
    /// A token close to expiry is refreshed first. A 401 triggers one refresh
    /// and one retry; what happens on a second 401 depends on the configured
    /// [`UnauthorizedRetryPolicy`]. Any other response is returned unchanged.
    pub async fn fetch_with_auth(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut request = request;
        let mut refreshed = false;

        let (expiring, generation) = {
            let state = self.read_state();
            let expiring = state.session.has_refresh_token()
                && claims::is_expiring_soon(
                    state.session.expiry_epoch_millis,
                    claims::now_millis(),
                    self.inner.refresh_margin,
                );
            (expiring, state.generation)
        };
        if expiring {
            debug!("Access token expiring soon, refreshing before {}", request.url);
            self.refresh_since(generation).await?;
            refreshed = true;
        }

        let (token, sent_generation) = {
            let state = self.read_state();
            (state.session.access_token.clone(), state.generation)
        };
        request.set_bearer(token.as_deref());

        let response = self.inner.transport.send(&request).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!("{} {} returned 401", request.method, request.url);

        if self.refresh_token().is_none() {
            return Err(self.expire_session(LogoutReason::Unauthorized));
        }

        if refreshed {
            return self.handle_retry_unauthorized(response);
        }

        match self.refresh_since(sent_generation).await? {
            Some(token) => {
                request.set_bearer(Some(&token));
                let retry = self.inner.transport.send(&request).await?;
                if retry.is_unauthorized() {
                    return self.handle_retry_unauthorized(retry);
                }
                Ok(retry)
            }
            None => Err(self.expire_session(LogoutReason::RefreshFailed)),
        }
    }

    /// 401 on a request that already carried a freshly refreshed token
    fn handle_retry_unauthorized(&self, response: HttpResponse) -> Result<HttpResponse> {
        match self.inner.retry_policy {
            UnauthorizedRetryPolicy::ReturnResponse => {
                warn!("Request still unauthorized after token refresh");
                Ok(response)
            }
            UnauthorizedRetryPolicy::ExpireSession => Err(self.expire_session(LogoutReason::Unauthorized)),
        }
    }
}

fn decode_expiry(token: &str) -> Option<i64> {
    match claims::decode_expiry_millis(token) {
        Ok(expiry) => Some(expiry),
        Err(e) => {
            warn!("Failed to parse token expiry: {}", e);
            None
        }
    }
}

fn api_error(response: &HttpResponse) -> Error {
    Error::Api {
        status: response.status,
        message: response.error_message(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::test_tokens::token_expiring_in;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE_URL: &str = "http://campus.test";

    /// Transport that replays canned responses and records every request
    struct ScriptedTransport {
        refresh_url: String,
        refresh_responses: StdMutex<VecDeque<Result<HttpResponse>>>,
        responses: StdMutex<VecDeque<Result<HttpResponse>>>,
        requests: StdMutex<Vec<HttpRequest>>,
        refresh_calls: AtomicUsize,
        api_calls: AtomicUsize,
        refresh_delay: Duration,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                refresh_url: test_config().refresh_url(),
                refresh_responses: StdMutex::new(VecDeque::new()),
                responses: StdMutex::new(VecDeque::new()),
                requests: StdMutex::new(Vec::new()),
                refresh_calls: AtomicUsize::new(0),
                api_calls: AtomicUsize::new(0),
                refresh_delay: Duration::ZERO,
            }
        }

        fn with_refresh_delay(mut self, delay: Duration) -> Self {
            self.refresh_delay = delay;
            self
        }

        fn push_response(&self, response: HttpResponse) {
            self.responses.lock().unwrap().push_back(Ok(response));
        }

        fn push_failure(&self) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(Error::Transport("connection refused".to_string())));
        }

        fn push_refresh(&self, response: HttpResponse) {
            self.refresh_responses.lock().unwrap().push_back(Ok(response));
        }

        fn push_refresh_failure(&self) {
            self.refresh_responses
                .lock()
                .unwrap()
                .push_back(Err(Error::Transport("connection refused".to_string())));
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        fn api_calls(&self) -> usize {
            self.api_calls.load(Ordering::SeqCst)
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn api_requests(&self) -> Vec<HttpRequest> {
            self.requests()
                .into_iter()
                .filter(|r| r.url != self.refresh_url)
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());

            if request.url == self.refresh_url {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                if self.refresh_delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(self.refresh_delay).await;
                }
                let next = self.refresh_responses.lock().unwrap().pop_front();
                return next.unwrap_or_else(|| Ok(HttpResponse::new(500, "no scripted refresh")));
            }

            self.api_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(HttpResponse::new(200, "{}")))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.api.base_url = BASE_URL.to_string();
        config
    }

    fn alice() -> UserProfile {
        UserProfile::new(serde_json::json!({ "id": 1, "username": "alice" }))
    }

    fn token_response(access_token: &str) -> HttpResponse {
        HttpResponse::json_body(200, &serde_json::json!({ "access_token": access_token, "token_type": "bearer" }))
    }

    fn manager_with(config: &Config, store: &MemoryStore, transport: &Arc<ScriptedTransport>) -> SessionManager {
        SessionManager::new(config, Arc::new(store.clone()), transport.clone())
    }

    fn setup() -> (SessionManager, MemoryStore, Arc<ScriptedTransport>) {
        let store = MemoryStore::new();
        let transport = Arc::new(ScriptedTransport::new());
        let manager = manager_with(&test_config(), &store, &transport);
        (manager, store, transport)
    }

    fn trips_request() -> HttpRequest {
        HttpRequest::get(format!("{}/api/v1/trips/", BASE_URL))
    }

    #[tokio::test]
    async fn test_login_persists_and_restores() {
        let (manager, store, transport) = setup();
        let token = token_expiring_in(3600);

        manager.login(&token, Some("refresh-1"), alice()).unwrap();
        assert!(manager.is_authenticated());
        assert_eq!(manager.current_user(), Some(alice()));

        let restored = manager_with(&test_config(), &store, &transport);
        restored.initialize().await.unwrap();

        assert_eq!(restored.access_token(), Some(token));
        assert_eq!(restored.refresh_token(), Some("refresh-1".to_string()));
        assert_eq!(restored.current_user(), Some(alice()));
        assert_eq!(restored.snapshot(), manager.snapshot());
        assert_eq!(transport.api_calls(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_session_survives_restart() {
        use crate::store::SqliteStore;
        use tokio_test::{assert_err, assert_ok};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.db");
        let transport = Arc::new(ScriptedTransport::new());
        let token = token_expiring_in(3600);

        {
            let store = Arc::new(assert_ok!(SqliteStore::new(&path)));
            let manager = SessionManager::new(&test_config(), store, transport.clone());
            assert_ok!(manager.login(&token, Some("refresh-1"), alice()));
        }

        let store = Arc::new(assert_ok!(SqliteStore::new(&path)));
        let manager = SessionManager::new(&test_config(), store.clone(), transport.clone());
        assert_ok!(manager.initialize().await);
        assert_eq!(manager.access_token(), Some(token));
        assert_eq!(manager.current_user(), Some(alice()));

        manager.logout();
        assert!(assert_ok!(store.keys()).is_empty());

        let blank = Credentials::new(" ", " ");
        assert_err!(manager.authenticate(&blank).await);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_rereads_store() {
        let (manager, store, _transport) = setup();
        manager.login(&token_expiring_in(3600), None, alice()).unwrap();

        store.remove("token").unwrap();
        store.remove("user").unwrap();

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
        assert!(!manager.is_authenticated());
        assert!(manager.current_user().is_none());
    }

    #[tokio::test]
    async fn test_expiring_soon_thresholds() {
        let (manager, _store, _transport) = setup();

        manager.login(&token_expiring_in(120), None, alice()).unwrap();
        assert!(manager.is_token_expiring_soon());

        manager.login(&token_expiring_in(3600), None, alice()).unwrap();
        assert!(!manager.is_token_expiring_soon());
    }

    #[tokio::test]
    async fn test_logout_clears_memory_and_store() {
        let (manager, store, _transport) = setup();
        manager.login(&token_expiring_in(3600), Some("r"), alice()).unwrap();

        manager.logout();

        assert!(!manager.is_authenticated());
        assert!(manager.current_user().is_none());
        assert!(manager.refresh_token().is_none());
        assert!(manager.expiry_epoch_millis().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_logged_out_fetch_sends_no_stale_header() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), None, alice()).unwrap();
        manager.logout();

        transport.push_response(HttpResponse::new(401, "{}"));
        let result = manager.fetch_with_auth(trips_request()).await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert!(!manager.is_authenticated());
        assert_eq!(transport.refresh_calls(), 0);
        for request in transport.requests() {
            assert!(request.header("Authorization").is_none());
        }
    }

    #[tokio::test]
    async fn test_caller_supplied_stale_header_is_dropped() {
        let (manager, _store, transport) = setup();

        let request = trips_request().with_header("Authorization", "Bearer from-last-week");
        let response = manager.fetch_with_auth(request).await.unwrap();

        assert_eq!(response.status, 200);
        assert!(transport.requests()[0].header("Authorization").is_none());
    }

    #[tokio::test]
    async fn test_401_then_refresh_then_success() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        let fresh = token_expiring_in(7200);

        transport.push_response(HttpResponse::new(401, "{}"));
        transport.push_response(HttpResponse::new(200, r#"{"trips":[]}"#));
        transport.push_refresh(token_response(&fresh));

        let response = manager.fetch_with_auth(trips_request()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(manager.access_token(), Some(fresh.clone()));
        assert_eq!(transport.api_calls(), 2);
        assert_eq!(transport.refresh_calls(), 1);

        let api_requests = transport.api_requests();
        assert_eq!(api_requests[1].header("Authorization"), Some(format!("Bearer {}", fresh).as_str()));
        assert_eq!(api_requests[0].url, api_requests[1].url);
    }

    #[tokio::test]
    async fn test_refresh_uses_refresh_token_as_bearer() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        transport.push_refresh(token_response(&token_expiring_in(7200)));

        manager.refresh_access_token().await.unwrap();

        let refresh = &transport.requests()[0];
        assert_eq!(refresh.method, http::Method::POST);
        assert_eq!(refresh.header("Authorization"), Some("Bearer refresh-1"));
    }

    #[tokio::test]
    async fn test_double_401_returns_second_response() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();

        transport.push_response(HttpResponse::new(401, "first"));
        transport.push_response(HttpResponse::new(401, "second"));
        transport.push_refresh(token_response(&token_expiring_in(7200)));

        let response = manager.fetch_with_auth(trips_request()).await.unwrap();

        assert_eq!(response.status, 401);
        assert_eq!(response.text(), "second");
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.api_calls(), 2);
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_double_401_expires_session_when_configured() {
        let mut config = test_config();
        config.auth.retry_policy = UnauthorizedRetryPolicy::ExpireSession;
        let store = MemoryStore::new();
        let transport = Arc::new(ScriptedTransport::new());
        let manager = manager_with(&config, &store, &transport);
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        let mut events = manager.subscribe();

        transport.push_response(HttpResponse::new(401, "{}"));
        transport.push_response(HttpResponse::new(401, "{}"));
        transport.push_refresh(token_response(&token_expiring_in(7200)));

        let result = manager.fetch_with_auth(trips_request()).await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.api_calls(), 2);
        assert!(!manager.is_authenticated());
        assert!(store.is_empty());

        assert_eq!(events.recv().await.unwrap(), SessionEvent::TokenRefreshed);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedOut(LogoutReason::Unauthorized)
        );
        assert_eq!(events.recv().await.unwrap(), SessionEvent::SessionExpired);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_logs_out_offline() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), None, alice()).unwrap();

        let token = manager.refresh_access_token().await.unwrap();

        assert!(token.is_none());
        assert!(!manager.is_authenticated());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_token_never_fails() {
        let (manager, store, transport) = setup();

        manager.login("not.a-valid.token", None, alice()).unwrap();
        assert!(manager.is_authenticated());
        assert!(manager.expiry_epoch_millis().is_none());
        assert!(manager.is_token_expiring_soon());

        store.set("token", "garbage").unwrap();
        let restored = manager_with(&test_config(), &store, &transport);
        restored.initialize().await.unwrap();
        assert!(restored.is_authenticated());
        assert!(restored.expiry_epoch_millis().is_none());
        assert!(restored.is_token_expiring_soon());
    }

    #[tokio::test]
    async fn test_proactive_refresh_substitutes_header() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(60), Some("refresh-1"), alice()).unwrap();
        let fresh = token_expiring_in(3600);
        transport.push_refresh(token_response(&fresh));

        let response = manager.fetch_with_auth(trips_request()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.api_calls(), 1);
        assert_eq!(
            transport.api_requests()[0].header("Authorization"),
            Some(format!("Bearer {}", fresh).as_str())
        );
        assert!(!manager.is_token_expiring_soon());
    }

    #[tokio::test]
    async fn test_401_after_proactive_refresh_does_not_refresh_twice() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(60), Some("refresh-1"), alice()).unwrap();
        transport.push_refresh(token_response(&token_expiring_in(3600)));
        transport.push_response(HttpResponse::new(401, "{}"));

        let response = manager.fetch_with_auth(trips_request()).await.unwrap();

        assert_eq!(response.status, 401);
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejected_expires_session() {
        let (manager, store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("revoked"), alice()).unwrap();
        let mut events = manager.subscribe();

        transport.push_response(HttpResponse::new(401, "{}"));
        transport.push_refresh(HttpResponse::new(401, r#"{"detail":"invalid refresh token"}"#));

        let result = manager.fetch_with_auth(trips_request()).await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert!(!manager.is_authenticated());
        assert!(store.is_empty());
        assert_eq!(transport.api_calls(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedOut(LogoutReason::RefreshFailed)
        );
        assert_eq!(events.recv().await.unwrap(), SessionEvent::SessionExpired);
    }

    #[tokio::test]
    async fn test_unreadable_refresh_body_logs_out() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        transport.push_refresh(HttpResponse::new(200, "<html>oops</html>"));

        assert!(manager.refresh_access_token().await.unwrap().is_none());
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_network_failure_keeps_session() {
        let (manager, _store, transport) = setup();
        let token = token_expiring_in(3600);
        manager.login(&token, Some("refresh-1"), alice()).unwrap();
        transport.push_refresh_failure();

        let result = manager.refresh_access_token().await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(manager.access_token(), Some(token));
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        transport.push_failure();

        let result = manager.fetch_with_auth(trips_request()).await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(manager.is_authenticated());
        assert_eq!(transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_401_errors_returned_as_is() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        transport.push_response(HttpResponse::new(403, r#"{"detail":"forbidden"}"#));

        let response = manager.fetch_with_auth(trips_request()).await.unwrap();

        assert_eq!(response.status, 403);
        assert_eq!(transport.refresh_calls(), 0);
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token() {
        let (manager, store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        transport.push_refresh(HttpResponse::json_body(
            200,
            &serde_json::json!({ "access_token": token_expiring_in(7200), "refresh_token": "refresh-2" }),
        ));

        manager.refresh_access_token().await.unwrap();

        assert_eq!(manager.refresh_token(), Some("refresh-2".to_string()));
        assert_eq!(store.get("refreshToken").unwrap(), Some("refresh-2".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_single_flight() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        let fresh = token_expiring_in(7200);
        transport.push_refresh(token_response(&fresh));
        transport.push_refresh(token_response("should-not-be-used"));

        let (a, b) = futures::join!(manager.refresh_access_token(), manager.refresh_access_token());

        assert_eq!(a.unwrap(), Some(fresh.clone()));
        assert_eq!(b.unwrap(), Some(fresh.clone()));
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(manager.access_token(), Some(fresh));
    }

    #[tokio::test]
    async fn test_abandoned_fetch_still_completes_refresh() {
        let store = MemoryStore::new();
        let transport = Arc::new(ScriptedTransport::new().with_refresh_delay(Duration::from_millis(50)));
        let manager = manager_with(&test_config(), &store, &transport);
        manager.login(&token_expiring_in(60), Some("refresh-1"), alice()).unwrap();
        let fresh = token_expiring_in(3600);
        transport.push_refresh(token_response(&fresh));

        let abandoned = tokio::time::timeout(Duration::from_millis(5), manager.fetch_with_auth(trips_request())).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.access_token(), Some(fresh.clone()));
        assert_eq!(store.get("token").unwrap(), Some(fresh));
        assert_eq!(transport.api_calls(), 0);
    }

    #[tokio::test]
    async fn test_initialize_fetches_missing_user() {
        let (manager, store, transport) = setup();
        let token = token_expiring_in(3600);
        store.set("token", &token).unwrap();
        transport.push_response(HttpResponse::json_body(200, alice().as_json()));

        manager.initialize().await.unwrap();

        assert_eq!(manager.current_user(), Some(alice()));
        assert_eq!(store.get("user").unwrap(), Some(r#"{"id":1,"username":"alice"}"#.to_string()));
        let request = &transport.requests()[0];
        assert_eq!(request.url, test_config().profile_url());
        assert_eq!(request.header("Authorization"), Some(format!("Bearer {}", token).as_str()));
    }

    #[tokio::test]
    async fn test_initialize_logs_out_when_profile_fetch_fails() {
        let (manager, store, transport) = setup();
        store.set("token", &token_expiring_in(3600)).unwrap();
        transport.push_response(HttpResponse::new(500, "boom"));

        manager.initialize().await.unwrap();

        assert!(!manager.is_authenticated());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_discards_unreadable_user() {
        let (manager, store, transport) = setup();
        store.set("token", &token_expiring_in(3600)).unwrap();
        store.set("user", "{not json").unwrap();
        transport.push_response(HttpResponse::json_body(200, alice().as_json()));

        manager.initialize().await.unwrap();

        assert_eq!(manager.current_user(), Some(alice()));
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_user_updates_profile() {
        let (manager, store, transport) = setup();
        manager.login(&token_expiring_in(3600), None, alice()).unwrap();
        let updated = UserProfile::new(serde_json::json!({ "id": 1, "username": "alice", "email": "a@campus.edu" }));
        transport.push_response(HttpResponse::json_body(200, updated.as_json()));

        let user = manager.refresh_user().await.unwrap();

        assert_eq!(user, Some(updated.clone()));
        assert_eq!(manager.current_user(), Some(updated));
        assert!(store.get("user").unwrap().unwrap().contains("a@campus.edu"));
    }

    #[tokio::test]
    async fn test_refresh_user_failure_logs_out() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(3600), None, alice()).unwrap();
        transport.push_response(HttpResponse::new(500, r#"{"detail":"db down"}"#));

        let result = manager.refresh_user().await;

        assert!(matches!(result, Err(Error::Api { status: 500, .. })));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_user_when_logged_out() {
        let (manager, _store, transport) = setup();
        assert!(manager.refresh_user().await.unwrap().is_none());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_logs_in() {
        let (manager, store, transport) = setup();
        let token = token_expiring_in(1800);
        transport.push_response(HttpResponse::json_body(
            200,
            &serde_json::json!({ "access_token": token, "refresh_token": "refresh-9", "token_type": "bearer" }),
        ));
        transport.push_response(HttpResponse::json_body(200, alice().as_json()));
        let mut events = manager.subscribe();

        let user = manager.authenticate(&Credentials::new("alice", "Secr3t!pw")).await.unwrap();

        assert_eq!(user, alice());
        assert_eq!(manager.access_token(), Some(token.clone()));
        assert_eq!(store.get("refreshToken").unwrap(), Some("refresh-9".to_string()));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedIn);

        let requests = transport.requests();
        assert_eq!(requests[0].url, test_config().login_url());
        assert_eq!(requests[0].body.as_ref().unwrap()["username"], "alice");
        assert_eq!(requests[1].header("Authorization"), Some(format!("Bearer {}", token).as_str()));
    }

    #[tokio::test]
    async fn test_authenticate_rejects_blank_credentials() {
        let (manager, _store, transport) = setup();

        let result = manager.authenticate(&Credentials::new("alice", "   ")).await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));

        let result = manager.authenticate(&Credentials::new("", "pw")).await;
        assert!(matches!(result, Err(Error::InvalidCredentials(_))));

        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_surfaces_backend_detail() {
        let (manager, _store, transport) = setup();
        transport.push_response(HttpResponse::json_body(401, &serde_json::json!({ "detail": "wrong password" })));

        let result = manager.authenticate(&Credentials::new("alice", "nope")).await;

        match result {
            Err(Error::Api { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "wrong password");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_set_token_none_clears_user() {
        let (manager, store, _transport) = setup();
        manager.login(&token_expiring_in(3600), Some("r"), alice()).unwrap();

        manager.set_token(None).unwrap();

        assert!(manager.current_user().is_none());
        assert!(manager.expiry_epoch_millis().is_none());
        assert!(store.get("user").unwrap().is_none());
        assert_eq!(manager.refresh_token(), Some("r".to_string()));
    }

    #[tokio::test]
    async fn test_set_user_requires_token() {
        let (manager, store, _transport) = setup();
        manager.set_user(Some(alice())).unwrap();

        assert!(manager.current_user().is_none());
        assert!(store.get("user").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefixed_keys_do_not_collide() {
        let store = MemoryStore::new();
        let transport = Arc::new(ScriptedTransport::new());
        let mut admin_config = test_config();
        admin_config.storage.key_prefix = "admin_".to_string();

        let user_app = manager_with(&test_config(), &store, &transport);
        let admin_app = manager_with(&admin_config, &store, &transport);

        user_app.login(&token_expiring_in(3600), None, alice()).unwrap();
        admin_app.initialize().await.unwrap();
        assert!(!admin_app.is_authenticated());

        admin_app.login("admin-token", None, alice()).unwrap();
        assert_eq!(store.get("admin_token").unwrap(), Some("admin-token".to_string()));
        assert!(user_app.access_token().unwrap() != "admin-token");
    }

    /// Store whose writes to one key can be made to fail
    #[derive(Clone, Default)]
    struct FlakyStore {
        entries: MemoryStore,
        failing_key: Arc<StdMutex<Option<String>>>,
    }

    impl FlakyStore {
        fn fail_writes_to(&self, key: &str) {
            *self.failing_key.lock().unwrap() = Some(key.to_string());
        }
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.entries.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.failing_key.lock().unwrap().as_deref() == Some(key) {
                return Err(Error::Store(format!("disk full writing {}", key)));
            }
            self.entries.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.entries.remove(key)
        }
    }

    #[tokio::test]
    async fn test_logout_during_refresh_stays_logged_out() {
        let store = MemoryStore::new();
        let transport = Arc::new(ScriptedTransport::new().with_refresh_delay(Duration::from_millis(50)));
        let manager = manager_with(&test_config(), &store, &transport);
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        transport.push_refresh(token_response(&token_expiring_in(7200)));

        let refreshing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_access_token().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.logout();

        let token = refreshing.await.unwrap().unwrap();

        assert!(token.is_none());
        assert_eq!(transport.refresh_calls(), 1);
        assert!(!manager.is_authenticated());
        assert!(manager.refresh_token().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_login_during_refresh_keeps_new_account() {
        let store = MemoryStore::new();
        let transport = Arc::new(ScriptedTransport::new().with_refresh_delay(Duration::from_millis(50)));
        let manager = manager_with(&test_config(), &store, &transport);
        manager.login(&token_expiring_in(3600), Some("alice-refresh"), alice()).unwrap();
        transport.push_refresh(token_response("alice-new-token"));

        let refreshing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh_access_token().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let bob = UserProfile::new(serde_json::json!({ "id": 2, "username": "bob" }));
        manager.login("bob-token", Some("bob-refresh"), bob.clone()).unwrap();

        let token = refreshing.await.unwrap().unwrap();

        assert_eq!(token, Some("bob-token".to_string()));
        assert_eq!(manager.access_token(), Some("bob-token".to_string()));
        assert_eq!(manager.refresh_token(), Some("bob-refresh".to_string()));
        assert_eq!(manager.current_user(), Some(bob));
        assert_eq!(store.get("token").unwrap(), Some("bob-token".to_string()));
    }

    #[tokio::test]
    async fn test_failed_login_write_clears_session() {
        let store = FlakyStore::default();
        let transport = Arc::new(ScriptedTransport::new());
        let manager = SessionManager::new(&test_config(), Arc::new(store.clone()), transport);
        manager.login(&token_expiring_in(3600), Some("alice-refresh"), alice()).unwrap();
        let mut events = manager.subscribe();

        store.fail_writes_to("user");
        let bob = UserProfile::new(serde_json::json!({ "id": 2, "username": "bob" }));
        let result = manager.login("bob-token", Some("bob-refresh"), bob);

        assert!(matches!(result, Err(Error::Store(_))));
        assert!(!manager.is_authenticated());
        assert!(manager.refresh_token().is_none());
        assert!(manager.current_user().is_none());
        assert!(store.entries.is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedOut(LogoutReason::StoreUnavailable)
        );
    }

    #[tokio::test]
    async fn test_failed_rotation_write_clears_session() {
        let store = FlakyStore::default();
        let transport = Arc::new(ScriptedTransport::new());
        let manager = SessionManager::new(&test_config(), Arc::new(store.clone()), transport.clone());
        manager.login(&token_expiring_in(3600), Some("refresh-1"), alice()).unwrap();
        transport.push_refresh(HttpResponse::json_body(
            200,
            &serde_json::json!({ "access_token": token_expiring_in(7200), "refresh_token": "refresh-2" }),
        ));

        store.fail_writes_to("refreshToken");
        let result = manager.refresh_access_token().await;

        assert!(matches!(result, Err(Error::Store(_))));
        assert!(!manager.is_authenticated());
        assert!(store.entries.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_proactive_refresh_sends_no_header() {
        let (manager, _store, transport) = setup();
        manager.login(&token_expiring_in(60), Some("revoked"), alice()).unwrap();
        transport.push_refresh(HttpResponse::new(401, "{}"));
        transport.push_response(HttpResponse::new(401, "{}"));

        let result = manager.fetch_with_auth(trips_request()).await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.api_calls(), 1);
        assert!(transport.api_requests()[0].header("Authorization").is_none());
        assert!(!manager.is_authenticated());
    }
}
