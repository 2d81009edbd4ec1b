//! Authentication lifecycle: token ownership, expiry detection and the
//! forced sign-out that follows a rejected token.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiOutcome, ApiRequest, ApiResponse, ApiTransport};
use crate::clock::Clock;
use crate::config::{ApiRoutes, ClientConfig};
use crate::error::{ClientError, SESSION_EXPIRED_MESSAGE};
use crate::shell::{Navigator, Notice, Notifier, SessionEndReason, SessionListener};

const INVALID_TOKEN_MESSAGE_FRAGMENT: &str = "invalid authorization token";
const VALIDATION_STATUS: u16 = 422;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub redirect_target: Option<String>,
    pub stay_signed_in: bool,
}

impl Session {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// `expires_at` only counts while a token is held.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token.is_some() && self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    fn clear_credentials(&mut self) {
        self.token = None;
        self.expires_at = None;
        self.stay_signed_in = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_name: String,
    pub password: String,
    pub stay_signed_in: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    pub nick_name: Option<String>,
    pub email: String,
    pub password: String,
    pub stay_signed_in: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    token: String,
    token_expiration_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session store error: {0}")]
pub struct SessionStoreError(pub String);

/// Storage for sessions the user asked to keep across restarts.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>, SessionStoreError>;
    fn persist(&self, session: &PersistedSession) -> Result<(), SessionStoreError>;
    fn clear(&self) -> Result<(), SessionStoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    saved: Mutex<Option<PersistedSession>>,
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<PersistedSession>, SessionStoreError> {
        Ok(self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn persist(&self, session: &PersistedSession) -> Result<(), SessionStoreError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionStoreError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Navigation and notice handles supplied by the hosting shell.
#[derive(Clone)]
pub struct ShellHandles {
    pub navigator: Arc<dyn Navigator>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct SessionManager {
    state: Mutex<Session>,
    transport: Arc<dyn ApiTransport>,
    routes: ApiRoutes,
    sign_in_path: String,
    clock: Arc<dyn Clock>,
    shell: ShellHandles,
    store: Arc<dyn SessionStore>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl SessionManager {
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn ApiTransport>,
        shell: ShellHandles,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(Session::default()),
            transport,
            routes: config.routes.clone(),
            sign_in_path: config.sign_in_path.clone(),
            clock,
            shell,
            store: Arc::new(MemorySessionStore::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.lock_state().clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock_state().is_authenticated()
    }

    #[must_use]
    pub fn bearer_token(&self) -> Option<String> {
        self.lock_state().token.clone()
    }

    #[must_use]
    pub fn redirect_target(&self) -> Option<String> {
        self.lock_state().redirect_target.clone()
    }

    /// Combined expiry query and sign-out.
    ///
    /// Returns `true` only for the call that observed the expired token; that
    /// call records the current location as the post-login redirect, clears
    /// the credentials and sends the user to the sign-in page. Every later
    /// call sees an empty session and returns `false`.
    pub fn check_and_invalidate_if_expired(&self) -> bool {
        let now = self.clock.now();
        if !self.lock_state().is_expired_at(now) {
            return false;
        }

        let location = self.shell.navigator.current_location();
        let cleared = {
            let mut state = self.lock_state();
            if state.is_expired_at(now) {
                state.clear_credentials();
                state.redirect_target = Some(location.clone());
                true
            } else {
                false
            }
        };
        if !cleared {
            return false;
        }

        info!(redirect_target = %location, "session token expired");
        self.end_session(SessionEndReason::Expired);
        self.shell.navigator.navigate(&self.sign_in_path);
        self.shell
            .notifier
            .notify(Notice::warning(SESSION_EXPIRED_MESSAGE));
        true
    }

    /// Whether a response means the server rejected the bearer token.
    #[must_use]
    pub fn is_auth_failure(status: u16, server_message: &str) -> bool {
        status == 401
            || (status == 403
                && server_message
                    .to_ascii_lowercase()
                    .contains(INVALID_TOKEN_MESSAGE_FRAGMENT))
    }

    /// Forced sign-out after the server rejected the token. Returns `true`
    /// when this call performed the sign-out; a second failure arriving for
    /// the same (already cleared) session is a no-op.
    pub fn on_auth_failure_response(&self, status: u16, server_message: &str) -> bool {
        if !Self::is_auth_failure(status, server_message) {
            return false;
        }

        let location = self.shell.navigator.current_location();
        let cleared = {
            let mut state = self.lock_state();
            if state.is_authenticated() {
                state.clear_credentials();
                state.redirect_target = Some(location.clone());
                true
            } else {
                false
            }
        };
        if !cleared {
            debug!(status, "auth failure for an already cleared session");
            return false;
        }

        warn!(status, redirect_target = %location, "server rejected session token");
        self.end_session(SessionEndReason::Rejected);
        self.shell.navigator.navigate(&self.sign_in_path);
        self.shell
            .notifier
            .notify(Notice::warning(SESSION_EXPIRED_MESSAGE));
        true
    }

    /// Transport hook run after every exchange. Returns whether the response
    /// was an authentication failure, regardless of which call signed out.
    pub fn token_has_expired(&self, response: &ApiResponse) -> bool {
        let auth_failure = Self::is_auth_failure(response.status, &response.body.message);
        if auth_failure {
            self.on_auth_failure_response(response.status, &response.body.message);
        }
        auth_failure
    }

    pub async fn login(&self, credentials: Credentials) -> Result<(), ClientError> {
        let user_name = credentials.user_name.trim();
        if user_name.is_empty() || credentials.password.is_empty() {
            return Err(ClientError::business(
                VALIDATION_STATUS,
                "user name and password are required",
            ));
        }

        let request = ApiRequest::post(
            self.routes.login.as_str(),
            json!({
                "userName": user_name,
                "password": credentials.password,
            }),
        );
        self.authenticate(request, credentials.stay_signed_in).await
    }

    pub async fn signup(&self, registration: Registration) -> Result<(), ClientError> {
        let user_name = registration.user_name.trim();
        let email = registration.email.trim().to_lowercase();
        if user_name.is_empty() || email.is_empty() || registration.password.is_empty() {
            return Err(ClientError::business(
                VALIDATION_STATUS,
                "user name, email and password are required",
            ));
        }

        let request = ApiRequest::post(
            self.routes.signup.as_str(),
            json!({
                "userName": user_name,
                "firstName": registration.first_name.trim(),
                "lastName": registration.last_name.trim(),
                "nickName": registration.nick_name.as_deref().map(str::trim),
                "email": email,
                "password": registration.password,
            }),
        );
        self.authenticate(request, registration.stay_signed_in).await
    }

    /// Unconditional sign-out; dependent stores are always reset.
    pub fn logout(&self) {
        let was_authenticated = {
            let mut state = self.lock_state();
            let was_authenticated = state.is_authenticated();
            *state = Session::default();
            was_authenticated
        };
        info!(was_authenticated, "session logged out");
        self.end_session(SessionEndReason::Logout);
    }

    /// Reloads a persisted "stay signed in" session. Returns whether a live
    /// session was restored.
    pub fn restore(&self) -> bool {
        let persisted = match self.store.load() {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return false,
            Err(error) => {
                warn!(%error, "failed to load persisted session");
                return false;
            }
        };

        if self.clock.now() > persisted.expires_at {
            debug!("discarding expired persisted session");
            self.clear_store();
            return false;
        }

        {
            let mut state = self.lock_state();
            state.token = Some(persisted.token);
            state.expires_at = Some(persisted.expires_at);
            state.stay_signed_in = true;
        }
        info!(expires_at = %persisted.expires_at, "session restored");
        self.notify_started();
        true
    }

    async fn authenticate(
        &self,
        request: ApiRequest,
        stay_signed_in: bool,
    ) -> Result<(), ClientError> {
        let result = self.transport.request(&request, None).await;
        let envelope = ApiOutcome::classify(result).into_result()?;
        let grant: TokenGrant = envelope.first_payload()?;
        self.establish(grant, stay_signed_in);
        Ok(())
    }

    fn establish(&self, grant: TokenGrant, stay_signed_in: bool) {
        let redirect_target = {
            let mut state = self.lock_state();
            state.token = Some(grant.token.clone());
            state.expires_at = Some(grant.token_expiration_date);
            state.stay_signed_in = stay_signed_in;
            state.redirect_target.take()
        };

        if stay_signed_in {
            let persisted = PersistedSession {
                token: grant.token,
                expires_at: grant.token_expiration_date,
            };
            if let Err(error) = self.store.persist(&persisted) {
                warn!(%error, "failed to persist session");
            }
        }

        info!(
            expires_at = %grant.token_expiration_date,
            stay_signed_in,
            "session established"
        );
        self.notify_started();

        if let Some(target) = redirect_target {
            info!(%target, "resuming navigation after sign-in");
            self.shell.navigator.redirect(&target);
        }
    }

    fn end_session(&self, reason: SessionEndReason) {
        self.clear_store();
        for listener in self.listeners_snapshot() {
            listener.session_ended(reason);
        }
        debug!(reason = reason.as_str(), "session listeners reset");
    }

    fn notify_started(&self) {
        for listener in self.listeners_snapshot() {
            listener.session_started();
        }
    }

    fn clear_store(&self) {
        if let Err(error) = self.store.clear() {
            warn!(%error, "failed to clear persisted session");
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Session> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
