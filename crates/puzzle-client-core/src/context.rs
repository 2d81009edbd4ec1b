use std::sync::Arc;

use tracing::info;

use crate::api::{ApiClient, ApiRequest, ApiTransport};
use crate::cancel::CancellableRequestRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::jobs::{AsyncJobPoller, JobHandle};
use crate::reference_cache::{ApiReferenceLoader, ReferenceBundle, ReferenceDataCache};
use crate::session::{SessionManager, SessionStore, ShellHandles};

/// One instance of every orchestration component, wired together at
/// start-up and passed to whatever needs them.
pub struct ClientContext {
    config: ClientConfig,
    session: Arc<SessionManager>,
    registry: Arc<CancellableRequestRegistry>,
    api: Arc<ApiClient>,
    jobs: AsyncJobPoller,
    reference_data: Arc<ReferenceDataCache>,
}

pub struct ClientContextBuilder {
    config: ClientConfig,
    transport: Arc<dyn ApiTransport>,
    shell: ShellHandles,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SessionStore>>,
}

impl ClientContextBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn build(self) -> ClientContext {
        let mut session = SessionManager::new(
            &self.config,
            Arc::clone(&self.transport),
            self.shell,
            Arc::clone(&self.clock),
        );
        if let Some(store) = self.store {
            session = session.with_store(store);
        }
        let session = Arc::new(session);
        let registry = Arc::new(CancellableRequestRegistry::new());
        let api = Arc::new(ApiClient::new(self.transport, Arc::clone(&session)));
        let jobs = AsyncJobPoller::new(
            Arc::clone(&api),
            Arc::clone(&registry),
            self.config.routes.clone(),
            Arc::clone(&self.clock),
        );
        let reference_data = Arc::new(ReferenceDataCache::new(
            Arc::new(ApiReferenceLoader::new(
                Arc::clone(&api),
                self.config.routes.clone(),
            )),
            self.config.reference_cache_ttl,
            self.clock,
        ));

        info!(api_base_url = %self.config.api_base_url, "client context ready");
        ClientContext {
            config: self.config,
            session,
            registry,
            api,
            jobs,
            reference_data,
        }
    }
}

impl ClientContext {
    pub fn builder(
        config: ClientConfig,
        transport: Arc<dyn ApiTransport>,
        shell: ShellHandles,
    ) -> ClientContextBuilder {
        ClientContextBuilder {
            config,
            transport,
            shell,
            clock: Arc::new(SystemClock),
            store: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CancellableRequestRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    #[must_use]
    pub fn jobs(&self) -> &AsyncJobPoller {
        &self.jobs
    }

    #[must_use]
    pub fn reference_data(&self) -> &Arc<ReferenceDataCache> {
        &self.reference_data
    }

    /// Starts a job with the configured poll interval and max wait.
    pub fn start_job(&self, request: ApiRequest) -> JobHandle {
        self.jobs.start(
            request,
            self.config.job_max_wait,
            self.config.job_poll_interval,
        )
    }

    /// Restores a persisted session and loads reference data.
    pub async fn bootstrap(&self) -> Result<Arc<ReferenceBundle>, ClientError> {
        let restored = self.session.restore();
        info!(restored, "bootstrapping client");
        self.reference_data.get().await
    }

    /// Cancels the registered operation, then signs out.
    pub fn logout(&self) {
        if self.registry.cancel_current() {
            info!("running operation cancelled by logout");
        }
        self.session.logout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiResponse;
    use crate::cancel::SyntheticEvent;
    use crate::clock::ManualClock;
    use crate::jobs::{JobOutcome, JobStatus};
    use crate::session::{MemorySessionStore, PersistedSession};
    use crate::shell::HeadlessShell;
    use crate::test_support::ScriptedTransport;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    fn context(
        transport: Arc<ScriptedTransport>,
        store: Arc<MemorySessionStore>,
    ) -> (ClientContext, Arc<ManualClock>) {
        let mut config = ClientConfig::new("https://api.example.com").unwrap();
        config.job_poll_interval = Duration::from_millis(250);
        let shell = Arc::new(HeadlessShell::at("/"));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap(),
        ));
        let context = ClientContext::builder(
            config,
            transport,
            ShellHandles {
                navigator: shell.clone(),
                notifier: shell,
            },
        )
        .clock(clock.clone())
        .session_store(store)
        .build();
        (context, clock)
    }

    #[tokio::test]
    async fn bootstrap_restores_session_and_loads_reference_data() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemorySessionStore::default());
        store
            .persist(&PersistedSession {
                token: "kept".to_string(),
                expires_at: Utc.with_ymd_and_hms(2026, 5, 11, 9, 0, 0).unwrap(),
            })
            .unwrap();
        transport.respond(
            "/api/v1/values",
            Ok(ApiResponse::ok(vec![json!({"difficulties": []})])),
        );
        transport.respond(
            "/api/v1/values/missionstatement",
            Ok(ApiResponse::ok(vec![json!("Solve together.")])),
        );
        let (context, _clock) = context(transport.clone(), store);

        let bundle = context.bootstrap().await.unwrap();

        assert!(context.session().is_authenticated());
        assert_eq!(bundle.mission_statement, "Solve together.");
        context.reference_data().get().await.unwrap();
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_registry_and_session() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemorySessionStore::default());
        let (context, _clock) = context(transport, store.clone());
        context.registry().register(|| {}, None);

        context.logout();

        assert!(!context.registry().is_armed());
        assert!(!context.session().is_authenticated());
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(
            context.registry().invoke(&mut SyntheticEvent::default()),
            crate::cancel::CancelInvocation::Empty
        );
    }

    #[tokio::test(start_paused = true)]
    async fn logout_cancels_a_polling_job() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemorySessionStore::default());
        store
            .persist(&PersistedSession {
                token: "kept".to_string(),
                expires_at: Utc.with_ymd_and_hms(2026, 5, 11, 9, 0, 0).unwrap(),
            })
            .unwrap();
        transport.respond(
            "/api/v1/puzzles/solve",
            Ok(ApiResponse::ok(vec![json!("job-7")])),
        );
        transport.respond_always(
            "/api/v1/jobs/job-7/status",
            Ok(ApiResponse::ok(vec![json!("running")])),
        );
        let (context, _clock) = context(transport.clone(), store);
        assert!(context.session().restore());

        let request = ApiRequest::post("/api/v1/puzzles/solve", json!({})).authenticated();
        let handle = context.start_job(request);
        let mut status_rx = handle.subscribe();
        status_rx
            .wait_for(|status| *status == JobStatus::Polling)
            .await
            .unwrap();

        context.logout();

        assert_eq!(handle.wait().await, JobOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.calls_to("/api/v1/jobs/job-7/status"), 0);
        assert!(!context.registry().is_armed());
        assert!(!context.session().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn start_job_uses_configured_intervals() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemorySessionStore::default());
        transport.respond(
            "/api/v1/puzzles/solve",
            Ok(ApiResponse::ok(vec![json!("job-7")])),
        );
        transport.respond(
            "/api/v1/jobs/job-7/status",
            Ok(ApiResponse::ok(vec![json!("completed")])),
        );
        transport.respond(
            "/api/v1/jobs/job-7",
            Ok(ApiResponse::ok(vec![json!({"solved": true})])),
        );
        let (context, _clock) = context(transport.clone(), store);

        let started = tokio::time::Instant::now();
        let outcome = context
            .start_job(ApiRequest::post("/api/v1/puzzles/solve", json!({})))
            .wait()
            .await;

        assert_eq!(outcome.into_result().unwrap(), vec![json!({"solved": true})]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(500));
    }
}
