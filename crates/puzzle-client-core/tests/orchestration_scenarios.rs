use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use puzzle_client_core::{
    ApiRequest, ApiResponse, ApiTransport, CancelInvocation, ClientConfig, ClientContext,
    ClientError, Credentials, HeadlessShell, JobOutcome, JobStatus, ManualClock, NoticeLevel,
    SessionEndReason, SessionListener, ShellHandles, SyntheticEvent, TransportError,
};
use serde_json::json;

/// Minimal in-process API: one reply queue per path, optionally sticky.
#[derive(Default)]
struct FakeApi {
    replies: Mutex<HashMap<String, VecDeque<ApiResponse>>>,
    sticky: Mutex<HashMap<String, ApiResponse>>,
    failing: Mutex<HashMap<String, String>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl FakeApi {
    fn reply(&self, path: &str, response: ApiResponse) {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    fn reply_always(&self, path: &str, response: ApiResponse) {
        self.sticky.lock().unwrap().insert(path.to_string(), response);
    }

    fn fail(&self, path: &str, message: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(path.to_string(), message.to_string());
    }

    fn heal(&self, path: &str) {
        self.failing.lock().unwrap().remove(path);
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ApiTransport for FakeApi {
    async fn request(
        &self,
        request: &ApiRequest,
        _bearer_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        *self
            .hits
            .lock()
            .unwrap()
            .entry(request.path.clone())
            .or_default() += 1;
        tokio::task::yield_now().await;

        if let Some(message) = self.failing.lock().unwrap().get(&request.path) {
            return Err(TransportError::Request {
                message: message.clone(),
            });
        }
        let queued = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        queued
            .or_else(|| self.sticky.lock().unwrap().get(&request.path).cloned())
            .ok_or_else(|| TransportError::Request {
                message: format!("unexpected request to {}", request.path),
            })
    }
}

#[derive(Default)]
struct RecordingListener {
    started: AtomicUsize,
    ended: Mutex<Vec<SessionEndReason>>,
}

impl SessionListener for RecordingListener {
    fn session_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn session_ended(&self, reason: SessionEndReason) {
        self.ended.lock().unwrap().push(reason);
    }
}

struct Harness {
    context: ClientContext,
    api: Arc<FakeApi>,
    shell: Arc<HeadlessShell>,
    clock: Arc<ManualClock>,
    listener: Arc<RecordingListener>,
}

const LOGIN: &str = "/api/v1/login";
const VALUES: &str = "/api/v1/values";
const MISSION: &str = "/api/v1/values/missionstatement";
const GENERATE: &str = "/api/v1/puzzles/generate";
const JOB_STATUS: &str = "/api/v1/jobs/gen-1/status";
const JOB_RESULT: &str = "/api/v1/jobs/gen-1";

fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 8, 30, 0).unwrap()
}

fn harness() -> Result<Harness> {
    let mut config = ClientConfig::new("https://puzzles.example.com")?;
    config.job_poll_interval = Duration::from_millis(1_000);
    config.job_max_wait = Duration::from_millis(5_000);

    let api = Arc::new(FakeApi::default());
    let shell = Arc::new(HeadlessShell::at("/play/42"));
    let clock = Arc::new(ManualClock::new(morning()));
    let context = ClientContext::builder(
        config,
        api.clone(),
        ShellHandles {
            navigator: shell.clone(),
            notifier: shell.clone(),
        },
    )
    .clock(clock.clone())
    .build();
    let listener = Arc::new(RecordingListener::default());
    context.session().add_listener(listener.clone());

    Ok(Harness {
        context,
        api,
        shell,
        clock,
        listener,
    })
}

async fn sign_in(harness: &Harness, expires_at: DateTime<Utc>) -> Result<()> {
    harness.api.reply(
        LOGIN,
        ApiResponse::ok(vec![json!({
            "token": "bearer-1",
            "tokenExpirationDate": expires_at.to_rfc3339(),
        })]),
    );
    harness
        .context
        .session()
        .login(Credentials {
            user_name: "solver".to_string(),
            password: "hunter2".to_string(),
            stay_signed_in: false,
        })
        .await
        .context("login")
}

fn values_payload() -> ApiResponse {
    ApiResponse::ok(vec![json!({
        "difficulties": [
            {"id": 1, "name": "easy", "displayName": "Easy", "difficultyLevel": 1},
            {"id": 4, "name": "hard", "displayName": "Hard", "difficultyLevel": 4}
        ],
        "releaseEnvironments": [{"label": "Production", "value": 1}],
        "timeFrames": [{"label": "Days", "value": 1}]
    })])
}

#[tokio::test]
async fn expired_token_is_detected_once_and_remembers_location() -> Result<()> {
    let harness = harness()?;
    sign_in(&harness, morning() - chrono::Duration::days(1)).await?;
    let session = harness.context.session();
    assert!(session.is_authenticated());

    assert!(session.check_and_invalidate_if_expired());
    assert!(!session.is_authenticated());
    assert_eq!(session.redirect_target().as_deref(), Some("/play/42"));
    assert_eq!(harness.shell.navigations(), vec!["/login".to_string()]);

    harness.shell.set_location("/somewhere-else");
    assert!(!session.check_and_invalidate_if_expired());
    assert_eq!(session.redirect_target().as_deref(), Some("/play/42"));
    assert_eq!(
        *harness.listener.ended.lock().unwrap(),
        vec![SessionEndReason::Expired]
    );
    Ok(())
}

#[tokio::test]
async fn repeated_auth_failures_sign_out_once() -> Result<()> {
    let harness = harness()?;
    sign_in(&harness, morning() + chrono::Duration::hours(8)).await?;
    let session = harness.context.session();

    assert!(session.on_auth_failure_response(401, "Unauthorized"));
    assert!(!session.on_auth_failure_response(401, "Unauthorized"));

    assert_eq!(harness.shell.navigations(), vec!["/login".to_string()]);
    let notices = harness.shell.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Warning);
    assert_eq!(harness.listener.ended.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn sign_in_after_forced_logout_resumes_captured_location() -> Result<()> {
    let harness = harness()?;
    sign_in(&harness, morning() + chrono::Duration::hours(8)).await?;
    harness.api.reply(VALUES, ApiResponse::declined(401, "Unauthorized"));
    harness.api.reply(MISSION, ApiResponse::ok(vec![json!("Solve together.")]));

    let error = harness.context.reference_data().get().await.unwrap_err();
    assert_eq!(error, ClientError::AuthenticationExpired);
    assert!(!harness.context.session().is_authenticated());

    harness.shell.set_location("/login");
    sign_in(&harness, morning() + chrono::Duration::hours(8)).await?;
    assert_eq!(harness.shell.redirects(), vec!["/play/42".to_string()]);
    assert_eq!(harness.context.session().redirect_target(), None);
    assert_eq!(harness.listener.started.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn job_that_never_finishes_times_out_after_five_polls() -> Result<()> {
    let harness = harness()?;
    sign_in(&harness, morning() + chrono::Duration::hours(8)).await?;
    harness.api.reply(GENERATE, ApiResponse::ok(vec![json!("gen-1")]));
    harness
        .api
        .reply_always(JOB_STATUS, ApiResponse::ok(vec![json!({"status": "running"})]));

    let job = harness
        .context
        .start_job(ApiRequest::post(GENERATE, json!({"difficultyLevel": 4})).authenticated());
    let mut status_rx = job.subscribe();
    status_rx
        .wait_for(|status| *status == JobStatus::Polling)
        .await?;
    assert_eq!(job.id().as_deref(), Some("gen-1"));

    let outcome = job.wait().await;
    assert_eq!(outcome, JobOutcome::TimedOut);
    assert_eq!(harness.api.hits(JOB_STATUS), 5);
    assert_eq!(harness.api.hits(JOB_RESULT), 0);
    assert_eq!(
        outcome.user_message(),
        Some(ClientError::Timeout.user_message())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_control_honours_arm_delay_then_cancels_job() -> Result<()> {
    let harness = harness()?;
    sign_in(&harness, morning() + chrono::Duration::hours(8)).await?;
    harness.api.reply(GENERATE, ApiResponse::ok(vec![json!("gen-1")]));
    harness
        .api
        .reply_always(JOB_STATUS, ApiResponse::ok(vec![json!("running")]));

    let job = harness
        .context
        .start_job(ApiRequest::post(GENERATE, json!({})).authenticated());
    let mut status_rx = job.subscribe();
    status_rx
        .wait_for(|status| *status == JobStatus::Polling)
        .await?;
    let registry = harness.context.registry();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut early_click = SyntheticEvent::default();
    assert!(matches!(
        registry.invoke(&mut early_click),
        CancelInvocation::NotYetArmed { .. }
    ));
    assert!(early_click.default_prevented);
    assert_eq!(job.status(), JobStatus::Polling);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(
        registry.invoke(&mut SyntheticEvent::default()),
        CancelInvocation::Cancelled
    );
    let polls_at_cancel = harness.api.hits(JOB_STATUS);

    assert_eq!(job.wait().await, JobOutcome::Cancelled);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.api.hits(JOB_STATUS), polls_at_cancel);
    Ok(())
}

#[tokio::test]
async fn fresh_reference_data_needs_no_network() -> Result<()> {
    let harness = harness()?;
    let cache = harness.context.reference_data();
    cache.prime(
        puzzle_client_core::ReferenceBundle {
            mission_statement: "cached".to_string(),
            ..Default::default()
        },
        morning() + chrono::Duration::days(1),
    );

    let first = cache.get().await?;
    let second = cache.get().await?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(harness.api.total_hits(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_reference_refresh_keeps_previous_bundle() -> Result<()> {
    let harness = harness()?;
    let cache = harness.context.reference_data();
    cache.prime(
        puzzle_client_core::ReferenceBundle {
            mission_statement: "yesterday".to_string(),
            ..Default::default()
        },
        morning() - chrono::Duration::days(1),
    );
    harness.api.fail(VALUES, "connection refused");
    harness.api.reply_always(MISSION, ApiResponse::ok(vec![json!("today")]));

    let error = cache.get().await.unwrap_err();
    assert_eq!(
        error,
        ClientError::InfrastructureFailure {
            message: "connection refused".to_string()
        }
    );
    assert_eq!(error.user_message(), "connection refused");
    assert_eq!(cache.peek().context("previous bundle")?.mission_statement, "yesterday");

    harness.api.heal(VALUES);
    harness.api.reply(VALUES, values_payload());
    let refreshed = cache.get().await?;
    assert_eq!(refreshed.mission_statement, "today");
    assert_eq!(refreshed.difficulties.len(), 2);
    Ok(())
}

#[tokio::test]
async fn concurrent_reference_reads_share_one_fetch() -> Result<()> {
    let harness = harness()?;
    harness.api.reply(VALUES, values_payload());
    harness.api.reply(MISSION, ApiResponse::ok(vec![json!("Solve together.")]));
    let cache = harness.context.reference_data();

    let (first, second) = tokio::join!(cache.get(), cache.get());
    let (first, second) = (first?, second?);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(harness.api.hits(VALUES), 1);
    assert_eq!(harness.api.hits(MISSION), 1);

    harness.clock.advance(chrono::Duration::days(1));
    harness.api.reply(VALUES, values_payload());
    harness.api.reply(MISSION, ApiResponse::ok(vec![json!("New day.")]));
    assert_eq!(cache.get().await?.mission_statement, "New day.");
    assert_eq!(harness.api.hits(VALUES), 2);
    Ok(())
}

#[tokio::test]
async fn logout_resets_registry_session_and_listeners() -> Result<()> {
    let harness = harness()?;
    sign_in(&harness, morning() + chrono::Duration::hours(8)).await?;
    harness.context.registry().register(|| {}, None);

    harness.context.logout();

    assert!(!harness.context.registry().is_armed());
    assert!(!harness.context.session().is_authenticated());
    assert_eq!(
        *harness.listener.ended.lock().unwrap(),
        vec![SessionEndReason::Logout]
    );
    Ok(())
}
