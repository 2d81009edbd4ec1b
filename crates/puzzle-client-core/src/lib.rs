//! Client-side orchestration core for the puzzle web client.
//!
//! Four components sit between the UI and the HTTP transport:
//! - `SessionManager`: token lifecycle, forced sign-out and post-login redirect
//! - `CancellableRequestRegistry`: the single slot behind the stop control
//! - `AsyncJobPoller`: submit → poll → terminal tracking for server jobs
//! - `ReferenceDataCache`: TTL-gated, single-flight reference data
//!
//! The transport itself is a trait (`ApiTransport`); `puzzle-api-client`
//! provides the reqwest implementation.

pub mod api;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod reference_cache;
pub mod session;
pub mod shell;

#[cfg(test)]
mod test_support;

pub use api::{
    ApiClient, ApiEnvelope, ApiOutcome, ApiRequest, ApiResponse, ApiTransport, AuthRequirement,
    HttpMethod, TransportError,
};
pub use cancel::{CancelInvocation, CancellableRequestRegistry, HandleId, SyntheticEvent, UiEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApiRoutes, ClientConfig, ConfigError};
pub use context::{ClientContext, ClientContextBuilder};
pub use error::{ClientError, ErrorKind};
pub use jobs::{AsyncJobPoller, Job, JobHandle, JobOutcome, JobStatus, RemoteJobStatus};
pub use reference_cache::{
    ApiReferenceLoader, CacheTtl, ReferenceBundle, ReferenceDataCache, RefreshSource, TtlCache,
};
pub use session::{
    Credentials, MemorySessionStore, PersistedSession, Registration, Session, SessionManager,
    SessionStore, ShellHandles,
};
pub use shell::{
    HeadlessShell, Navigator, Notice, NoticeLevel, Notifier, SessionEndReason, SessionListener,
};
