//! TTL-gated cache for low-churn reference data.
//!
//! Refreshes are single-flight: while a fetch for a key is outstanding every
//! other `get` for that key awaits the same shared future instead of issuing
//! its own request. A failed refresh never replaces a good entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiRequest};
use crate::clock::Clock;
use crate::config::ApiRoutes;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheTtl {
    /// Valid until the next midnight UTC.
    #[default]
    NextDay,
    Fixed(chrono::Duration),
}

impl CacheTtl {
    #[must_use]
    pub fn expires_at(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::NextDay => now
                .date_naive()
                .succ_opt()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .map_or_else(|| now + chrono::Duration::days(1), |midnight| midnight.and_utc()),
            Self::Fixed(ttl) => now + ttl,
        }
    }
}

#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: Arc<V>,
    pub expires_at: DateTime<Utc>,
    pub stale: bool,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            expires_at: self.expires_at,
            stale: self.stale,
        }
    }
}

impl<V> CacheEntry<V> {
    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        !self.stale && now < self.expires_at
    }
}

/// Where a [`TtlCache`] gets values from on a miss.
#[async_trait]
pub trait RefreshSource<K, V>: Send + Sync {
    async fn fetch(&self, key: &K) -> Result<V, ClientError>;
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Arc<V>, ClientError>>>;

struct Flight<V> {
    id: u64,
    fetch: SharedFetch<V>,
    generation: u64,
}

struct Slot<V> {
    entry: Option<CacheEntry<V>>,
    flight: Option<Flight<V>>,
    /// Bumped by every invalidation; a refresh that started under an older
    /// generation stores its value as stale.
    generation: u64,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            entry: None,
            flight: None,
            generation: 0,
        }
    }
}

pub struct TtlCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    source: Arc<dyn RefreshSource<K, V>>,
    ttl: CacheTtl,
    clock: Arc<dyn Clock>,
    next_flight: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(source: Arc<dyn RefreshSource<K, V>>, ttl: CacheTtl, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            source,
            ttl,
            clock,
            next_flight: AtomicU64::new(0),
        }
    }

    /// Returns the cached value, refreshing it first when absent, expired or
    /// invalidated.
    pub async fn get(&self, key: &K) -> Result<Arc<V>, ClientError> {
        let (flight_id, fetch, generation) = {
            let mut slots = self.lock_slots();
            let slot = slots.entry(key.clone()).or_default();
            if let Some(entry) = &slot.entry
                && entry.is_fresh_at(self.clock.now())
            {
                debug!(?key, "reference cache hit");
                return Ok(Arc::clone(&entry.value));
            }
            match &slot.flight {
                Some(flight) if flight.generation == slot.generation => {
                    debug!(?key, flight = flight.id, "joining in-flight refresh");
                    (flight.id, flight.fetch.clone(), flight.generation)
                }
                superseded => {
                    if let Some(flight) = superseded {
                        debug!(?key, flight = flight.id, "in-flight refresh predates invalidation");
                    }
                    let flight = self.begin_flight(key, slot.generation);
                    let joined = (flight.id, flight.fetch.clone(), flight.generation);
                    slot.flight = Some(flight);
                    joined
                }
            }
        };

        let result = fetch.await;
        self.complete_flight(key, flight_id, generation, &result);
        result
    }

    /// Forces the next `get` for `key` to refresh. The current value stays
    /// readable through [`TtlCache::peek`].
    pub fn invalidate(&self, key: &K) {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(key) {
            slot.generation += 1;
            if let Some(entry) = slot.entry.as_mut() {
                entry.stale = true;
            }
            debug!(?key, "reference cache entry invalidated");
        }
    }

    /// Last good value, fresh or not, without fetching.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.lock_slots()
            .get(key)
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| Arc::clone(&entry.value))
    }

    #[must_use]
    pub fn expires_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.lock_slots()
            .get(key)
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| entry.expires_at)
    }

    /// Seeds an entry, e.g. from data shipped with the application.
    pub fn prime(&self, key: K, value: V, expires_at: DateTime<Utc>) -> Arc<V> {
        let value = Arc::new(value);
        self.lock_slots().entry(key).or_default().entry = Some(CacheEntry {
            value: Arc::clone(&value),
            expires_at,
            stale: false,
        });
        value
    }

    fn begin_flight(&self, key: &K, generation: u64) -> Flight<V> {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let source = Arc::clone(&self.source);
        let owned_key = key.clone();
        info!(?key, flight = id, "refreshing reference data");
        let fetch = async move { source.fetch(&owned_key).await.map(Arc::new) }
            .boxed()
            .shared();
        Flight {
            id,
            fetch,
            generation,
        }
    }

    /// Only the first waiter to get here for a given flight writes the entry.
    fn complete_flight(
        &self,
        key: &K,
        flight_id: u64,
        generation: u64,
        result: &Result<Arc<V>, ClientError>,
    ) {
        let now = self.clock.now();
        let mut slots = self.lock_slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if slot.flight.as_ref().is_none_or(|flight| flight.id != flight_id) {
            return;
        }
        slot.flight = None;

        match result {
            Ok(value) => {
                let stale = slot.generation != generation;
                let expires_at = self.ttl.expires_at(now);
                slot.entry = Some(CacheEntry {
                    value: Arc::clone(value),
                    expires_at,
                    stale,
                });
                info!(?key, %expires_at, stale, "reference data refreshed");
            }
            Err(error) => {
                warn!(
                    ?key,
                    %error,
                    kept_previous = slot.entry.is_some(),
                    "reference data refresh failed"
                );
            }
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Difficulty {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub difficulty_level: i64,
}

/// Label/value pair used by the drop-downs (sort order, time frames, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceValue {
    pub label: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryApp {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceBundle {
    #[serde(default)]
    pub difficulties: Vec<Difficulty>,
    #[serde(default)]
    pub release_environments: Vec<ReferenceValue>,
    #[serde(default)]
    pub sort_values: Vec<ReferenceValue>,
    #[serde(default)]
    pub time_frames: Vec<ReferenceValue>,
    #[serde(default)]
    pub gallery_apps: Vec<GalleryApp>,
    #[serde(default)]
    pub mission_statement: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKey {
    Values,
}

/// Loads the bundle from the aggregate values endpoint and the mission
/// statement endpoint.
pub struct ApiReferenceLoader {
    api: Arc<ApiClient>,
    routes: ApiRoutes,
}

impl ApiReferenceLoader {
    pub fn new(api: Arc<ApiClient>, routes: ApiRoutes) -> Self {
        Self { api, routes }
    }
}

#[async_trait]
impl RefreshSource<ReferenceKey, ReferenceBundle> for ApiReferenceLoader {
    async fn fetch(&self, key: &ReferenceKey) -> Result<ReferenceBundle, ClientError> {
        match key {
            ReferenceKey::Values => {
                let (values, mission) = futures::try_join!(
                    self.api.send(ApiRequest::get(self.routes.values.as_str())),
                    self.api
                        .send(ApiRequest::get(self.routes.mission_statement.as_str())),
                )?;
                let mut bundle = values.first_payload::<ReferenceBundle>()?;
                bundle.mission_statement = mission.first_payload::<String>()?;
                Ok(bundle)
            }
        }
    }
}

/// Application-wide reference data (difficulties, drop-down values, gallery
/// listing, mission statement).
pub struct ReferenceDataCache {
    inner: TtlCache<ReferenceKey, ReferenceBundle>,
}

impl ReferenceDataCache {
    pub fn new(
        source: Arc<dyn RefreshSource<ReferenceKey, ReferenceBundle>>,
        ttl: CacheTtl,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: TtlCache::new(source, ttl, clock),
        }
    }

    pub async fn get(&self) -> Result<Arc<ReferenceBundle>, ClientError> {
        self.inner.get(&ReferenceKey::Values).await
    }

    pub fn invalidate(&self) {
        self.inner.invalidate(&ReferenceKey::Values);
    }

    #[must_use]
    pub fn peek(&self) -> Option<Arc<ReferenceBundle>> {
        self.inner.peek(&ReferenceKey::Values)
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.expires_at(&ReferenceKey::Values)
    }

    pub fn prime(
        &self,
        bundle: ReferenceBundle,
        expires_at: DateTime<Utc>,
    ) -> Arc<ReferenceBundle> {
        self.inner.prime(ReferenceKey::Values, bundle, expires_at)
    }
}
