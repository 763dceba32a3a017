//! Application Context
//!
//! Builds every application store from the primitives and owns them. There
//! are no process-wide stores: two contexts share nothing, and dropping a
//! context drops its stores.
//!
//! # Store Graph
//!
//! ```text
//! status (interval) ──► is_connected, is_ready, is_updatable
//!                            │
//!                            ▼
//!                     floors (dependent) ──► loading_progress ──► is_loaded
//!                            │
//! location ──► current_floor ──► current_rooms      rooms (cache)
//!          ├─► current_room  ──► current_items      items (cache)
//!          └─► current_item
//! floor_topics + floors ──► major_collections
//! local_preferences ──► consent, age_band ──► tracking_allowed
//! picks ──► item_of_the_day, random_items (stored in items)
//! ```
//!
//! Background work only runs while something observes the store that needs
//! it; `status` polls only while observed, and `floors` only fetches while
//! observed.

use std::sync::Arc;

use serde_json::Value;
use futures_util::future::try_join_all;
use tracing::{debug, info, trace, warn};

use crate::api::{
    parse_entities, parse_entity, parse_records, Endpoint, EndpointLoader, HttpTransport, Query,
    Transport, CONFIG_PATH, FLOORS_PATH, FLOOR_TOPICS_PATH, ITEM_OF_THE_DAY, PICKS_PATH,
    RANDOM_ITEMS, STATUS_PATH,
};
use crate::config::StoreConfig;
use crate::entity::{Entity, EntityId};
use crate::error::Result;
use crate::museum::{
    floor_at, major_collections, related_ids, resolve_ids, tracking_allowed, ApiStatus, Location,
    MajorCollection,
};
use crate::reactive::{map, Derived, Signal};
use crate::store::{
    BusyCounter, CacheStore, Computation, DependentStore, FileStorage, IntervalStore,
    KeyValueStorage, MemoryStorage, Preferences,
};

/// Floors as fetched: `None` until loaded or when the backend is unavailable.
pub type Floors = Option<Vec<Arc<Entity>>>;

/// Owner of every application store.
pub struct AppContext {
    config: StoreConfig,
    transport: Arc<dyn Transport>,
    busy: BusyCounter,

    status: IntervalStore<Option<ApiStatus>>,
    is_connected: Derived<bool>,
    is_ready: Derived<bool>,
    is_updatable: Derived<bool>,

    floors: DependentStore<Floors, bool>,
    floor_topics: Signal<Vec<Arc<Entity>>>,
    site_config: Signal<Option<Arc<Entity>>>,
    major_collections: Derived<Vec<MajorCollection>>,
    loading_progress: Derived<u8>,
    is_loaded: Derived<bool>,

    rooms: CacheStore<Entity>,
    items: CacheStore<Entity>,
    topics: CacheStore<Entity>,

    item_of_the_day: Signal<Option<Arc<Entity>>>,
    random_items: Signal<Vec<Arc<Entity>>>,

    location: Signal<Location>,
    current_floor: Derived<Option<Arc<Entity>>>,
    current_room: Derived<Option<Arc<Entity>>>,
    current_item: Derived<Option<Arc<Entity>>>,
    current_rooms: Derived<Vec<Arc<Entity>>>,
    current_items: Derived<Vec<Arc<Entity>>>,

    local_preferences: Preferences,
    session_preferences: Preferences,
    consent: Derived<bool>,
    age_band: Derived<String>,
    tracking_allowed: Derived<bool>,
}

impl AppContext {
    /// Build every store on top of `transport`, with local preferences kept
    /// in `local_storage`. Session preferences always live in memory.
    pub fn new(
        config: StoreConfig,
        transport: Arc<dyn Transport>,
        local_storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Self> {
        config.validate()?;
        let busy = BusyCounter::new();

        let status = status_store(&config, &transport, &busy);
        let is_connected = map(status.clone(), |status| status.is_some());
        let is_ready = map(status.clone(), |status| {
            status.as_ref().is_some_and(|status| status.ready)
        });
        let frontend_version = config.frontend_version.clone();
        let is_updatable = map(status.clone(), move |status| {
            status
                .as_ref()
                .is_some_and(|status| status.differs_from(&frontend_version))
        });

        let floors = floors_store(&transport, &busy, is_ready.clone());
        let floor_topics: Signal<Vec<Arc<Entity>>> = Signal::new(Vec::new());
        let site_config: Signal<Option<Arc<Entity>>> = Signal::new(None);
        let major = Derived::new((floor_topics.clone(), floors.clone()), |(topics, floors)| {
            major_collections(topics, floors.as_deref().unwrap_or_default())
        });
        let loading_progress = map(floors.clone(), |floors| {
            if floors.is_some() {
                100u8
            } else {
                0
            }
        });
        let is_loaded = map(loading_progress.clone(), |progress| *progress == 100);

        let window = config.batch_window();
        let cache = |name: &'static str, endpoint: Endpoint| -> CacheStore<Entity> {
            CacheStore::new(
                name,
                EndpointLoader::new(Arc::clone(&transport), endpoint),
                window,
                Some(busy.clone()),
            )
        };
        let rooms = cache("rooms", Endpoint::ROOMS);
        let items = cache("items", Endpoint::ITEMS);
        let topics = cache("topics", Endpoint::TOPICS);
        let item_of_the_day: Signal<Option<Arc<Entity>>> = Signal::new(None);
        let random_items: Signal<Vec<Arc<Entity>>> = Signal::new(Vec::new());

        let location = Signal::new(Location::default());
        let current_floor = Derived::new((floors.clone(), location.clone()), |(floors, location)| {
            floor_at(floors.as_deref(), location)
        });
        let current_room = current_entity(&rooms, &location, "rid");
        let current_item = current_entity(&items, &location, "iid");
        let current_rooms = contained_entities(&rooms, &current_floor, "rooms");
        let current_items = contained_entities(&items, &current_room, "items");

        let local_preferences = Preferences::open(local_storage)?;
        let session_preferences = Preferences::open(Arc::new(MemoryStorage::new()))?;
        let consent = map(local_preferences.clone(), |prefs| {
            prefs.pointer("/tracking/consent") == Some(&Value::Bool(true))
        });
        let age_band = map(local_preferences.clone(), |prefs| {
            prefs
                .pointer("/tracking/ageBand")
                .and_then(Value::as_str)
                .filter(|band| !band.is_empty())
                .unwrap_or("0")
                .to_string()
        });
        let tracking = Derived::new((consent.clone(), age_band.clone()), |(consent, age_band)| {
            tracking_allowed(*consent, age_band)
        });

        info!(base_url = %config.api_base_url, "application stores created");

        Ok(Self {
            config,
            transport,
            busy,
            status,
            is_connected,
            is_ready,
            is_updatable,
            floors,
            floor_topics,
            site_config,
            major_collections: major,
            loading_progress,
            is_loaded,
            rooms,
            items,
            topics,
            item_of_the_day,
            random_items,
            location,
            current_floor,
            current_room,
            current_item,
            current_rooms,
            current_items,
            local_preferences,
            session_preferences,
            consent,
            age_band,
            tracking_allowed: tracking,
        })
    }

    /// Talk HTTP to the configured backend and keep local preferences in the
    /// configured file, or in memory without one.
    pub fn from_config(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config)?);
        let storage: Arc<dyn KeyValueStorage> = match &config.preferences_path {
            Some(path) => Arc::new(FileStorage::new(path)),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::new(config, transport, storage)
    }

    /// Publish a new location from the router.
    pub fn navigate(&self, location: Location) {
        debug!(path = %location.path, "navigate");
        self.location.set(location);
    }

    /// Load every floor topic into [`floor_topics`](Self::floor_topics).
    /// On failure the previous topics stay in place.
    pub async fn fetch_floor_topics(&self) -> Result<()> {
        let document = self.get_json(FLOOR_TOPICS_PATH, Vec::new()).await?;
        let topics = parse_entities(document)?.into_iter().map(Arc::new).collect();
        self.floor_topics.set(topics);
        Ok(())
    }

    /// Load the frontend configuration object.
    pub async fn fetch_config(&self) -> Result<()> {
        let document = self.get_json(CONFIG_PATH, Vec::new()).await?;
        self.site_config.set(Some(Arc::new(parse_entity(document)?)));
        Ok(())
    }

    /// Load the pick list `name` from `/api/picks/<name>`. The picked items
    /// are stored in the items cache.
    pub async fn fetch_picks(&self, name: &str) -> Result<Vec<Arc<Entity>>> {
        let document = self.get_json(&format!("{PICKS_PATH}{name}"), Vec::new()).await?;
        let picks = self.items.insert(parse_records(document)?);
        debug!(name, count = picks.len(), "picks loaded");
        Ok(picks)
    }

    /// Load the item of the day. The store only changes when the item does.
    pub async fn fetch_item_of_the_day(&self) -> Result<()> {
        let Some(item) = self.fetch_picks(ITEM_OF_THE_DAY).await?.into_iter().next() else {
            return Ok(());
        };
        let unchanged = self
            .item_of_the_day
            .get_untracked()
            .is_some_and(|current| current.id == item.id);
        if !unchanged {
            self.item_of_the_day.set(Some(item));
        }
        Ok(())
    }

    /// Load a new random selection of items.
    pub async fn fetch_random_items(&self) -> Result<()> {
        let items = self.fetch_picks(RANDOM_ITEMS).await?;
        info!(count = items.len(), "random selection reloaded");
        self.random_items.set(items);
        Ok(())
    }

    /// Fetch the uncached objects that `entities` reference, one batch per
    /// type. Types without a cache are skipped.
    pub async fn fetch_related(&self, entities: &[Arc<Entity>]) -> Result<()> {
        let mut fetches = Vec::new();
        for (kind, ids) in related_ids(entities.iter().map(|entity| &**entity)) {
            let Some(cache) = self.cache_for(&kind) else {
                trace!(kind = %kind, "no cache for related type");
                continue;
            };
            let missing: Vec<EntityId> = ids.into_iter().filter(|id| cache.get(id).is_none()).collect();
            if missing.is_empty() {
                continue;
            }
            debug!(kind = %kind, count = missing.len(), "fetching related objects");
            fetches.push(async move { cache.fetch(&missing).await });
        }
        try_join_all(fetches).await?;
        Ok(())
    }

    /// The cache holding objects of JSON:API type `kind`.
    pub fn cache_for(&self, kind: &str) -> Option<&CacheStore<Entity>> {
        match kind {
            "rooms" => Some(&self.rooms),
            "items" => Some(&self.items),
            "floor-topics" => Some(&self.topics),
            _ => None,
        }
    }

    /// Store the tracking consent in local preferences.
    pub fn set_consent(&self, consent: bool) -> Result<()> {
        self.local_preferences
            .set_preference("tracking.consent", Value::Bool(consent))
    }

    /// Store the visitor's age band in local preferences.
    pub fn set_age_band(&self, age_band: &str) -> Result<()> {
        self.local_preferences
            .set_preference("tracking.ageBand", Value::String(age_band.to_string()))
    }

    async fn get_json(&self, path: &str, query: Query) -> Result<Value> {
        let _busy = self.busy.guard();
        let result = self.transport.get_json(path, query).await;
        if let Err(err) = &result {
            warn!(path, error = %err, "request failed");
        }
        result
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn busy(&self) -> &BusyCounter {
        &self.busy
    }

    pub fn is_busy(&self) -> Derived<bool> {
        self.busy.is_busy()
    }

    pub fn status(&self) -> &IntervalStore<Option<ApiStatus>> {
        &self.status
    }

    pub fn is_connected(&self) -> &Derived<bool> {
        &self.is_connected
    }

    pub fn is_ready(&self) -> &Derived<bool> {
        &self.is_ready
    }

    pub fn is_updatable(&self) -> &Derived<bool> {
        &self.is_updatable
    }

    pub fn floors(&self) -> &DependentStore<Floors, bool> {
        &self.floors
    }

    pub fn floor_topics(&self) -> &Signal<Vec<Arc<Entity>>> {
        &self.floor_topics
    }

    /// The configuration object loaded by [`fetch_config`](Self::fetch_config).
    pub fn site_config(&self) -> &Signal<Option<Arc<Entity>>> {
        &self.site_config
    }

    pub fn major_collections(&self) -> &Derived<Vec<MajorCollection>> {
        &self.major_collections
    }

    /// 0 until the floors are loaded, then 100.
    pub fn loading_progress(&self) -> &Derived<u8> {
        &self.loading_progress
    }

    pub fn is_loaded(&self) -> &Derived<bool> {
        &self.is_loaded
    }

    pub fn rooms(&self) -> &CacheStore<Entity> {
        &self.rooms
    }

    pub fn items(&self) -> &CacheStore<Entity> {
        &self.items
    }

    pub fn topics(&self) -> &CacheStore<Entity> {
        &self.topics
    }

    pub fn item_of_the_day(&self) -> &Signal<Option<Arc<Entity>>> {
        &self.item_of_the_day
    }

    pub fn random_items(&self) -> &Signal<Vec<Arc<Entity>>> {
        &self.random_items
    }

    pub fn location(&self) -> &Signal<Location> {
        &self.location
    }

    pub fn current_floor(&self) -> &Derived<Option<Arc<Entity>>> {
        &self.current_floor
    }

    pub fn current_room(&self) -> &Derived<Option<Arc<Entity>>> {
        &self.current_room
    }

    pub fn current_item(&self) -> &Derived<Option<Arc<Entity>>> {
        &self.current_item
    }

    pub fn current_rooms(&self) -> &Derived<Vec<Arc<Entity>>> {
        &self.current_rooms
    }

    pub fn current_items(&self) -> &Derived<Vec<Arc<Entity>>> {
        &self.current_items
    }

    pub fn local_preferences(&self) -> &Preferences {
        &self.local_preferences
    }

    pub fn session_preferences(&self) -> &Preferences {
        &self.session_preferences
    }

    pub fn consent(&self) -> &Derived<bool> {
        &self.consent
    }

    pub fn age_band(&self) -> &Derived<String> {
        &self.age_band
    }

    pub fn tracking_allowed(&self) -> &Derived<bool> {
        &self.tracking_allowed
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("busy", &self.busy)
            .field("rooms", &self.rooms)
            .field("items", &self.items)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Polls `/api/`. Any failure publishes `None`.
fn status_store(
    config: &StoreConfig,
    transport: &Arc<dyn Transport>,
    busy: &BusyCounter,
) -> IntervalStore<Option<ApiStatus>> {
    let transport = Arc::clone(transport);
    let busy = busy.clone();
    IntervalStore::new(
        None,
        move || {
            let request = transport.get_json(STATUS_PATH, Vec::new());
            let guard = busy.guard();
            Computation::pending(async move {
                let _busy = guard;
                let status = request
                    .await
                    .and_then(|document| Ok(serde_json::from_value::<ApiStatus>(document)?));
                match status {
                    Ok(status) => Some(status),
                    Err(err) => {
                        warn!(error = %err, "status check failed");
                        None
                    }
                }
            })
        },
        config.status_interval(),
    )
}

/// Fetches `/api/floors/` whenever the backend becomes ready.
fn floors_store(
    transport: &Arc<dyn Transport>,
    busy: &BusyCounter,
    is_ready: Derived<bool>,
) -> DependentStore<Floors, bool> {
    let transport = Arc::clone(transport);
    let busy = busy.clone();
    DependentStore::new(
        None,
        move |ready: &bool| {
            if !*ready {
                return Computation::ready(None);
            }
            let request = transport.get_json(FLOORS_PATH, Vec::new());
            let guard = busy.guard();
            Computation::pending(async move {
                let _busy = guard;
                match request.await.and_then(parse_entities) {
                    Ok(floors) => Some(floors.into_iter().map(Arc::new).collect()),
                    Err(err) => {
                        warn!(error = %err, "loading floors failed");
                        None
                    }
                }
            })
        },
        is_ready,
    )
}

/// The cached entity named by a location component, fetched on a miss.
fn current_entity(
    cache: &CacheStore<Entity>,
    location: &Signal<Location>,
    component: &'static str,
) -> Derived<Option<Arc<Entity>>> {
    let loader = cache.clone();
    Derived::new((cache.clone(), location.clone()), move |(entries, location)| {
        let id = location.component_id(component)?;
        let found = entries.get(&id).cloned();
        if found.is_none() {
            loader.prefetch(vec![id]);
        }
        found
    })
}

/// The cached entities listed by `parent` under `list`, in list order.
/// Missing ones are fetched and appear once loaded.
fn contained_entities(
    cache: &CacheStore<Entity>,
    parent: &Derived<Option<Arc<Entity>>>,
    list: &'static str,
) -> Derived<Vec<Arc<Entity>>> {
    let loader = cache.clone();
    Derived::new((cache.clone(), parent.clone()), move |(entries, parent)| {
        let Some(parent) = parent else {
            return Vec::new();
        };
        let (found, missing) = resolve_ids(entries, &parent.id_list(list));
        if !missing.is_empty() {
            loader.prefetch(missing);
        }
        found
    })
}
