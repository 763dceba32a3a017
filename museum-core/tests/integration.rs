//! Integration Tests for the Store Graph
//!
//! These tests drive the stores through the public API: reactive
//! primitives working together, and the application context against a
//! scripted backend.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};

use museum_core::api::{Query, Transport};
use museum_core::entity::{Entity, EntityId};
use museum_core::museum::Location;
use museum_core::reactive::{batch, Derived, Setter, Signal};
use museum_core::store::{Computation, DependentStore, KeyValueStorage, MemoryStorage, Preferences};
use museum_core::{AppContext, StoreConfig, StoreError};

// ----------------------------------------------------------------------------
// Scripted backend
// ----------------------------------------------------------------------------

type Handler = dyn Fn(&str, &Query) -> Result<Value, StoreError> + Send + Sync;

/// Answers requests from a handler and records every request made.
struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<(String, Query)>>,
}

impl MockTransport {
    fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Query) -> Result<Value, StoreError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Queries sent to `path`, in request order.
    fn requests_to(&self, path: &str) -> Vec<Query> {
        self.requests
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, q)| q.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    fn get_json(&self, path: &str, query: Query) -> BoxFuture<'static, Result<Value, StoreError>> {
        let result = (self.handler)(path, &query);
        self.requests.lock().push((path.to_string(), query));
        async move { result }.boxed()
    }
}

fn ids_in(query: &Query) -> Vec<i64> {
    query.iter().filter_map(|(_, id)| id.parse().ok()).collect()
}

/// A small museum: two floors, rooms 10 and 11 on floor 1, one item per room.
fn museum(version: &'static str) -> impl Fn(&str, &Query) -> Result<Value, StoreError> + Send + Sync {
    move |path: &str, query: &Query| match path {
        "/api/" => Ok(json!({"ready": true, "version": version})),
        "/api/floors/" => Ok(json!([
            {"id": 1, "label": "Ground floor", "level": 0, "rooms": [10, 11]},
            {"id": 2, "label": "First floor", "level": 1, "rooms": []}
        ])),
        "/api/rooms/" => Ok(Value::Array(
            ids_in(query)
                .into_iter()
                .map(|id| json!({"id": id, "number": format!("R{id}"), "items": [id + 100]}))
                .collect(),
        )),
        "/api/items/" => Ok(Value::Array(
            ids_in(query)
                .into_iter()
                .map(|id| json!({"id": id, "title": format!("Item {id}")}))
                .collect(),
        )),
        "/api/floor-topics/" => Ok(json!({"data": [
            {"id": "1", "type": "floor-topics", "attributes": {"label": "Ceramics", "size": 4},
             "relationships": {"group": {"data": {"type": "groups", "id": "7"}},
                               "floor": {"data": {"type": "floors", "id": "1"}}}},
            {"id": "2", "type": "floor-topics", "attributes": {"label": "Ceramics", "size": 6},
             "relationships": {"group": {"data": {"type": "groups", "id": "7"}},
                               "floor": {"data": {"type": "floors", "id": "2"}}}},
            {"id": "3", "type": "floor-topics", "attributes": {"label": "Textiles", "size": 3},
             "relationships": {"group": {"data": {"type": "groups", "id": "8"}},
                               "floor": {"data": {"type": "floors", "id": "1"}}}}
        ]})),
        "/api/picks/item-of-the-day" => Ok(json!({"id": 105, "title": "Item 105", "room": 10})),
        "/api/picks/random-items" => Ok(json!([
            {"id": 101, "title": "Item 101"},
            {"id": 102, "title": "Item 102"}
        ])),
        "/api/config/all" => Ok(json!({"data": {"id": "all", "type": "configs",
                                                "attributes": {"intro": "Welcome"}}})),
        other => Err(StoreError::Http {
            status: 404,
            url: other.to_string(),
        }),
    }
}

fn app_with(transport: Arc<MockTransport>) -> AppContext {
    AppContext::new(
        StoreConfig::new("http://museum.test"),
        transport,
        Arc::new(MemoryStorage::new()),
    )
    .unwrap()
}

/// Surface store logs with `RUST_LOG=museum_core=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ----------------------------------------------------------------------------
// Reactive primitives
// ----------------------------------------------------------------------------

/// Test that a dependent store republishes in parent order.
#[test]
fn dependent_store_follows_parent_in_order() {
    let parent = Signal::new(1);
    let store = DependentStore::new(0, |p: &i32| Computation::ready(p * 10), parent.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _sub = store.subscribe(move |v| seen_clone.lock().push(*v));
    parent.set(2);

    assert_eq!(*seen.lock(), vec![10, 20]);
}

/// Test that sources changing together cause one async recomputation.
#[test]
fn async_derived_recomputes_once_per_batch() {
    let a = Signal::new(1);
    let b = Signal::new(10);
    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();

    let sum = Derived::new_async(
        (a.clone(), b.clone()),
        0,
        move |(a, b): &(i32, i32), setter: Setter<i32>| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            setter.set(a + b);
        },
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _sub = sum.subscribe(move |v| seen_clone.lock().push(*v));
    let runs_before = runs.load(Ordering::SeqCst);

    batch(|| {
        a.set(2);
        b.set(20);
    });

    assert_eq!(runs.load(Ordering::SeqCst), runs_before + 1);
    assert_eq!(*seen.lock(), vec![11, 22]);
}

/// Test that derived stores only hold their sources while observed.
#[test]
fn derived_chain_is_lazy() {
    let source = Signal::new(2);
    let doubled = Derived::new((source.clone(),), |(v,)| v * 2);
    let quadrupled = Derived::new((doubled.clone(),), |(v,)| v * 2);

    assert_eq!(source.subscriber_count(), 0);
    let sub = quadrupled.subscribe(|_| {});
    assert_eq!(source.subscriber_count(), 1);
    assert_eq!(doubled.subscriber_count(), 1);

    source.set(3);
    assert_eq!(quadrupled.get(), 12);

    drop(sub);
    assert_eq!(source.subscriber_count(), 0);
    assert_eq!(doubled.subscriber_count(), 0);
}

/// Test the preference round-trip on sibling leaves.
#[test]
fn preference_siblings_are_independent() {
    let prefs = Preferences::open(Arc::new(MemoryStorage::new())).unwrap();

    prefs.set_preference("a.b.c", json!(42)).unwrap();
    prefs.set_preference("a.b.d", json!(7)).unwrap();
    assert_eq!(prefs.preference("a.b.c"), Some(json!(42)));

    prefs.delete_preference("a.b.c").unwrap();
    assert_eq!(prefs.preference("a.b.c"), None);
    assert_eq!(prefs.preference("a.b.d"), Some(json!(7)));
}

// ----------------------------------------------------------------------------
// Application context
// ----------------------------------------------------------------------------

/// Test that browsing a floor and a room loads everything through batched
/// requests.
#[tokio::test(start_paused = true)]
async fn browsing_loads_floor_rooms_and_items() {
    init_tracing();
    let transport = MockTransport::new(museum("0.9.1"));
    let app = app_with(transport.clone());

    let _loaded = app.is_loaded().subscribe(|_| {});
    settle().await;
    assert!(app.is_loaded().get());
    assert_eq!(app.loading_progress().get(), 100);
    assert!(app.is_connected().get());
    assert!(!app.is_updatable().get());

    app.navigate(Location::new("/floor/1").with_component("fid", "1"));
    let _rooms = app.current_rooms().subscribe(|_| {});
    settle().await;

    let rooms: Vec<EntityId> = app.current_rooms().get().iter().map(|r| r.id.clone()).collect();
    assert_eq!(rooms, vec![EntityId::Int(10), EntityId::Int(11)]);
    assert_eq!(transport.requests_to("/api/rooms/").len(), 1);
    assert_eq!(ids_in(&transport.requests_to("/api/rooms/")[0]), vec![10, 11]);

    app.navigate(
        Location::new("/floor/1/room/11")
            .with_component("fid", "1")
            .with_component("rid", "11"),
    );
    let _room = app.current_room().subscribe(|_| {});
    let _items = app.current_items().subscribe(|_| {});
    settle().await;

    assert_eq!(app.current_room().get().unwrap().id, EntityId::Int(11));
    let items = app.current_items().get();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attribute_str("title"), Some("Item 111"));
    // Room 11 was already cached.
    assert_eq!(transport.requests_to("/api/rooms/").len(), 1);
    assert_eq!(app.busy().count(), 0);
}

/// Test that an item page fetches the item named in the location.
#[tokio::test(start_paused = true)]
async fn current_item_is_fetched_on_miss() {
    let transport = MockTransport::new(museum("0.9.1"));
    let app = app_with(transport.clone());
    let _item = app.current_item().subscribe(|_| {});

    app.navigate(Location::new("/item/5").with_component("iid", "5"));
    assert!(app.current_item().get().is_none());
    settle().await;

    assert_eq!(app.current_item().get().unwrap().id, EntityId::Int(5));
    assert_eq!(transport.requests_to("/api/items/").len(), 1);
}

/// Test that concurrent room fetches share one request, and that a
/// cached room is served without another.
#[tokio::test(start_paused = true)]
async fn concurrent_room_fetches_share_one_request() {
    let transport = MockTransport::new(museum("0.9.1"));
    let app = app_with(transport.clone());

    let requests: Vec<Vec<EntityId>> = (1..=20).map(|id| vec![EntityId::Int(id)]).collect();
    let results = join_all(requests.iter().map(|ids| app.rooms().fetch(ids))).await;

    assert!(results.iter().all(|r| r.as_ref().unwrap()[0].is_some()));
    assert_eq!(transport.requests_to("/api/rooms/").len(), 1);
    assert_eq!(ids_in(&transport.requests_to("/api/rooms/")[0]).len(), 20);

    let again = app.rooms().fetch(&[EntityId::Int(3)]).await.unwrap();
    assert_eq!(again[0].as_ref().unwrap().id, EntityId::Int(3));
    assert_eq!(transport.requests_to("/api/rooms/").len(), 1);
}

/// Test that picked items land in the items cache and are not fetched again.
#[tokio::test(start_paused = true)]
async fn picks_populate_the_items_cache() {
    let transport = MockTransport::new(museum("0.9.1"));
    let app = app_with(transport.clone());

    app.fetch_item_of_the_day().await.unwrap();
    app.fetch_random_items().await.unwrap();

    assert_eq!(app.item_of_the_day().get().unwrap().id, EntityId::Int(105));
    let random: Vec<EntityId> = app.random_items().get().iter().map(|i| i.id.clone()).collect();
    assert_eq!(random, vec![EntityId::Int(101), EntityId::Int(102)]);
    assert_eq!(app.items().len(), 3);

    let cached = app.items().fetch(&[EntityId::Int(105), EntityId::Int(101)]).await.unwrap();
    assert!(cached.iter().all(Option::is_some));
    assert!(transport.requests_to("/api/items/").is_empty());
    assert_eq!(app.busy().count(), 0);
}

/// Test that reloading the same item of the day does not republish it.
#[tokio::test(start_paused = true)]
async fn item_of_the_day_publishes_only_changes() {
    let transport = MockTransport::new(museum("0.9.1"));
    let app = app_with(transport.clone());
    let published = Arc::new(AtomicI32::new(0));
    let published_clone = published.clone();
    let _sub = app.item_of_the_day().subscribe(move |_| {
        published_clone.fetch_add(1, Ordering::SeqCst);
    });

    app.fetch_item_of_the_day().await.unwrap();
    app.fetch_item_of_the_day().await.unwrap();

    assert_eq!(transport.requests_to("/api/picks/item-of-the-day").len(), 2);
    // The initial `None` plus one item.
    assert_eq!(published.load(Ordering::SeqCst), 2);
}

/// Test that related objects are fetched once per type, skipping cached
/// ones and types without a cache.
#[tokio::test(start_paused = true)]
async fn related_objects_are_fetched_per_type() {
    let transport = MockTransport::new(museum("0.9.1"));
    let app = app_with(transport.clone());
    app.items().fetch(&[EntityId::Int(110)]).await.unwrap();

    let topic = Entity::from_value(json!({
        "id": "1", "type": "floor-topics", "attributes": {},
        "relationships": {
            "rooms": {"data": [{"type": "rooms", "id": "10"}, {"type": "rooms", "id": "11"}]},
            "items": {"data": [{"type": "items", "id": "110"}, {"type": "items", "id": "111"}]},
            "group": {"data": {"type": "groups", "id": "7"}}
        }
    }))
    .unwrap();
    let other = Entity::from_value(json!({
        "id": "2", "type": "floor-topics", "attributes": {},
        "relationships": {
            "rooms": {"data": [{"type": "rooms", "id": "11"}]},
            "item": {"data": {"type": "items", "id": "112"}}
        }
    }))
    .unwrap();

    app.fetch_related(&[Arc::new(topic), Arc::new(other)]).await.unwrap();

    let rooms = transport.requests_to("/api/rooms/");
    assert_eq!(rooms.len(), 1);
    assert_eq!(ids_in(&rooms[0]), vec![10, 11]);
    let items = transport.requests_to("/api/items/");
    assert_eq!(items.len(), 2);
    assert_eq!(ids_in(&items[1]), vec![111, 112]);
    assert_eq!(transport.requests.lock().len(), 3);
    assert!(app.rooms().get(&EntityId::Int(10)).is_some());
    assert!(app.items().get(&EntityId::Int(112)).is_some());
}

/// Test that withdrawing consent can clear the age band from an observer.
#[test]
fn consent_observer_may_clear_age_band() {
    let app = app_with(MockTransport::new(museum("0.9.1")));
    app.set_age_band("3").unwrap();
    app.set_consent(true).unwrap();

    let prefs = app.local_preferences().clone();
    let _sub = app.consent().subscribe(move |consent| {
        if !*consent && prefs.preference("tracking.ageBand").is_some() {
            prefs.delete_preference("tracking.ageBand").unwrap();
        }
    });
    app.set_consent(false).unwrap();

    assert_eq!(app.local_preferences().preference("tracking.ageBand"), None);
    assert_eq!(app.age_band().get(), "0");
    assert!(!app.tracking_allowed().get());
}

/// Test that status polling runs only while observed.
#[tokio::test(start_paused = true)]
async fn status_polls_only_while_observed() {
    init_tracing();
    let transport = MockTransport::new(museum("0.9.1"));
    let app = app_with(transport.clone());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(transport.requests_to("/api/").is_empty());

    let first = app.is_connected().subscribe(|_| {});
    let second = app.is_ready().subscribe(|_| {});
    tokio::time::sleep(Duration::from_secs(120) + Duration::from_millis(1)).await;
    assert_eq!(transport.requests_to("/api/").len(), 3);

    drop(first);
    drop(second);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.requests_to("/api/").len(), 3);
}

/// Test that an unreachable backend leaves the app empty, not stuck.
#[tokio::test(start_paused = true)]
async fn unreachable_backend_presents_empty_state() {
    init_tracing();
    let transport = MockTransport::new(|_: &str, _: &Query| {
        Err(StoreError::Transport("connection refused".to_string()))
    });
    let app = app_with(transport.clone());

    let _loaded = app.is_loaded().subscribe(|_| {});
    settle().await;

    assert!(!app.is_connected().get());
    assert!(!app.is_loaded().get());
    assert_eq!(app.loading_progress().get(), 0);
    assert!(transport.requests_to("/api/floors/").is_empty());
    assert!(!app.is_busy().get());

    assert!(app.fetch_floor_topics().await.is_err());
    assert!(app.floor_topics().get().is_empty());
    assert_eq!(app.busy().count(), 0);
}

/// Test that a backend on another version flags an update.
#[tokio::test(start_paused = true)]
async fn version_mismatch_is_updatable() {
    let app = app_with(MockTransport::new(museum("1.0.0")));

    let _sub = app.is_updatable().subscribe(|_| {});
    settle().await;

    assert!(app.is_updatable().get());
}

/// Test that major collections merge topics across floors.
#[tokio::test(start_paused = true)]
async fn major_collections_merge_floor_topics() {
    let app = app_with(MockTransport::new(museum("0.9.1")));
    let _sub = app.major_collections().subscribe(|_| {});

    app.fetch_floor_topics().await.unwrap();
    settle().await;

    let collections = app.major_collections().get();
    assert_eq!(collections.len(), 2);
    assert_eq!(collections[0].label, "Ceramics");
    assert_eq!(collections[0].size, 10);
    assert_eq!(collections[0].floors.len(), 2);
    assert_eq!(collections[1].label, "Textiles");
}

/// Test that the config object is loaded on request.
#[tokio::test]
async fn config_object_is_loaded() {
    let app = app_with(MockTransport::new(museum("0.9.1")));
    assert!(app.site_config().get().is_none());

    app.fetch_config().await.unwrap();

    let config = app.site_config().get().unwrap();
    assert_eq!(config.attribute_str("intro"), Some("Welcome"));
}

/// Test that tracking needs both consent and an age band.
#[test]
fn tracking_follows_preferences() {
    let app = app_with(MockTransport::new(museum("0.9.1")));
    let _sub = app.tracking_allowed().subscribe(|_| {});
    assert!(!app.tracking_allowed().get());

    app.set_consent(true).unwrap();
    assert!(app.consent().get());
    assert_eq!(app.age_band().get(), "0");
    assert!(!app.tracking_allowed().get());

    app.set_age_band("3").unwrap();
    assert!(app.tracking_allowed().get());

    app.session_preferences()
        .set_preference("tracking.consent", json!(false))
        .unwrap();
    assert!(app.tracking_allowed().get());
}

/// Test that local preferences written through one context are read by
/// the next.
#[test]
fn preferences_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::new("http://museum.test");
    config.preferences_path = Some(dir.path().join("storage.json"));

    let first = AppContext::from_config(config.clone()).unwrap();
    first.set_consent(true).unwrap();
    first.set_age_band("2").unwrap();
    drop(first);

    let second = AppContext::from_config(config).unwrap();
    assert!(second.consent().get());
    assert!(second.tracking_allowed().get());
}

/// Test that two contexts share no state.
#[test]
fn contexts_are_isolated() {
    let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
    let config = StoreConfig::new("http://museum.test");
    let a = AppContext::new(config.clone(), MockTransport::new(museum("0.9.1")), storage.clone()).unwrap();
    let b = AppContext::new(config, MockTransport::new(museum("0.9.1")), Arc::new(MemoryStorage::new()))
        .unwrap();

    a.navigate(Location::new("/floor/2").with_component("fid", "2"));
    a.busy().start();

    assert_eq!(b.location().get(), Location::default());
    assert!(!b.is_busy().get());
    assert!(a.is_busy().get());
}

/// Test that an invalid config is rejected before anything is built.
#[test]
fn invalid_config_is_rejected() {
    let result = AppContext::new(
        StoreConfig::new(""),
        MockTransport::new(museum("0.9.1")),
        Arc::new(MemoryStorage::new()),
    );

    assert!(matches!(result, Err(StoreError::Config { field: "api_base_url", .. })));
}
