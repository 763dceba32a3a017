//! Domain values the application stores publish, and the pure functions
//! that compute them.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, EntityId, Relationship};
use crate::store::CacheMap;

/// Number of collections shown on the start page.
pub const MAJOR_COLLECTION_LIMIT: usize = 6;

/// Backend readiness, as served by `/api/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    pub ready: bool,
    pub version: String,
}

impl ApiStatus {
    /// Whether the backend runs a different version than this front end.
    pub fn differs_from(&self, frontend_version: &str) -> bool {
        self.version != frontend_version
    }
}

/// Where the user is, as decomposed by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    /// Named segments of the matched route, e.g. `rid` -> `"12"`.
    pub path_components: HashMap<String, String>,
    pub current_route: Option<String>,
    pub matching_routes: Vec<String>,
}

impl Location {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_component(mut self, name: &str, value: impl Into<String>) -> Self {
        self.path_components.insert(name.to_string(), value.into());
        self
    }

    pub fn with_route(mut self, route: &str) -> Self {
        if self.current_route.is_none() {
            self.current_route = Some(route.to_string());
        }
        self.matching_routes.push(route.to_string());
        self
    }

    /// Id held by the named path component.
    pub fn component_id(&self, name: &str) -> Option<EntityId> {
        self.path_components.get(name).map(|raw| EntityId::parse(raw))
    }
}

/// Floor topics of one group, merged across floors.
#[derive(Debug, Clone, PartialEq)]
pub struct MajorCollection {
    /// Id of the first topic seen for the group.
    pub id: EntityId,
    pub label: String,
    pub size: i64,
    pub group_id: EntityId,
    pub floors: Vec<Arc<Entity>>,
}

/// Group floor topics by their group, sum their sizes and keep the largest
/// [`MAJOR_COLLECTION_LIMIT`]. Topics lacking a group, a floor or
/// attributes are skipped, as are topics on floors not in `floors`.
pub fn major_collections(topics: &[Arc<Entity>], floors: &[Arc<Entity>]) -> Vec<MajorCollection> {
    let mut groups: IndexMap<EntityId, MajorCollection> = IndexMap::new();

    for topic in topics {
        let (Some(group_id), Some(floor_id)) = (topic.related_id("group"), topic.related_id("floor"))
        else {
            continue;
        };
        if topic.attributes.is_empty() {
            continue;
        }
        let Some(floor) = floors.iter().find(|floor| &floor.id == floor_id) else {
            continue;
        };
        let size = topic.attribute("size").and_then(Value::as_i64).unwrap_or(0);

        match groups.get_mut(group_id) {
            Some(collection) => {
                collection.size += size;
                collection.floors.push(Arc::clone(floor));
            }
            None => {
                groups.insert(
                    group_id.clone(),
                    MajorCollection {
                        id: topic.id.clone(),
                        label: topic.attribute_str("label").unwrap_or_default().to_string(),
                        size,
                        group_id: group_id.clone(),
                        floors: vec![Arc::clone(floor)],
                    },
                );
            }
        }
    }

    let mut collections: Vec<MajorCollection> = groups.into_values().collect();
    // Stable: equal sizes keep first-seen order.
    collections.sort_by(|a, b| b.size.cmp(&a.size));
    collections.truncate(MAJOR_COLLECTION_LIMIT);
    collections
}

/// The floor named by the location's `fid` component.
pub fn floor_at(floors: Option<&[Arc<Entity>]>, location: &Location) -> Option<Arc<Entity>> {
    let fid = location.component_id("fid")?;
    floors?.iter().find(|floor| floor.id == fid).cloned()
}

/// Split `ids` into the cached entities, in order, and the ids still missing.
pub fn resolve_ids(entries: &CacheMap<Entity>, ids: &[EntityId]) -> (Vec<Arc<Entity>>, Vec<EntityId>) {
    let mut found = Vec::with_capacity(ids.len());
    let mut missing = Vec::new();
    for id in ids {
        match entries.get(id) {
            Some(entity) => found.push(Arc::clone(entity)),
            None => missing.push(id.clone()),
        }
    }
    (found, missing)
}

/// Ids referenced by the relationships of `entities`, grouped by type in
/// first-seen order without duplicates. Untyped references are skipped.
pub fn related_ids<'a, I>(entities: I) -> IndexMap<String, Vec<EntityId>>
where
    I: IntoIterator<Item = &'a Entity>,
{
    let mut related: IndexMap<String, Vec<EntityId>> = IndexMap::new();
    let refs = entities
        .into_iter()
        .flat_map(|entity| entity.relationships.values())
        .flat_map(Relationship::refs);
    for target in refs {
        let Some(kind) = &target.kind else {
            continue;
        };
        let ids = related.entry(kind.clone()).or_default();
        if !ids.contains(&target.id) {
            ids.push(target.id.clone());
        }
    }
    related
}

/// Tracking needs consent and a known (non-zero) age band.
pub fn tracking_allowed(consent: bool, age_band: &str) -> bool {
    consent && age_band.trim().parse::<i64>().is_ok_and(|band| band > 0)
}
