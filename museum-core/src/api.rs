//! Backend access.
//!
//! Stores never talk HTTP directly. They go through a [`Transport`], which
//! [`HttpTransport`] implements on reqwest and tests implement with canned
//! responses.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::config::StoreConfig;
use crate::entity::{Entity, EntityId};
use crate::error::{Result, StoreError};
use crate::store::Loader;

/// Query string pairs, sent in order. Keys may repeat.
pub type Query = Vec<(String, String)>;

/// Fetches JSON documents from the backend.
pub trait Transport: Send + Sync + 'static {
    /// GET `path` with `query`. A non-success status is an error.
    fn get_json(&self, path: &str, query: Query) -> BoxFuture<'static, Result<Value>>;
}

/// Application status, served by `/api/`.
pub const STATUS_PATH: &str = "/api/";
/// Every floor, served as flat records.
pub const FLOORS_PATH: &str = "/api/floors/";
/// Every floor topic, served as JSON:API resources.
pub const FLOOR_TOPICS_PATH: &str = "/api/floor-topics/";
/// The frontend configuration object.
pub const CONFIG_PATH: &str = "/api/config/all";
/// Prefix of the curated item selections, followed by the pick name.
pub const PICKS_PATH: &str = "/api/picks/";
/// Pick name of the item of the day.
pub const ITEM_OF_THE_DAY: &str = "item-of-the-day";
/// Pick name of the random item selection.
pub const RANDOM_ITEMS: &str = "random-items";

/// A collection endpoint that accepts a list of ids.
///
/// Ids are sent by repeating the id parameter: `?rid=1&rid=2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub path: &'static str,
    pub id_param: &'static str,
}

impl Endpoint {
    pub const ROOMS: Endpoint = Endpoint {
        path: "/api/rooms/",
        id_param: "rid",
    };

    pub const ITEMS: Endpoint = Endpoint {
        path: "/api/items/",
        id_param: "iid",
    };

    pub const TOPICS: Endpoint = Endpoint {
        path: FLOOR_TOPICS_PATH,
        id_param: "tid",
    };

    /// Query selecting `ids`.
    pub fn query(&self, ids: &[EntityId]) -> Query {
        ids.iter()
            .map(|id| (self.id_param.to_string(), id.to_string()))
            .collect()
    }
}

/// Read a list of objects out of a response: either a bare array or a
/// JSON:API `{"data": [...]}` document.
pub fn parse_entities(document: Value) -> Result<Vec<Entity>> {
    let records = match document {
        Value::Array(records) => records,
        Value::Object(mut document) => match document.remove("data") {
            Some(Value::Array(records)) => records,
            _ => return Err(StoreError::Decode("expected a list of records".to_string())),
        },
        other => return Err(StoreError::Decode(format!("expected a list of records, got {other}"))),
    };
    records.into_iter().map(Entity::from_value).collect()
}

/// Read one object out of a response, unwrapping a JSON:API `data` member.
pub fn parse_entity(document: Value) -> Result<Entity> {
    match document {
        Value::Object(mut document) if document.get("data").is_some_and(Value::is_object) => {
            Entity::from_value(document.remove("data").unwrap_or(Value::Null))
        }
        other => Entity::from_value(other),
    }
}

/// Read zero or more objects out of any response shape: a list, a JSON:API
/// document holding one resource or a list, or a single bare object.
pub fn parse_records(document: Value) -> Result<Vec<Entity>> {
    match document {
        Value::Object(document) if document.get("data").is_some_and(Value::is_object) => {
            Ok(vec![parse_entity(Value::Object(document))?])
        }
        Value::Object(document) if !document.contains_key("data") => {
            Ok(vec![Entity::from_value(Value::Object(document))?])
        }
        other => parse_entities(other),
    }
}

// ----------------------------------------------------------------------------
// HTTP
// ----------------------------------------------------------------------------

/// [`Transport`] over reqwest.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Transport for HttpTransport {
    fn get_json(&self, path: &str, query: Query) -> BoxFuture<'static, Result<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let client = self.client.clone();
        async move {
            debug!(%url, params = query.len(), "GET");
            let response = client.get(&url).query(&query).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StoreError::Http {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                });
            }
            Ok(response.json::<Value>().await?)
        }
        .boxed()
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Loader
// ----------------------------------------------------------------------------

/// Loads entities for a cache from one endpoint.
#[derive(Clone)]
pub struct EndpointLoader {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
}

impl EndpointLoader {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint) -> Self {
        Self {
            transport,
            endpoint,
        }
    }
}

impl Loader<Entity> for EndpointLoader {
    fn load(&self, ids: Vec<EntityId>) -> BoxFuture<'static, Result<Vec<Entity>>> {
        let request = self
            .transport
            .get_json(self.endpoint.path, self.endpoint.query(&ids));
        async move { parse_entities(request.await?) }.boxed()
    }
}

impl fmt::Debug for EndpointLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLoader")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
