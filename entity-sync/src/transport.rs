//! Backend transport abstraction
//!
//! The engine only ever issues GET requests; everything it needs from a
//! backend is expressed through [`Transport`]. Tests plug in a fake, and the
//! optional `http` feature provides a reqwest-backed implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::entity::Entity;
use crate::error::RequestError;

/// Authenticated session forwarded with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Outcome of a single request that reached the backend.
#[derive(Debug, Clone)]
pub struct Response {
    pub ok: bool,
    pub status: u16,
    pub json: Value,
}

impl Response {
    pub fn ok(json: Value) -> Self {
        Self {
            ok: true,
            status: 200,
            json,
        }
    }

    pub fn error(status: u16) -> Self {
        Self {
            ok: false,
            status,
            json: Value::Null,
        }
    }
}

/// Read access to the backend.
///
/// `Err` means the request never completed; a completed request with a bad
/// status comes back as `Ok` with `ok == false` so callers can map it to
/// their own error domain.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, session: Option<&Session>) -> Result<Response, RequestError>;
}

/// Body of an id-listing response.
#[derive(Debug, Clone, Deserialize)]
pub struct IdListing {
    pub id: Vec<String>,
    pub count: u64,
    #[serde(default)]
    pub more: bool,
}

/// Decoded shape of a windowed list response.
#[derive(Debug, Clone)]
pub enum ListPayload {
    /// Full entity snapshots.
    Entities(Vec<Entity>),
    /// An `attributelist` object: plain key/value attributes, no entities.
    AttributeMap(serde_json::Map<String, Value>),
}

/// Decode a response body whose shape the backend does not announce up
/// front. Arrays hold entities, an object tagged `meta.type ==
/// "attributelist"` carries a key/value map, and any other object is a
/// single entity.
pub fn decode_list_payload(json: Value) -> Result<ListPayload, RequestError> {
    match json {
        Value::Array(values) => {
            let mut entities = Vec::with_capacity(values.len());
            for value in values {
                let entity = Entity::from_value(value)
                    .map_err(|e| RequestError::Decode(e.to_string()))?;
                entities.push(entity);
            }
            Ok(ListPayload::Entities(entities))
        }
        Value::Object(map) => {
            let is_attribute_list = map
                .get("meta")
                .and_then(|m| m.get("type"))
                .and_then(Value::as_str)
                == Some("attributelist");
            if is_attribute_list {
                let data = match map.get("data") {
                    Some(Value::Object(data)) => data.clone(),
                    _ => serde_json::Map::new(),
                };
                return Ok(ListPayload::AttributeMap(data));
            }
            let entity = Entity::from_value(Value::Object(map))
                .map_err(|e| RequestError::Decode(e.to_string()))?;
            Ok(ListPayload::Entities(vec![entity]))
        }
        other => Err(RequestError::Decode(format!(
            "expected array or object, got {other}"
        ))),
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;

    /// [`Transport`] over HTTP. Joins relative urls onto `base_url` and
    /// forwards the session id as an `x-session` header.
    pub struct HttpTransport {
        client: reqwest::Client,
        base_url: String,
    }

    impl HttpTransport {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                base_url: base_url.into(),
            }
        }

        fn full_url(&self, url: &str) -> String {
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("{}{url}", self.base_url.trim_end_matches('/'))
            }
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn get(
            &self,
            url: &str,
            session: Option<&Session>,
        ) -> Result<Response, RequestError> {
            let mut request = self.client.get(self.full_url(url));
            if let Some(session) = session {
                request = request.header("x-session", &session.id);
            }
            let response = request
                .send()
                .await
                .map_err(|e| RequestError::Transport(e.to_string()))?;
            let status = response.status().as_u16();
            let ok = response.status().is_success();
            let json = response.json().await.unwrap_or(Value::Null);
            Ok(Response { ok, status, json })
        }
    }
}
