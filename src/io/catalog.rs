//! Spatio-temporal catalog queries: metadata filters, the catalog
//! capability trait and a STAC API client.
//!
//! A catalog query returns scene metadata only; no pixel data is fetched
//! here. Scene materialization is the job of the constructor callable handed
//! to the [`crate::mapper::Mapper`].

use crate::types::{BoundingBox, EoError, EoResult, Feature};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Comparison operator of a metadata filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
}

impl FromStr for CompareOp {
    type Err = EoError;

    fn from_str(s: &str) -> EoResult<Self> {
        match s {
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            "==" => Ok(CompareOp::Eq),
            ">=" => Ok(CompareOp::Ge),
            ">" => Ok(CompareOp::Gt),
            "!=" => Ok(CompareOp::Ne),
            other => Err(EoError::CatalogQuery(format!(
                "unsupported comparison operator '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ge => ">=",
            CompareOp::Gt => ">",
            CompareOp::Ne => "!=",
        };
        write!(f, "{}", symbol)
    }
}

/// One `(attribute, operator, value)` metadata condition.
///
/// Filters on a query form a conjunction. A scene without the attribute
/// never matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    attribute: String,
    op: CompareOp,
    value: Value,
}

impl Filter {
    /// Build a filter, failing fast on an unsupported operator string
    pub fn new(attribute: impl Into<String>, op: &str, value: Value) -> EoResult<Self> {
        Ok(Self {
            attribute: attribute.into(),
            op: op.parse()?,
            value,
        })
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn op(&self) -> CompareOp {
        self.op
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Evaluate the condition against an attribute value of a scene
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        let actual = match actual {
            Some(v) => v,
            None => return false,
        };
        if let (Some(a), Some(b)) = (actual.as_f64(), self.value.as_f64()) {
            return match self.op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Eq => a == b,
                CompareOp::Ge => a >= b,
                CompareOp::Gt => a > b,
                CompareOp::Ne => a != b,
            };
        }
        if let (Some(a), Some(b)) = (actual.as_str(), self.value.as_str()) {
            return match self.op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Eq => a == b,
                CompareOp::Ge => a >= b,
                CompareOp::Gt => a > b,
                CompareOp::Ne => a != b,
            };
        }
        match self.op {
            CompareOp::Eq => actual == &self.value,
            CompareOp::Ne => actual != &self.value,
            _ => false,
        }
    }
}

/// Parameters of one catalog query
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub collection: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub feature: Feature,
    pub filters: Vec<Filter>,
}

impl CatalogQuery {
    /// Contract checks shared by all catalog backends
    pub fn validate(&self) -> EoResult<()> {
        if self.time_start >= self.time_end {
            return Err(EoError::CatalogQuery(format!(
                "time_start {} is not before time_end {}",
                self.time_start.to_rfc3339(),
                self.time_end.to_rfc3339()
            )));
        }
        if self.feature.epsg() != 4326 {
            return Err(EoError::CatalogQuery(format!(
                "catalog queries require the feature in EPSG:4326, got EPSG:{}",
                self.feature.epsg()
            )));
        }
        Ok(())
    }
}

/// Metadata of one catalog scene; no pixel data
#[derive(Debug, Clone, PartialEq)]
pub struct SceneMetadata {
    pub scene_id: String,
    pub timestamp: DateTime<Utc>,
    /// Footprint extent in EPSG:4326
    pub bbox: BoundingBox,
    /// Asset name to storage reference (href)
    pub assets: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, Value>,
}

/// Capability interface of a scene metadata catalog.
///
/// Implementations return records sorted by ascending acquisition time with
/// all query filters applied.
pub trait SceneCatalog {
    fn search(&self, query: &CatalogQuery) -> EoResult<Vec<SceneMetadata>>;
}

/// Apply a filter conjunction and sort records chronologically; shared by
/// catalog backends that filter client-side
pub fn filter_and_sort(
    mut records: Vec<SceneMetadata>,
    filters: &[Filter],
) -> Vec<SceneMetadata> {
    records.retain(|record| {
        filters
            .iter()
            .all(|f| f.matches(record.attributes.get(f.attribute())))
    });
    records.sort_by_key(|r| r.timestamp);
    records
}

/// Client for a STAC API endpoint (`POST {endpoint}/search`).
///
/// Transient faults (transport errors, HTTP 5xx) are retried with a bounded
/// sleep backoff; client errors (4xx) fail immediately.
pub struct StacClient {
    endpoint: String,
    client: reqwest::blocking::Client,
    max_retries: u32,
    backoff: std::time::Duration,
}

impl StacClient {
    pub fn new(endpoint: impl Into<String>) -> EoResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .user_agent(concat!("eostack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EoError::CatalogQuery(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
            max_retries: 3,
            backoff: std::time::Duration::from_secs(2),
        })
    }

    pub fn with_retry(mut self, max_retries: u32, backoff: std::time::Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    fn search_request(&self, query: &CatalogQuery) -> EoResult<Value> {
        let bbox = query.feature.bounding_box()?;
        Ok(json!({
            "collections": [query.collection],
            "bbox": [bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y],
            "datetime": format!(
                "{}/{}",
                query.time_start.to_rfc3339(),
                query.time_end.to_rfc3339()
            ),
            "limit": 500,
        }))
    }

    /// Single request attempt; the caller decides about retries
    fn try_search_once(&self, body: &Value) -> EoResult<Value> {
        let url = format!("{}/search", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| EoError::TransientIo(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(EoError::TransientIo(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            )));
        }
        if !status.is_success() {
            return Err(EoError::CatalogQuery(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                url
            )));
        }
        response
            .json()
            .map_err(|e| EoError::CatalogQuery(format!("invalid catalog response: {}", e)))
    }

    fn search_with_retry(&self, body: &Value) -> EoResult<Value> {
        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            log::debug!("catalog search attempt {} of {}", attempt, self.max_retries);
            match self.try_search_once(body) {
                Ok(response) => return Ok(response),
                Err(e @ EoError::TransientIo(_)) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        log::warn!("catalog search attempt {} failed, retrying...", attempt);
                        std::thread::sleep(self.backoff * attempt);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            EoError::TransientIo("catalog search failed after all retries".to_string())
        }))
    }

    fn parse_item(item: &Value) -> EoResult<SceneMetadata> {
        let scene_id = item
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| EoError::CatalogQuery("catalog item without id".to_string()))?
            .to_string();
        let properties = item
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                EoError::CatalogQuery(format!("catalog item '{}' without properties", scene_id))
            })?;
        let datetime = properties
            .get("datetime")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EoError::CatalogQuery(format!("catalog item '{}' without datetime", scene_id))
            })?;
        let timestamp = DateTime::parse_from_rfc3339(datetime)
            .map_err(|e| {
                EoError::CatalogQuery(format!(
                    "catalog item '{}' has invalid datetime '{}': {}",
                    scene_id, datetime, e
                ))
            })?
            .with_timezone(&Utc);
        let bbox_values: Vec<f64> = item
            .get("bbox")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        let bbox = if bbox_values.len() >= 4 {
            BoundingBox::new(bbox_values[0], bbox_values[1], bbox_values[2], bbox_values[3])
        } else {
            return Err(EoError::CatalogQuery(format!(
                "catalog item '{}' without usable bbox",
                scene_id
            )));
        };
        let mut assets = BTreeMap::new();
        if let Some(map) = item.get("assets").and_then(Value::as_object) {
            for (name, asset) in map {
                if let Some(href) = asset.get("href").and_then(Value::as_str) {
                    assets.insert(name.clone(), href.to_string());
                }
            }
        }
        let attributes = properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(SceneMetadata {
            scene_id,
            timestamp,
            bbox,
            assets,
            attributes,
        })
    }
}

impl SceneCatalog for StacClient {
    fn search(&self, query: &CatalogQuery) -> EoResult<Vec<SceneMetadata>> {
        query.validate()?;
        let body = self.search_request(query)?;
        log::info!(
            "querying catalog collection '{}' ({} .. {})",
            query.collection,
            query.time_start.to_rfc3339(),
            query.time_end.to_rfc3339()
        );
        let response = self.search_with_retry(&body)?;
        let items = response
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                EoError::CatalogQuery("catalog response without 'features' array".to_string())
            })?;
        let records: Vec<SceneMetadata> = items
            .iter()
            .map(Self::parse_item)
            .collect::<EoResult<_>>()?;
        let records = filter_and_sort(records, &query.filters);
        log::info!("catalog returned {} matching scenes", records.len());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_operator_fails_fast() {
        assert!(Filter::new("eo:cloud_cover", "<", json!(30)).is_ok());
        let result = Filter::new("eo:cloud_cover", "~=", json!(30));
        assert!(matches!(result, Err(EoError::CatalogQuery(_))));
    }

    #[test]
    fn test_filter_matching() {
        let lt = Filter::new("eo:cloud_cover", "<", json!(30)).unwrap();
        assert!(lt.matches(Some(&json!(10.5))));
        assert!(!lt.matches(Some(&json!(45))));
        assert!(!lt.matches(None));

        let eq = Filter::new("platform", "==", json!("sentinel-2a")).unwrap();
        assert!(eq.matches(Some(&json!("sentinel-2a"))));
        assert!(!eq.matches(Some(&json!("sentinel-2b"))));
    }

    #[test]
    fn test_parse_stac_item() {
        let item = json!({
            "id": "S2A_T32TMT_20230601",
            "bbox": [10.0, 45.0, 11.0, 46.0],
            "properties": {
                "datetime": "2023-06-01T10:17:41Z",
                "eo:cloud_cover": 12.3,
            },
            "assets": {
                "B04": {"href": "https://example.com/B04.tif"},
            },
        });
        let record = StacClient::parse_item(&item).unwrap();
        assert_eq!(record.scene_id, "S2A_T32TMT_20230601");
        assert_eq!(record.assets["B04"], "https://example.com/B04.tif");
        assert_eq!(record.attributes["eo:cloud_cover"], json!(12.3));

        let broken = json!({"id": "x", "properties": {}});
        assert!(StacClient::parse_item(&broken).is_err());
    }

    #[test]
    fn test_filter_and_sort_orders_chronologically() {
        let make = |id: &str, ts: &str, cloud: f64| SceneMetadata {
            scene_id: id.to_string(),
            timestamp: ts.parse().unwrap(),
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            assets: BTreeMap::new(),
            attributes: [("eo:cloud_cover".to_string(), json!(cloud))]
                .into_iter()
                .collect(),
        };
        let records = vec![
            make("b", "2023-06-05T10:00:00Z", 80.0),
            make("c", "2023-06-09T10:00:00Z", 5.0),
            make("a", "2023-06-01T10:00:00Z", 10.0),
        ];
        let filters = vec![Filter::new("eo:cloud_cover", "<=", json!(30)).unwrap()];
        let result = filter_and_sort(records, &filters);
        let ids: Vec<&str> = result.iter().map(|r| r.scene_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
