// src/simulation/types.rs
//! Wire types for the simulation API

use serde::{Deserialize, Serialize};

/// Observable state of one city, as returned by `GET /v1/cities/:id`.
///
/// Every field is optional: the API adds metrics over time and older
/// snapshots must still parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CityStats {
    pub population: Option<i64>,
    pub approval: Option<f64>,
    pub funds: Option<f64>,
    pub crime: Option<f64>,
    pub pollution: Option<f64>,
    pub game_year: Option<i64>,

    /// Metrics this build does not know about yet
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of a city-creation request
#[derive(Debug, Serialize)]
pub struct CreateCityRequest<'a> {
    pub group: &'a str,
}

/// City-creation response; the API has shipped both field names
#[derive(Debug, Deserialize)]
pub struct CreateCityResponse {
    pub id: Option<String>,
    pub city_id: Option<String>,
}

impl CreateCityResponse {
    pub fn into_id(self) -> Option<String> {
        self.id.or(self.city_id).filter(|s| !s.is_empty())
    }
}

/// Key-minting response; same dual-name tolerance
#[derive(Debug, Deserialize)]
pub struct CreateKeyResponse {
    pub key: Option<String>,
    pub api_key: Option<String>,
}

impl CreateKeyResponse {
    pub fn into_key(self) -> Option<String> {
        self.key.or(self.api_key).filter(|s| !s.is_empty())
    }
}
