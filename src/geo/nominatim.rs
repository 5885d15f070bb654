use anyhow::{Context, Result};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use super::{Coordinate, ReverseGeocoder};

/// Reverse geocoder backed by an OpenStreetMap Nominatim endpoint.
pub struct NominatimGeocoder {
    base_url: String,
    user_agent: String,
    client: Client,
}

impl NominatimGeocoder {
    pub fn new(base_url: String, user_agent: String) -> Self {
        Self {
            base_url,
            user_agent,
            client: Client::new(),
        }
    }

    fn request_url(&self, coordinate: Coordinate) -> Result<reqwest::Url> {
        let lat = coordinate.latitude.to_string();
        let lon = coordinate.longitude.to_string();
        let params = [
            ("lat", lat.as_str()),
            ("lon", lon.as_str()),
            ("format", "jsonv2"),
            ("zoom", "18"),
        ];
        reqwest::Url::parse_with_params(&self.base_url, &params)
            .with_context(|| format!("Invalid geocoder URL '{}'", self.base_url))
    }
}

#[async_trait::async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    fn name(&self) -> &str {
        "Nominatim"
    }

    async fn reverse(&self, coordinate: Coordinate) -> Result<Option<String>> {
        let url = self.request_url(coordinate)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent).context("Invalid user agent")?,
        );

        let resp = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .context("Nominatim request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Nominatim API error ({status})");
        }

        let json: Value = resp
            .json()
            .await
            .context("Failed to parse Nominatim response JSON")?;

        Ok(json_to_address(&json))
    }
}

/// Pull the single-line address out of a Nominatim reverse response.
fn json_to_address(json: &Value) -> Option<String> {
    if json.get("error").is_some() {
        return None;
    }
    json["display_name"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
