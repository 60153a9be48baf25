//! Location records and their resolution.
//!
//! A location is either a GPS fix pushed by a client (kept in the
//! application-wide `GpsSlot`) or an approximate fix resolved from the
//! client's IP address. Resolution talks to public web services and is best
//! effort: every failure collapses to `None` at the `LocationProvider`
//! boundary.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::RwLock;
use std::time::Duration;

use crate::config::GeoSettings;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

pub const IP_ACCURACY: &str = "City-level (~10km)";
pub const ADDRESS_NOT_FOUND: &str = "Address not found";
const UNKNOWN: &str = "Unknown";

/// Forwarding headers consulted for the client address, in priority order.
const CLIENT_IP_HEADERS: [&str; 6] = [
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded",
    "x-cluster-client-ip",
    "forwarded-for",
    "forwarded",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LocationSource {
    #[serde(rename = "GPS")]
    Gps,
    #[serde(rename = "IP")]
    Ip,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocationRecord {
    pub source: LocationSource,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: String,
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub timestamp: Option<String>,
}

impl LocationRecord {
    /// A client-pushed GPS fix.
    pub fn gps(
        latitude: f64,
        longitude: f64,
        accuracy_m: Option<f64>,
        address: Option<String>,
        timestamp: String,
    ) -> Self {
        Self {
            source: LocationSource::Gps,
            latitude: Some(latitude),
            longitude: Some(longitude),
            accuracy: accuracy_m
                .map(|meters| format!("±{:.0} meters", meters))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            address,
            city: None,
            region: None,
            country: None,
            ip: None,
            timestamp: Some(timestamp),
        }
    }
}

/// The current GPS fix. Last write wins; there is no history.
#[derive(Debug, Default)]
pub struct GpsSlot {
    current: RwLock<Option<LocationRecord>>,
}

impl GpsSlot {
    pub fn set(&self, mut record: LocationRecord) {
        record.source = LocationSource::Gps;
        match self.current.write() {
            Ok(mut guard) => *guard = Some(record),
            Err(poisoned) => *poisoned.into_inner() = Some(record),
        }
    }

    pub fn get(&self) -> Option<LocationRecord> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

/// Resolves approximate locations and street addresses.
pub trait LocationProvider: Send + Sync {
    /// Approximate location of `ip`. Loopback addresses resolve the host's public address first.
    fn resolve_from_ip(&self, ip: IpAddr) -> Option<LocationRecord>;

    /// Human-readable address for a coordinate pair.
    fn resolve_address(&self, latitude: f64, longitude: f64) -> Option<String>;
}

/// `LocationProvider` backed by public HTTP services.
pub struct HttpLocationResolver {
    settings: GeoSettings,
    discovery: ureq::Agent,
    lookup: ureq::Agent,
}

impl HttpLocationResolver {
    pub fn new(settings: GeoSettings) -> Self {
        Self {
            settings,
            discovery: ureq::AgentBuilder::new().timeout(DISCOVERY_TIMEOUT).build(),
            lookup: ureq::AgentBuilder::new().timeout(LOOKUP_TIMEOUT).build(),
        }
    }

    /// The host's public address, from the first discovery service that answers.
    fn discover_public_ip(&self) -> Option<IpAddr> {
        for url in &self.settings.ip_discovery_urls {
            match self.fetch_public_ip(url) {
                Ok(ip) => return Some(ip),
                Err(err) => log::debug!("public ip discovery via {} failed: {:#}", url, err),
            }
        }
        None
    }

    fn fetch_public_ip(&self, url: &str) -> Result<IpAddr> {
        let payload: Value = self
            .discovery
            .get(url)
            .call()
            .with_context(|| format!("request {}", url))?
            .into_json()
            .context("decode discovery payload")?;
        // ipify answers {"ip": ".."}, httpbin {"origin": "a, b"}
        let raw = payload
            .get("ip")
            .or_else(|| payload.get("origin"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("discovery payload has no address"))?;
        let first = raw.split(',').next().unwrap_or_default().trim();
        first
            .parse()
            .with_context(|| format!("invalid address '{}'", first))
    }

    fn lookup_ip(&self, ip: IpAddr) -> Result<LocationRecord> {
        let url = self
            .settings
            .ip_geolocation_url
            .replace("{ip}", &ip.to_string());
        let payload: Value = self
            .lookup
            .get(&url)
            .call()
            .with_context(|| format!("request {}", url))?
            .into_json()
            .context("decode geolocation payload")?;
        if payload.get("error").and_then(Value::as_bool) == Some(true) {
            let reason = payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unspecified");
            return Err(anyhow!("geolocation service refused {}: {}", ip, reason));
        }
        if !payload.is_object() {
            return Err(anyhow!("geolocation payload is not an object"));
        }
        let text = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN)
                .to_string()
        };
        Ok(LocationRecord {
            source: LocationSource::Ip,
            latitude: payload.get("latitude").and_then(Value::as_f64),
            longitude: payload.get("longitude").and_then(Value::as_f64),
            accuracy: IP_ACCURACY.to_string(),
            address: None,
            city: Some(text("city")),
            region: Some(text("region")),
            country: Some(text("country_name")),
            ip: Some(ip.to_string()),
            timestamp: Some(crate::now_iso8601()),
        })
    }

    fn lookup_address(&self, latitude: f64, longitude: f64) -> Result<String> {
        let payload: Value = self
            .lookup
            .get(&self.settings.reverse_geocode_url)
            .query("format", "json")
            .query("lat", &latitude.to_string())
            .query("lon", &longitude.to_string())
            .set("User-Agent", &self.settings.user_agent)
            .call()
            .context("reverse geocode request")?
            .into_json()
            .context("decode reverse geocode payload")?;
        Ok(payload
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or(ADDRESS_NOT_FOUND)
            .to_string())
    }
}

impl LocationProvider for HttpLocationResolver {
    fn resolve_from_ip(&self, ip: IpAddr) -> Option<LocationRecord> {
        let target = if ip.is_loopback() || ip.is_unspecified() {
            self.discover_public_ip().unwrap_or(ip)
        } else {
            ip
        };
        match self.lookup_ip(target) {
            Ok(record) => Some(record),
            Err(err) => {
                log::warn!("ip geolocation for {} failed: {:#}", target, err);
                None
            }
        }
    }

    fn resolve_address(&self, latitude: f64, longitude: f64) -> Option<String> {
        match self.lookup_address(latitude, longitude) {
            Ok(address) => Some(address),
            Err(err) => {
                log::warn!("reverse geocoding ({}, {}) failed: {:#}", latitude, longitude, err);
                None
            }
        }
    }
}

/// The requesting client's address. `headers` keys are lowercase.
pub fn client_ip(headers: &HashMap<String, String>, peer: IpAddr) -> IpAddr {
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| parse_forwarded_entry(value))
        .find(|ip| !ip.is_loopback())
        .unwrap_or(peer)
}

fn parse_forwarded_entry(value: &str) -> Option<IpAddr> {
    let first = value.split(',').next()?.trim();
    // RFC 7239 style: for=1.2.3.4;proto=http
    let first = first
        .split(';')
        .find_map(|part| part.trim().strip_prefix("for="))
        .unwrap_or(first)
        .trim_matches('"');
    first.parse().ok()
}

/// Loopback, used when an event has no client address.
pub fn local_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
