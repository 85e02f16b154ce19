//! Geofence gate — location lookup and zone membership.
//!
//! The gate fails closed: any failure to resolve the current location is a
//! `Deny`, reported separately from a legitimate out-of-range `Deny`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Mean Earth radius (IUGG), kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Error, Debug)]
pub enum LocationError {
    #[error("location lookup failed: {0}")]
    Lookup(String),
    #[error("malformed location response: {0}")]
    Malformed(String),
    #[error("coordinate out of range: ({0}, {1})")]
    OutOfRange(f64, f64),
}

/// A point on the Earth's surface, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoCoordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Validate ranges: latitude in [-90, 90], longitude in [-180, 180].
    pub fn checked(latitude: f64, longitude: f64) -> Result<Self, LocationError> {
        let lat_ok = latitude.is_finite() && (-90.0..=90.0).contains(&latitude);
        let lon_ok = longitude.is_finite() && (-180.0..=180.0).contains(&longitude);
        if lat_ok && lon_ok {
            Ok(Self::new(latitude, longitude))
        } else {
            Err(LocationError::OutOfRange(latitude, longitude))
        }
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &GeoCoordinate) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

impl fmt::Display for GeoCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.latitude, self.longitude)
    }
}

/// Parses `"<lat>,<lon>"`, the format IP geolocation services return.
impl FromStr for GeoCoordinate {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s
            .split_once(',')
            .ok_or_else(|| LocationError::Malformed(format!("expected \"lat,lon\", got {s:?}")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<f64>()
                .map_err(|e| LocationError::Malformed(format!("{v:?}: {e}")))
        };
        Self::checked(parse(lat)?, parse(lon)?)
    }
}

/// A named circular region.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowedZone {
    pub name: String,
    pub center: GeoCoordinate,
    pub radius_km: f64,
}

/// Distance from the current location to one zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDistance {
    pub zone: String,
    pub distance_km: f64,
    pub radius_km: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    /// Location resolved, but no zone contains it.
    OutsideZones { nearest: Option<ZoneDistance> },
    /// Location could not be resolved; the gate fails closed.
    LocationUnavailable(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::OutsideZones { nearest: Some(n) } => write!(
                f,
                "outside every allowed zone (nearest: {} at {:.2} km, radius {} km)",
                n.zone, n.distance_km, n.radius_km
            ),
            DenyReason::OutsideZones { nearest: None } => write!(f, "no allowed zones configured"),
            DenyReason::LocationUnavailable(reason) => {
                write!(f, "unable to detect location: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept(ZoneDistance),
    Deny(DenyReason),
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accept(_))
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::Accept(z) => {
                write!(f, "access granted: within {:.2} km of {}", z.distance_km, z.zone)
            }
            GateDecision::Deny(reason) => write!(f, "access denied: {reason}"),
        }
    }
}

/// Source of the requester's current location.
pub trait LocationProvider {
    fn locate(&self) -> Result<GeoCoordinate, LocationError>;
}

/// Body of an IP geolocation response. Accepts both the `"loc": "lat,lon"`
/// shape and separate numeric fields.
#[derive(Debug, Deserialize)]
struct IpLookup {
    loc: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl IpLookup {
    fn coordinate(self) -> Result<GeoCoordinate, LocationError> {
        match (self.loc, self.latitude, self.longitude) {
            (Some(loc), _, _) => loc.parse(),
            (None, Some(lat), Some(lon)) => GeoCoordinate::checked(lat, lon),
            _ => Err(LocationError::Malformed("response carries no coordinates".into())),
        }
    }
}

/// Network-derived location via an IP geolocation HTTP endpoint.
pub struct IpLocator {
    agent: ureq::Agent,
    url: String,
}

impl IpLocator {
    /// Every request is bounded by `timeout`; expiry is a lookup failure.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent, url: url.into() }
    }
}

impl LocationProvider for IpLocator {
    fn locate(&self) -> Result<GeoCoordinate, LocationError> {
        tracing::debug!(url = %self.url, "resolving location");
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| LocationError::Lookup(e.to_string()))?;
        let body: IpLookup = response
            .into_json()
            .map_err(|e| LocationError::Malformed(e.to_string()))?;
        body.coordinate()
    }
}

/// A configured, fixed location (offline operation).
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub GeoCoordinate);

impl LocationProvider for FixedLocation {
    fn locate(&self) -> Result<GeoCoordinate, LocationError> {
        Ok(self.0)
    }
}

/// Zone membership check over a static, ordered set of zones.
pub struct GeofenceGate {
    zones: Vec<AllowedZone>,
}

impl GeofenceGate {
    pub fn new(zones: Vec<AllowedZone>) -> Self {
        Self { zones }
    }

    pub fn zones(&self) -> &[AllowedZone] {
        &self.zones
    }

    /// Accept if `current` lies within any zone, boundary inclusive.
    ///
    /// The first matching zone in configured order is reported.
    pub fn verify(&self, current: GeoCoordinate) -> GateDecision {
        let mut nearest: Option<ZoneDistance> = None;

        for zone in &self.zones {
            let distance_km = current.distance_km(&zone.center);
            let candidate = ZoneDistance {
                zone: zone.name.clone(),
                distance_km,
                radius_km: zone.radius_km,
            };
            if distance_km <= zone.radius_km {
                return GateDecision::Accept(candidate);
            }
            let closer = nearest.as_ref().map_or(true, |n| distance_km < n.distance_km);
            if closer {
                nearest = Some(candidate);
            }
        }

        GateDecision::Deny(DenyReason::OutsideZones { nearest })
    }

    /// Resolve the location through `provider`, then [`verify`](Self::verify) it.
    pub fn check(&self, provider: &dyn LocationProvider) -> GateDecision {
        let decision = match provider.locate() {
            Ok(current) => {
                tracing::info!(%current, "location resolved");
                self.verify(current)
            }
            Err(e) => {
                tracing::warn!(error = %e, "location unavailable; denying");
                GateDecision::Deny(DenyReason::LocationUnavailable(e.to_string()))
            }
        };

        match &decision {
            GateDecision::Accept(z) => {
                tracing::info!(zone = %z.zone, distance_km = z.distance_km, "geofence accepted")
            }
            GateDecision::Deny(reason) => tracing::info!(%reason, "geofence denied"),
        }

        decision
    }
}
