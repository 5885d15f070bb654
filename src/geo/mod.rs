//! Location acquisition and reverse geocoding.
//!
//! [`GeoResolver`] turns a [`LocationProvider`] fix into a [`ResolvedLocation`]
//! with a best-effort address from a [`ReverseGeocoder`]. Every failure is
//! soft: the resolver answers [`LocationOutcome::Unavailable`] instead of
//! returning an error, and a failed address lookup falls back to
//! [`ADDRESS_NOT_AVAILABLE`] while keeping the coordinate.

mod nominatim;
mod provider;

pub use nominatim::NominatimGeocoder;
pub use provider::{ExifGpsProvider, FixedLocationProvider};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Address used when reverse geocoding yields nothing.
pub const ADDRESS_NOT_AVAILABLE: &str = "Location: Not available";

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Finite and inside the ±90 / ±180 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.latitude, self.longitude)
    }
}

/// A fix plus its human-readable address. Created once per run, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub coordinate: Coordinate,
    pub address: String,
}

/// Result of [`GeoResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum LocationOutcome {
    Resolved(ResolvedLocation),
    /// No usable fix; the reason is for logs only.
    Unavailable(String),
}

impl LocationOutcome {
    pub fn location(&self) -> Option<&ResolvedLocation> {
        match self {
            Self::Resolved(loc) => Some(loc),
            Self::Unavailable(_) => None,
        }
    }
}

/// Errors a [`LocationProvider`] may report.
#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("location permission not granted")]
    PermissionDenied,
    #[error("location provider error: {0}")]
    Provider(String),
}

/// Parameters of a live-fix subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixRequest {
    pub high_accuracy: bool,
    pub max_updates: u32,
    pub interval: Duration,
}

impl FixRequest {
    /// A single high-accuracy update, the only request the resolver makes.
    pub fn single_high_accuracy() -> Self {
        Self {
            high_accuracy: true,
            max_updates: 1,
            interval: Duration::from_secs(1),
        }
    }
}

/// Events delivered on a live-fix subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixEvent {
    Fix(Coordinate),
    /// The provider reports that no location can be obtained right now.
    Unavailable,
}

/// Source of location fixes.
///
/// Implementations are constructed by the caller and handed to the
/// [`GeoResolver`]; nothing is shared process-wide.
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// The cached last-known fix, if the provider has one.
    async fn last_known(&self) -> Result<Option<Coordinate>, LocationError>;

    /// Start a live-fix subscription. Dropping the receiver cancels it; the
    /// provider must stop sending once the channel is closed.
    async fn request_updates(
        &self,
        request: FixRequest,
    ) -> Result<mpsc::Receiver<FixEvent>, LocationError>;
}

/// Coordinate → address lookup.
#[async_trait::async_trait]
pub trait ReverseGeocoder: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the service has no address for the coordinate.
    async fn reverse(&self, coordinate: Coordinate) -> anyhow::Result<Option<String>>;
}

/// Bounds on how long a resolve may suspend.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// Maximum wait for the live fix after the cached fix missed.
    pub live_fix: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            live_fix: Duration::from_secs(10),
        }
    }
}

/// Wraps a location provider and an optional geocoder.
#[derive(Clone)]
pub struct GeoResolver {
    provider: Arc<dyn LocationProvider>,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
}

impl GeoResolver {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        geocoder: Option<Arc<dyn ReverseGeocoder>>,
    ) -> Self {
        Self { provider, geocoder }
    }

    /// Resolve one best-effort location.
    ///
    /// Prefers the provider's last-known fix and otherwise makes a single
    /// high-accuracy live request bounded by `policy.live_fix`. The live
    /// subscription is closed as soon as the first event arrives.
    pub async fn resolve(&self, policy: TimeoutPolicy) -> LocationOutcome {
        let coordinate = match self.acquire_fix(policy).await {
            Ok(c) => c,
            Err(reason) => {
                log::warn!("Location unavailable ({}): {reason}", self.provider.name());
                return LocationOutcome::Unavailable(reason);
            }
        };

        if !coordinate.is_valid() {
            let reason = format!("provider returned out-of-range coordinate {coordinate}");
            log::warn!("{reason}");
            return LocationOutcome::Unavailable(reason);
        }

        let address = self.lookup_address(coordinate).await;
        log::debug!("Resolved {coordinate} → {address}");

        LocationOutcome::Resolved(ResolvedLocation { coordinate, address })
    }

    async fn acquire_fix(&self, policy: TimeoutPolicy) -> Result<Coordinate, String> {
        match self.provider.last_known().await {
            Ok(Some(c)) => {
                log::debug!("Using last known fix from {}", self.provider.name());
                return Ok(c);
            }
            Ok(None) => log::debug!("No cached fix, requesting live update"),
            Err(LocationError::PermissionDenied) => {
                return Err(LocationError::PermissionDenied.to_string());
            }
            Err(e) => log::debug!("Last known fix failed: {e}; requesting live update"),
        }

        let mut updates = self
            .provider
            .request_updates(FixRequest::single_high_accuracy())
            .await
            .map_err(|e| e.to_string())?;

        let first = tokio::time::timeout(policy.live_fix, updates.recv()).await;

        // One update is all we take; closing stops any further deliveries.
        updates.close();
        drop(updates);

        match first {
            Ok(Some(FixEvent::Fix(c))) => Ok(c),
            Ok(Some(FixEvent::Unavailable)) => Err("provider reports no location".to_string()),
            Ok(None) => Err("provider closed the subscription without a fix".to_string()),
            Err(_) => Err(format!(
                "no live fix within {} ms",
                policy.live_fix.as_millis()
            )),
        }
    }

    async fn lookup_address(&self, coordinate: Coordinate) -> String {
        let Some(geocoder) = &self.geocoder else {
            return ADDRESS_NOT_AVAILABLE.to_string();
        };

        match geocoder.reverse(coordinate).await {
            Ok(Some(address)) if !address.trim().is_empty() => address,
            Ok(_) => {
                log::warn!("{} returned no address for {coordinate}", geocoder.name());
                ADDRESS_NOT_AVAILABLE.to_string()
            }
            Err(e) => {
                log::warn!("Reverse geocoding via {} failed: {e}", geocoder.name());
                ADDRESS_NOT_AVAILABLE.to_string()
            }
        }
    }
}
