use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use super::{Coordinate, FixEvent, FixRequest, LocationError, LocationProvider};
use crate::exif;

/// A provider that always answers with the same coordinate (or none).
///
/// Used by the CLI for `--lat/--lng` and handy in tests.
#[derive(Debug, Clone)]
pub struct FixedLocationProvider {
    coordinate: Option<Coordinate>,
}

impl FixedLocationProvider {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate: Some(coordinate),
        }
    }

    /// A provider that never has a fix.
    pub fn unavailable() -> Self {
        Self { coordinate: None }
    }
}

#[async_trait::async_trait]
impl LocationProvider for FixedLocationProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn last_known(&self) -> Result<Option<Coordinate>, LocationError> {
        Ok(self.coordinate)
    }

    async fn request_updates(
        &self,
        _request: FixRequest,
    ) -> Result<mpsc::Receiver<FixEvent>, LocationError> {
        let (tx, rx) = mpsc::channel(1);
        let event = match self.coordinate {
            Some(c) => FixEvent::Fix(c),
            None => FixEvent::Unavailable,
        };
        // Capacity 1 and a fresh channel: this cannot be full.
        let _ = tx.try_send(event);
        Ok(rx)
    }
}

/// Treats GPS coordinates already embedded in a photo as the last-known fix.
#[derive(Debug, Clone)]
pub struct ExifGpsProvider {
    path: PathBuf,
}

impl ExifGpsProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl LocationProvider for ExifGpsProvider {
    fn name(&self) -> &str {
        "exif-gps"
    }

    async fn last_known(&self) -> Result<Option<Coordinate>, LocationError> {
        let path = self.path.clone();
        let tags = tokio::task::spawn_blocking(move || exif::read_tags(&path))
            .await
            .map_err(|e| LocationError::Provider(e.to_string()))?
            .map_err(|e| LocationError::Provider(format!("{e:#}")))?;
        Ok(tags.coordinate())
    }

    async fn request_updates(
        &self,
        _request: FixRequest,
    ) -> Result<mpsc::Receiver<FixEvent>, LocationError> {
        // A file has no live updates.
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(FixEvent::Unavailable);
        Ok(rx)
    }
}
