use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use geotag_image::config::{AspectPolicy, Config, LateMapPolicy};
use geotag_image::error::PipelineError;
use geotag_image::exif::{self, TagSet, TagWriter, WriteResult};
use geotag_image::geo::{
    ADDRESS_NOT_AVAILABLE, Coordinate, FixedLocationProvider, GeoResolver, LocationProvider,
    ReverseGeocoder,
};
use geotag_image::map::{HttpTransport, MapThumbnailFetcher};
use geotag_image::pipeline::GeoTagPipeline;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;

const SF: (f64, f64) = (37.7749, -122.4194);
const ADDRESS: &str = "1 Market St, San Francisco, CA";

struct StubTransport {
    delay: Duration,
    calls: AtomicUsize,
}

impl StubTransport {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HttpTransport for StubTransport {
    async fn get_bytes(&self, _url: &str) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba([0, 200, 0, 255])))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
        Ok(out)
    }
}

struct StubGeocoder;

#[async_trait::async_trait]
impl ReverseGeocoder for StubGeocoder {
    fn name(&self) -> &str {
        "stub"
    }

    async fn reverse(&self, _coordinate: Coordinate) -> anyhow::Result<Option<String>> {
        Ok(Some(ADDRESS.to_string()))
    }
}

/// Tag writer that always fails, as a read-only or unsupported target would.
struct RejectingWriter;

impl TagWriter for RejectingWriter {
    fn write_tags(&self, path: &Path, _tags: &TagSet) -> anyhow::Result<WriteResult> {
        anyhow::bail!("cannot write metadata to {}", path.display())
    }
}

fn source_photo(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("source.jpg");
    image::RgbImage::from_pixel(1600, 1200, image::Rgb([120, 140, 160]))
        .save(&path)
        .unwrap();
    path
}

fn base_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.output.output_dir = Some(dir.path().join("out"));
    config.output.aspect = AspectPolicy::Fixed {
        width: 1280,
        height: 960,
    };
    config.map.api_key = Some("KEY".into());
    config.map.wait_ms = 2_000;
    config
}

fn build(
    config: Config,
    provider: Arc<dyn LocationProvider>,
    transport: Arc<StubTransport>,
) -> GeoTagPipeline {
    let resolver = GeoResolver::new(provider, Some(Arc::new(StubGeocoder)));
    let fetcher = Arc::new(MapThumbnailFetcher::new(
        "https://maps.example/static".into(),
        transport,
    ));
    GeoTagPipeline::new(config, resolver, fetcher)
}

fn sf_provider() -> Arc<dyn LocationProvider> {
    Arc::new(FixedLocationProvider::new(Coordinate::new(SF.0, SF.1)))
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn full_overlay_with_map() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let transport = StubTransport::new(Duration::ZERO);
    let pipeline = build(base_config(&dir), sf_provider(), transport.clone());

    let outcomes = pipeline.process(&src).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.rows.len(), 3, "{:?}", outcome.rows);
    assert_eq!(outcome.rows[0], ADDRESS);
    assert_eq!(outcome.rows[1], "Lat Lng : 37.7749, -122.4194");
    assert!(outcome.rows[2].contains('/'));
    assert!(outcome.map_drawn);
    assert!(outcome.metadata_written);
    assert_eq!(transport.calls(), 1);

    let output = outcome.output.as_ref().unwrap();
    let img = image::open(output).unwrap();
    assert_eq!((img.width(), img.height()), (1280, 960));

    let tags = exif::read_tags(output).unwrap();
    let coordinate = tags.coordinate().expect("GPS written");
    assert!((coordinate.latitude - SF.0).abs() < 1e-3);
    assert!((coordinate.longitude - SF.1).abs() < 1e-3);
    assert!(tags.model.unwrap_or_default().contains("Captured via"));
}

#[tokio::test]
async fn missing_api_key_composes_without_map() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let mut config = base_config(&dir);
    config.map.api_key = None;
    let transport = StubTransport::new(Duration::ZERO);
    let pipeline = build(config, sf_provider(), transport.clone());

    let outcomes = pipeline.process(&src).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];

    assert!(outcome.is_success());
    assert!(!outcome.map_drawn);
    assert_eq!(outcome.rows.len(), 3);
    assert_eq!(transport.calls(), 0);
    assert!(outcome.output.as_ref().unwrap().exists());
}

#[tokio::test]
async fn unavailable_location_uses_placeholder() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let transport = StubTransport::new(Duration::ZERO);
    let pipeline = build(
        base_config(&dir),
        Arc::new(FixedLocationProvider::unavailable()),
        transport.clone(),
    );

    let outcomes = pipeline.process(&src).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];

    assert!(outcome.is_success());
    assert!(outcome.location.is_none());
    assert_eq!(outcome.rows[0], ADDRESS_NOT_AVAILABLE);
    assert!(!outcome.rows.iter().any(|r| r.starts_with("Lat Lng")));
    assert!(!outcome.map_drawn);
    assert_eq!(transport.calls(), 0);
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| matches!(w, PipelineError::LocationUnavailable(_)))
    );

    let tags = exif::read_tags(outcome.output.as_ref().unwrap()).unwrap();
    assert!(tags.coordinate().is_none());
}

#[tokio::test]
async fn late_map_recomposes_same_output() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let mut config = base_config(&dir);
    config.map.wait_ms = 20;
    let transport = StubTransport::new(Duration::from_millis(400));
    let pipeline = build(config, sf_provider(), transport.clone());

    let outcomes = pipeline.process(&src).await.unwrap();
    assert_eq!(outcomes.len(), 2);

    let (first, second) = (&outcomes[0], &outcomes[1]);
    assert_eq!(first.revision, 1);
    assert!(!first.map_drawn);
    assert_eq!(second.revision, 2);
    assert!(second.map_drawn);
    assert_eq!(first.output, second.output);
    assert_eq!(first.rows, second.rows);
    assert_eq!(transport.calls(), 1);
    assert_eq!(files_in(&dir.path().join("out")), 1);
    assert!(!pipeline.is_busy());
}

#[tokio::test]
async fn late_map_discarded_when_configured() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let mut config = base_config(&dir);
    config.map.wait_ms = 20;
    config.map.late_map_policy = LateMapPolicy::Discard;
    let transport = StubTransport::new(Duration::from_millis(400));
    let pipeline = build(config, sf_provider(), transport);

    let outcomes = pipeline.process(&src).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].map_drawn);
}

#[tokio::test]
async fn metadata_failure_still_delivers_image() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let pipeline = build(base_config(&dir), sf_provider(), StubTransport::new(Duration::ZERO))
        .with_tag_writer(Arc::new(RejectingWriter));

    let outcomes = pipeline.process(&src).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert!(!outcome.metadata_written);
    assert!(outcome.map_drawn);
    assert_eq!(outcome.rows.len(), 3);
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| matches!(w, PipelineError::MetadataWriteFailure(_)))
    );
    assert!(outcome.warnings.iter().all(|w| !w.is_hard()));

    let output = outcome.output.as_ref().unwrap();
    assert!(output.exists());
    assert!(image::open(output).is_ok());
    assert!(exif::read_tags(output).unwrap().coordinate().is_none());
}

// ── Configuration toggles ────────────────────────────────────────────

#[tokio::test]
async fn author_and_app_lines_follow_toggles() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let mut config = base_config(&dir);
    config.render.show_author_name = true;
    config.render.author_name = "Jane".into();
    config.render.show_app_name = true;
    config.render.app_name = Some("Field Notes".into());
    config.render.show_date = false;
    let pipeline = build(config, sf_provider(), StubTransport::new(Duration::ZERO));

    let outcome = pipeline.process(&src).await.unwrap().remove(0);
    assert_eq!(
        outcome.rows,
        vec![
            ADDRESS.to_string(),
            "Lat Lng : 37.7749, -122.4194".to_string(),
            "Captured By: Jane".to_string(),
            "Field Notes".to_string(),
        ]
    );

    let tags = exif::read_tags(outcome.output.as_ref().unwrap()).unwrap();
    assert!(tags.model.unwrap_or_default().ends_with("Captured via Field Notes"));
}

#[tokio::test]
async fn png_output_keeps_png_encoding() {
    let dir = TempDir::new().unwrap();
    let src = source_photo(&dir);
    let mut config = base_config(&dir);
    config.output.extension = ".png".into();
    let pipeline = build(config, sf_provider(), StubTransport::new(Duration::ZERO));

    let outcome = pipeline.process(&src).await.unwrap().remove(0);
    let output = outcome.output.unwrap();
    assert_eq!(output.extension().and_then(|e| e.to_str()), Some("png"));
    let bytes = std::fs::read(&output).unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
}
