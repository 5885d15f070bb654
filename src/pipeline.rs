use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::config::{AspectPolicy, Config, LateMapPolicy, OutputConfig};
use crate::error::PipelineError;
use crate::exif::{self, ExifTagWriter, TagSet, TagWriter};
use crate::geo::{
    GeoResolver, LocationOutcome, LocationProvider, NominatimGeocoder, ResolvedLocation,
    ReverseGeocoder, TimeoutPolicy,
};
use crate::map::{MapOutcome, MapRequest, MapThumbnailFetcher};
use crate::render::{self, Orientation, OverlayComposer, OverlayLines};

/// Supported input image extensions.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Image container format, used both to pick input files and to select the
/// output encoder.
///
/// # Example
///
/// ```rust
/// use geotag_image::pipeline::ImageKind;
/// use std::path::Path;
///
/// assert_eq!(ImageKind::from_path(Path::new("photo.JPG")), Some(ImageKind::Jpeg));
/// assert_eq!(ImageKind::from_extension(".png"), Some(ImageKind::Png));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageKind {
    Jpeg,
    Png,
    WebP,
}

impl ImageKind {
    /// Determine the image kind from a file path extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        Self::from_extension(path.extension()?.to_str()?)
    }

    /// Accepts the extension with or without the leading dot.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => ".jpg",
            Self::Png => ".png",
            Self::WebP => ".webp",
        }
    }
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LocationPending,
    MapPending,
    MapSkipped,
    Composing,
    PersistingMetadata,
    Done,
    Failed(String),
}

/// The immutable record of one capture, threaded through every stage.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub source: PathBuf,
    pub output: PathBuf,
    pub output_kind: ImageKind,
    pub captured_at: DateTime<FixedOffset>,
    pub location: Option<ResolvedLocation>,
}

/// What the completion callback receives.
///
/// A run normally delivers one outcome. When the map thumbnail arrives after
/// a mapless composite was written and the late-map policy is
/// [`LateMapPolicy::Recompose`], a second outcome with `revision == 2`
/// follows; it overwrites the same `output` path and supersedes the first.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub source: PathBuf,
    /// `None` when the run failed.
    pub output: Option<PathBuf>,
    pub revision: u32,
    pub location: Option<ResolvedLocation>,
    /// Rendered text rows after wrapping.
    pub rows: Vec<String>,
    pub map_drawn: bool,
    pub metadata_written: bool,
    /// Soft failures absorbed during the run.
    pub warnings: Vec<PipelineError>,
    /// Hard failure that aborted the run.
    pub error: Option<PipelineError>,
}

impl RunOutcome {
    fn failed(source: PathBuf, error: PipelineError) -> Self {
        Self {
            source,
            output: None,
            revision: 1,
            location: None,
            rows: Vec::new(),
            map_drawn: false,
            metadata_written: false,
            warnings: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Completion callback. Invoked from a background task.
pub type CompletionCallback = Arc<dyn Fn(&RunOutcome) + Send + Sync>;

/// Permission check performed before a capture starts. A denial is reported
/// to the caller and no run is started.
#[async_trait::async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check(&self) -> std::result::Result<(), String>;
}

/// Grants every request.
pub struct AllowAll;

#[async_trait::async_trait]
impl PermissionGate for AllowAll {
    async fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Handle to an in-flight run.
pub struct RunHandle {
    task: JoinHandle<()>,
    state: watch::Receiver<RunState>,
    cancelled: Arc<AtomicBool>,
}

impl RunHandle {
    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Abort the run and its map fetch. No callback fires afterwards.
    ///
    /// Blocking work already handed to the thread pool notices the flag
    /// before writing and removes a first-revision output it already wrote.
    /// The pipeline stays busy until that work has returned.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.task.abort();
    }

    /// Wait for the run to finish, late-map recomposition included.
    pub async fn join(self) -> std::result::Result<RunState, PipelineError> {
        match self.task.await {
            Ok(()) => Ok(self.state.borrow().clone()),
            Err(e) if e.is_cancelled() => Err(PipelineError::Cancelled),
            Err(e) => Ok(RunState::Failed(format!("run panicked: {e}"))),
        }
    }
}

/// Turns a captured photo into an annotated, geotagged image.
///
/// One run at a time: a second [`capture`](Self::capture) while a run is in
/// flight is rejected with [`PipelineError::RunInFlight`].
///
/// # Example
///
/// ```rust,no_run
/// use geotag_image::config::Config;
/// use geotag_image::geo::FixedLocationProvider;
/// use geotag_image::geo::Coordinate;
/// use geotag_image::pipeline::GeoTagPipeline;
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let provider = Arc::new(FixedLocationProvider::new(Coordinate::new(37.7749, -122.4194)));
/// let pipeline = GeoTagPipeline::from_config(Config::default(), provider);
///
/// for outcome in pipeline.process("photo.jpg").await? {
///     println!("{:?} (revision {})", outcome.output, outcome.revision);
/// }
/// # Ok(())
/// # }
/// ```
pub struct GeoTagPipeline {
    config: Arc<Config>,
    resolver: GeoResolver,
    fetcher: Arc<MapThumbnailFetcher>,
    composer: Arc<OverlayComposer>,
    tag_writer: Arc<dyn TagWriter>,
    permissions: Arc<dyn PermissionGate>,
    busy: Arc<AtomicBool>,
}

impl GeoTagPipeline {
    pub fn new(config: Config, resolver: GeoResolver, fetcher: Arc<MapThumbnailFetcher>) -> Self {
        let composer = Arc::new(OverlayComposer::from_config(&config));
        Self {
            config: Arc::new(config),
            resolver,
            fetcher,
            composer,
            tag_writer: Arc::new(ExifTagWriter),
            permissions: Arc::new(AllowAll),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pipeline with the Nominatim geocoder (if enabled) and the reqwest map
    /// fetcher from `config`.
    pub fn from_config(config: Config, provider: Arc<dyn LocationProvider>) -> Self {
        let geocoder = config.location.reverse_geocode.then(|| {
            Arc::new(NominatimGeocoder::new(
                config.location.geocoder_url.clone(),
                config.location.user_agent.clone(),
            )) as Arc<dyn ReverseGeocoder>
        });
        let resolver = GeoResolver::new(provider, geocoder);
        let fetcher = Arc::new(MapThumbnailFetcher::from_config(&config.map));
        Self::new(config, resolver, fetcher)
    }

    pub fn with_permission_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.permissions = gate;
        self
    }

    /// Replace the composer built from the config (custom text renderer).
    pub fn with_composer(mut self, composer: OverlayComposer) -> Self {
        self.composer = Arc::new(composer);
        self
    }

    pub fn with_tag_writer(mut self, writer: Arc<dyn TagWriter>) -> Self {
        self.tag_writer = writer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start a run for `source` on a background task.
    ///
    /// Returns immediately. `on_complete` is called once per delivered
    /// outcome (twice when a late map is recomposed). A failed run calls it
    /// once with `output == None` and `error` set.
    pub async fn capture(
        &self,
        source: impl Into<PathBuf>,
        on_complete: CompletionCallback,
    ) -> std::result::Result<RunHandle, PipelineError> {
        let guard = BusyGuard::acquire(&self.busy).ok_or(PipelineError::RunInFlight)?;
        self.permissions
            .check()
            .await
            .map_err(PipelineError::PermissionDenied)?;

        let source = source.into();
        log::info!("Capture started: {}", source.display());

        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let cancelled = Arc::new(AtomicBool::new(false));
        let ctx = RunContext {
            config: Arc::clone(&self.config),
            resolver: self.resolver.clone(),
            fetcher: Arc::clone(&self.fetcher),
            composer: Arc::clone(&self.composer),
            tag_writer: Arc::clone(&self.tag_writer),
            state: state_tx,
            token: RunToken {
                cancelled: Arc::clone(&cancelled),
                _busy: Arc::new(guard),
            },
        };

        let task = tokio::spawn(ctx.drive(source, on_complete));

        Ok(RunHandle {
            task,
            state: state_rx,
            cancelled,
        })
    }

    /// Run `source` to completion and return every delivered outcome, in
    /// order. The last one is final.
    pub async fn process(
        &self,
        source: impl Into<PathBuf>,
    ) -> std::result::Result<Vec<RunOutcome>, PipelineError> {
        let collected: Arc<Mutex<Vec<RunOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let handle = self
            .capture(
                source,
                Arc::new(move |outcome: &RunOutcome| {
                    if let Ok(mut outcomes) = sink.lock() {
                        outcomes.push(outcome.clone());
                    }
                }),
            )
            .await?;
        handle.join().await?;

        let outcomes = collected
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default();
        Ok(outcomes)
    }
}

/// Clears the pipeline's busy flag when the run's task ends or is aborted.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Shared by a run's task and every blocking job it spawns. The busy flag
/// clears only once the last clone is gone.
#[derive(Clone)]
struct RunToken {
    cancelled: Arc<AtomicBool>,
    _busy: Arc<BusyGuard>,
}

impl RunToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Removes a cancelled run's output when the stage that writes it is
/// dropped, including when the run's task is aborted mid-stage.
struct OutputCleanup<'a> {
    path: &'a Path,
    revision: u32,
    token: &'a RunToken,
}

impl Drop for OutputCleanup<'_> {
    fn drop(&mut self) {
        if self.token.is_cancelled() {
            discard_output(self.path, self.revision);
        }
    }
}

/// Map fetch task that is aborted when dropped.
struct MapTask(JoinHandle<MapOutcome>);

impl Drop for MapTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct FirstPass {
    run: Arc<PipelineRun>,
    photo: Arc<RgbaImage>,
    outcome: RunOutcome,
    late_map: Option<MapTask>,
}

/// Everything one run needs, owned by its task.
struct RunContext {
    config: Arc<Config>,
    resolver: GeoResolver,
    fetcher: Arc<MapThumbnailFetcher>,
    composer: Arc<OverlayComposer>,
    tag_writer: Arc<dyn TagWriter>,
    state: watch::Sender<RunState>,
    token: RunToken,
}

impl RunContext {
    fn set(&self, state: RunState) {
        log::debug!("Run state: {state:?}");
        self.state.send_replace(state);
    }

    async fn drive(self, source: PathBuf, on_complete: CompletionCallback) {
        let captured_at = Local::now().fixed_offset();

        let FirstPass {
            run,
            photo,
            outcome,
            late_map,
        } = match self.first_pass(source.clone(), captured_at).await {
            Ok(first) => first,
            Err(PipelineError::Cancelled) => {
                log::info!("Run for {} cancelled", source.display());
                return;
            }
            Err(e) => {
                log::error!("Run for {} failed: {e}", source.display());
                self.set(RunState::Failed(e.to_string()));
                on_complete(&RunOutcome::failed(source, e));
                return;
            }
        };

        if self.token.is_cancelled() {
            discard_output(&run.output, outcome.revision);
            return;
        }
        self.set(RunState::Done);
        log::info!("Wrote {}", run.output.display());
        on_complete(&outcome);

        let Some(late_map) = late_map else {
            return;
        };
        match self.config.map.late_map_policy {
            LateMapPolicy::Discard => {
                log::info!("Map not ready in time; keeping the mapless composite");
                drop(late_map);
            }
            LateMapPolicy::Recompose => {
                let revision = outcome.revision + 1;
                if let Some(outcome) = self.recompose_late(&run, &photo, late_map, revision).await {
                    if self.token.is_cancelled() {
                        return;
                    }
                    self.set(RunState::Done);
                    on_complete(&outcome);
                }
            }
        }
    }

    async fn first_pass(
        &self,
        source: PathBuf,
        captured_at: DateTime<FixedOffset>,
    ) -> std::result::Result<FirstPass, PipelineError> {
        let config = &self.config;
        let (output_kind, output) = prepare_output(&source, &config.output, &captured_at)?;

        // Decode while the location resolves.
        let aspect = config.output.aspect;
        let src = source.clone();
        let token = self.token.clone();
        let photo_task = tokio::task::spawn_blocking(move || {
            let _token = token;
            prepare_photo(&src, aspect)
        });

        let mut warnings = Vec::new();
        let location = if config.render.enabled {
            self.set(RunState::LocationPending);
            let policy = TimeoutPolicy {
                live_fix: Duration::from_millis(config.location.fix_timeout_ms),
            };
            match self.resolver.resolve(policy).await {
                LocationOutcome::Resolved(loc) => Some(loc),
                LocationOutcome::Unavailable(reason) => {
                    warnings.push(PipelineError::LocationUnavailable(reason));
                    None
                }
            }
        } else {
            None
        };

        let map_task = match location.as_ref().and_then(|loc| self.map_request(loc)) {
            Some(request) => {
                self.set(RunState::MapPending);
                Some(MapTask(self.fetcher.spawn_fetch(request)))
            }
            None => {
                self.set(RunState::MapSkipped);
                None
            }
        };

        let photo = photo_task
            .await
            .map_err(|e| PipelineError::SourceImageUnreadable {
                path: source.clone(),
                reason: e.to_string(),
            })??;
        let photo = Arc::new(photo);

        let (map, late_map) = match map_task {
            Some(task) => self.await_map(task, &mut warnings).await,
            None => (None, None),
        };

        let run = Arc::new(PipelineRun {
            source,
            output,
            output_kind,
            captured_at,
            location,
        });
        let outcome = self.render(&run, &photo, map, 1, warnings).await?;

        Ok(FirstPass {
            run,
            photo,
            outcome,
            late_map,
        })
    }

    fn map_request(&self, location: &ResolvedLocation) -> Option<MapRequest> {
        if !self.config.map_requested() {
            return None;
        }
        MapRequest::from_config(location.coordinate, &self.config.map)
    }

    /// Wait up to `map.wait_ms`. A map still in flight is handed back.
    async fn await_map(
        &self,
        mut task: MapTask,
        warnings: &mut Vec<PipelineError>,
    ) -> (Option<RgbaImage>, Option<MapTask>) {
        let wait = Duration::from_millis(self.config.map.wait_ms);
        match tokio::time::timeout(wait, &mut task.0).await {
            Ok(Ok(MapOutcome::Fetched(img))) => (Some(img), None),
            Ok(Ok(MapOutcome::Failure(reason))) => {
                warnings.push(PipelineError::NetworkFetchFailure(reason));
                (None, None)
            }
            Ok(Err(e)) => {
                warnings.push(PipelineError::NetworkFetchFailure(e.to_string()));
                (None, None)
            }
            Err(_) => {
                log::info!("Map not ready after {} ms, composing without it", wait.as_millis());
                (None, Some(task))
            }
        }
    }

    async fn recompose_late(
        &self,
        run: &Arc<PipelineRun>,
        photo: &Arc<RgbaImage>,
        mut task: MapTask,
        revision: u32,
    ) -> Option<RunOutcome> {
        let map = match (&mut task.0).await {
            Ok(MapOutcome::Fetched(img)) => img,
            Ok(MapOutcome::Failure(reason)) => {
                log::warn!("Late map fetch failed: {reason}");
                return None;
            }
            Err(e) => {
                log::warn!("Late map task failed: {e}");
                return None;
            }
        };

        log::info!("Map arrived late, recomposing {}", run.output.display());
        match self.render(run, photo, Some(map), revision, Vec::new()).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("Recomposition of {} failed: {e}", run.output.display());
                None
            }
        }
    }

    /// Composing → PersistingMetadata. Writes `run.output`, overwriting it
    /// on a later revision.
    async fn render(
        &self,
        run: &Arc<PipelineRun>,
        photo: &Arc<RgbaImage>,
        map: Option<RgbaImage>,
        revision: u32,
        mut warnings: Vec<PipelineError>,
    ) -> std::result::Result<RunOutcome, PipelineError> {
        self.set(RunState::Composing);
        let _cleanup = OutputCleanup {
            path: &run.output,
            revision,
            token: &self.token,
        };
        let (rows, map_drawn) = {
            let run = Arc::clone(run);
            let photo = Arc::clone(photo);
            let config = Arc::clone(&self.config);
            let composer = Arc::clone(&self.composer);
            let token = self.token.clone();
            let output = run.output.clone();
            tokio::task::spawn_blocking(move || {
                compose_and_save(&run, &photo, map.as_ref(), &config, &composer, &token, revision)
            })
            .await
            .map_err(|e| PipelineError::StorageUnavailable {
                path: output,
                reason: e.to_string(),
            })??
        };

        let mut metadata_written = false;
        if self.config.render.enabled && self.config.metadata.enabled {
            self.set(RunState::PersistingMetadata);
            let tags = TagSet::from_config(
                run.location.as_ref().map(|loc| loc.coordinate),
                run.captured_at.naive_local(),
                &self.config.metadata,
                self.config.render.app_name.as_deref(),
            );
            let path = run.output.clone();
            let writer = Arc::clone(&self.tag_writer);
            let token = self.token.clone();
            let written = tokio::task::spawn_blocking(move || {
                if token.is_cancelled() {
                    discard_output(&path, revision);
                    return None;
                }
                let result = writer.write_tags(&path, &tags);
                if token.is_cancelled() {
                    discard_output(&path, revision);
                    return None;
                }
                Some(result)
            })
            .await;
            match written {
                Ok(None) => return Err(PipelineError::Cancelled),
                Ok(Some(Ok(_))) => metadata_written = true,
                Ok(Some(Err(e))) => {
                    log::warn!("Metadata write failed for {}: {e:#}", run.output.display());
                    warnings.push(PipelineError::MetadataWriteFailure(format!("{e:#}")));
                }
                Err(e) => {
                    log::warn!("Metadata task failed: {e}");
                    warnings.push(PipelineError::MetadataWriteFailure(e.to_string()));
                }
            }
        }

        Ok(RunOutcome {
            source: run.source.clone(),
            output: Some(run.output.clone()),
            revision,
            location: run.location.clone(),
            rows,
            map_drawn,
            metadata_written,
            warnings,
            error: None,
        })
    }
}

/// Decode, orient and scale the source photo.
fn prepare_photo(
    path: &Path,
    aspect: AspectPolicy,
) -> std::result::Result<RgbaImage, PipelineError> {
    let img = image::open(path).map_err(|e| PipelineError::SourceImageUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let orientation = Orientation::from_exif(exif::read_orientation(path));
    let upright = render::normalize(&img, orientation);
    Ok(render::scale(&upright, aspect).to_rgba8())
}

/// Draw the overlay (when enabled) and write the encoded image.
///
/// A panic while composing degrades to saving the plain scaled photo.
/// Nothing is written once the run is cancelled.
fn compose_and_save(
    run: &PipelineRun,
    photo: &RgbaImage,
    map: Option<&RgbaImage>,
    config: &Config,
    composer: &OverlayComposer,
    token: &RunToken,
    revision: u32,
) -> std::result::Result<(Vec<String>, bool), PipelineError> {
    let (image, rows, map_drawn) = if config.render.enabled {
        let lines = OverlayLines::build(run.location.as_ref(), &run.captured_at, &config.render);
        let composed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            composer.compose(photo, map, &lines, &config.render)
        }));
        match composed {
            Ok(c) => {
                let drawn = c.geometry.map.is_some();
                (c.image, c.geometry.rows, drawn)
            }
            Err(_) => {
                log::error!("Overlay composition panicked; saving without overlay");
                (photo.clone(), Vec::new(), false)
            }
        }
    } else {
        (photo.clone(), Vec::new(), false)
    };

    let bytes = encode_image(image, run.output_kind, config.output.jpeg_quality).map_err(|e| {
        PipelineError::StorageUnavailable {
            path: run.output.clone(),
            reason: format!("{e:#}"),
        }
    })?;
    if token.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    std::fs::write(&run.output, bytes).map_err(|e| PipelineError::StorageUnavailable {
        path: run.output.clone(),
        reason: e.to_string(),
    })?;
    if token.is_cancelled() {
        discard_output(&run.output, revision);
        return Err(PipelineError::Cancelled);
    }
    Ok((rows, map_drawn))
}

/// Remove the output of a cancelled run. A later revision leaves the file
/// alone: the first one was already delivered.
fn discard_output(path: &Path, revision: u32) {
    if revision > 1 {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => log::info!("Removed output of cancelled run: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove {}: {e}", path.display()),
    }
}

/// Encode with the format implied by the output extension.
pub fn encode_image(image: RgbaImage, kind: ImageKind, jpeg_quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let image = DynamicImage::ImageRgba8(image);
    match kind {
        ImageKind::Jpeg => {
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, jpeg_quality.clamp(1, 100))
                .encode_image(&rgb)
                .context("Failed to encode JPEG")?;
        }
        ImageKind::Png => image
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .context("Failed to encode PNG")?,
        ImageKind::WebP => image
            .write_to(&mut Cursor::new(&mut out), ImageFormat::WebP)
            .context("Failed to encode WebP")?,
    }
    Ok(out)
}

/// Resolve the output format and a fresh output path, creating the
/// directory if needed.
fn prepare_output(
    source: &Path,
    output: &OutputConfig,
    captured_at: &DateTime<FixedOffset>,
) -> std::result::Result<(ImageKind, PathBuf), PipelineError> {
    let kind = ImageKind::from_extension(&output.extension).unwrap_or_else(|| {
        log::warn!("Unsupported output extension '{}', writing JPEG", output.extension);
        ImageKind::Jpeg
    });

    let dir = output_dir(source, output);
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::StorageUnavailable {
        path: dir.clone(),
        reason: e.to_string(),
    })?;

    Ok((kind, output_path_for(&dir, output, kind, captured_at)))
}

fn output_dir(source: &Path, output: &OutputConfig) -> PathBuf {
    output
        .output_dir
        .clone()
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_default()
}

/// `{prefix}{yyyyMMdd_HHmmss}{ext}` in `dir`, with a `_N` suffix when that
/// name is taken.
pub fn output_path_for(
    dir: &Path,
    output: &OutputConfig,
    kind: ImageKind,
    captured_at: &DateTime<FixedOffset>,
) -> PathBuf {
    let ext = match ImageKind::from_extension(&output.extension) {
        Some(k) if k == kind => format!(".{}", output.extension.trim_start_matches('.')),
        _ => kind.extension().to_string(),
    };
    let stem = format!("{}{}", output.file_prefix, captured_at.format("%Y%m%d_%H%M%S"));

    let mut candidate = dir.join(format!("{stem}{ext}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{n}{ext}"));
        n += 1;
    }
    candidate
}

/// Collect supported image files from the given paths.
///
/// Accepts a mix of file paths and directory paths. Directories are walked
/// recursively (following symlinks). Only files with supported image
/// extensions are included.
///
/// # Example
///
/// ```rust,no_run
/// use geotag_image::pipeline::collect_images;
/// use std::path::PathBuf;
///
/// let images = collect_images(&[
///     PathBuf::from("photo.jpg"),       // single file
///     PathBuf::from("./photos/"),        // entire directory
/// ]);
/// println!("Found {} images", images.len());
/// ```
pub fn collect_images(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for path in paths {
        if path.is_file() {
            if is_supported_image(path) {
                images.push(path.clone());
            } else {
                log::warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let p = entry.path();
                if p.is_file() && is_supported_image(p) {
                    images.push(p.to_path_buf());
                }
            }
        } else {
            log::warn!("Path does not exist: {}", path.display());
        }
    }

    images
}

/// Check if a file has a supported image extension.
fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{Coordinate, FixedLocationProvider};
    use crate::map::HttpTransport;
    use crate::render::TextRenderer;
    use chrono::TimeZone;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct SlowTransport {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HttpTransport for SlowTransport {
        async fn get_bytes(&self, _url: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut out = Vec::new();
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, image::Rgba([0, 255, 0, 255])))
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
            Ok(out)
        }
    }

    /// Renderer that blocks on every draw call, keeping a run in `Composing`.
    struct SlowFont;

    impl TextRenderer for SlowFont {
        fn measure(&self, text: &str) -> u32 {
            text.chars().count() as u32 * 8
        }

        fn line_height(&self) -> u32 {
            10
        }

        fn draw(&self, _canvas: &mut RgbaImage, _x: i32, _y: i32, _text: &str, _color: image::Rgba<u8>) {
            std::thread::sleep(Duration::from_millis(150));
        }
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    struct Deny;

    #[async_trait::async_trait]
    impl PermissionGate for Deny {
        async fn check(&self) -> std::result::Result<(), String> {
            Err("camera".into())
        }
    }

    fn at() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap()
    }

    fn source_jpeg(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("source.jpg");
        image::RgbImage::from_pixel(400, 300, image::Rgb([90, 120, 200]))
            .save(&path)
            .unwrap();
        path
    }

    fn pipeline(dir: &TempDir, transport_delay: Duration) -> (GeoTagPipeline, Arc<SlowTransport>) {
        let mut config = Config::default();
        config.output.output_dir = Some(dir.path().join("out"));
        config.output.aspect = AspectPolicy::Fixed { width: 480, height: 640 };
        config.map.api_key = Some("KEY".into());
        config.map.wait_ms = 2_000;

        let transport = Arc::new(SlowTransport {
            delay: transport_delay,
            calls: AtomicUsize::new(0),
        });
        let provider = Arc::new(FixedLocationProvider::new(Coordinate::new(37.7749, -122.4194)));
        let resolver = GeoResolver::new(provider, None);
        let fetcher = Arc::new(MapThumbnailFetcher::new(
            "https://maps.example/s".into(),
            transport.clone(),
        ));
        (GeoTagPipeline::new(config, resolver, fetcher), transport)
    }

    // ── ImageKind ────────────────────────────────────────────────────

    #[test]
    fn image_kind_from_path() {
        assert_eq!(ImageKind::from_path(Path::new("photo.jpg")), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::from_path(Path::new("photo.jpeg")), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::from_path(Path::new("PHOTO.JPG")), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::from_path(Path::new("image.png")), Some(ImageKind::Png));
        assert_eq!(ImageKind::from_path(Path::new("image.webp")), Some(ImageKind::WebP));
        assert_eq!(ImageKind::from_path(Path::new("doc.pdf")), None);
        assert_eq!(ImageKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn image_kind_from_extension() {
        assert_eq!(ImageKind::from_extension(".PNG"), Some(ImageKind::Png));
        assert_eq!(ImageKind::from_extension("jpeg"), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::from_extension(".heic"), None);
    }

    // ── output naming ────────────────────────────────────────────────

    #[test]
    fn output_name_uses_prefix_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let output = OutputConfig::default();
        let path = output_path_for(dir.path(), &output, ImageKind::Jpeg, &at());
        assert_eq!(path, dir.path().join("IMG_20240309_140507.jpg"));
    }

    #[test]
    fn output_name_avoids_collisions() {
        let dir = TempDir::new().unwrap();
        let output = OutputConfig::default();
        fs::write(dir.path().join("IMG_20240309_140507.jpg"), b"x").unwrap();
        let path = output_path_for(dir.path(), &output, ImageKind::Jpeg, &at());
        assert_eq!(path, dir.path().join("IMG_20240309_140507_1.jpg"));
    }

    #[test]
    fn unknown_extension_falls_back_to_jpeg() {
        let dir = TempDir::new().unwrap();
        let output = OutputConfig {
            extension: ".heic".into(),
            output_dir: Some(dir.path().to_path_buf()),
            ..OutputConfig::default()
        };
        let (kind, path) = prepare_output(Path::new("a.jpg"), &output, &at()).unwrap();
        assert_eq!(kind, ImageKind::Jpeg);
        assert_eq!(path.extension().unwrap(), "jpg");
    }

    #[test]
    fn output_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let output = OutputConfig {
            output_dir: Some(nested.clone()),
            ..OutputConfig::default()
        };
        prepare_output(Path::new("x.jpg"), &output, &at()).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn uncreatable_output_dir_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let output = OutputConfig {
            output_dir: Some(blocker.join("sub")),
            ..OutputConfig::default()
        };
        let err = prepare_output(Path::new("x.jpg"), &output, &at()).unwrap_err();
        assert!(matches!(err, PipelineError::StorageUnavailable { .. }));
    }

    // ── encode_image ─────────────────────────────────────────────────

    #[test]
    fn encode_follows_kind() {
        let img = RgbaImage::from_pixel(4, 4, image::Rgba([1, 2, 3, 255]));
        let jpg = encode_image(img.clone(), ImageKind::Jpeg, 80).unwrap();
        let png = encode_image(img, ImageKind::Png, 80).unwrap();
        assert_eq!(image::guess_format(&jpg).unwrap(), ImageFormat::Jpeg);
        assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);
    }

    // ── capture ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn capture_writes_scaled_output_with_map() {
        let dir = TempDir::new().unwrap();
        let (pipeline, transport) = pipeline(&dir, Duration::ZERO);
        let outcomes = pipeline.process(source_jpeg(&dir)).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        let out = &outcomes[0];
        assert!(out.is_success(), "{:?}", out.error);
        assert!(out.map_drawn);
        assert!(out.metadata_written);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let written = image::open(out.output.as_ref().unwrap()).unwrap();
        assert_eq!((written.width(), written.height()), (480, 640));
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn missing_source_fails_hard() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir, Duration::ZERO);
        let outcomes = pipeline.process(dir.path().join("gone.jpg")).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].output.is_none());
        assert!(matches!(
            outcomes[0].error,
            Some(PipelineError::SourceImageUnreadable { .. })
        ));
        let written: Vec<_> = fs::read_dir(dir.path().join("out")).unwrap().collect();
        assert!(written.is_empty(), "no output for a failed run");
    }

    #[tokio::test]
    async fn second_capture_while_busy_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir, Duration::from_millis(300));
        let source = source_jpeg(&dir);

        let handle = pipeline.capture(&source, Arc::new(|_: &RunOutcome| {})).await.unwrap();
        let second = pipeline.capture(&source, Arc::new(|_: &RunOutcome| {})).await;
        assert!(matches!(second, Err(PipelineError::RunInFlight)));

        assert_eq!(handle.join().await.unwrap(), RunState::Done);
        assert!(pipeline.capture(&source, Arc::new(|_: &RunOutcome| {})).await.is_ok());
    }

    #[tokio::test]
    async fn permission_denied_does_not_start() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir, Duration::ZERO);
        let pipeline = pipeline.with_permission_gate(Arc::new(Deny));

        let result = pipeline.capture(source_jpeg(&dir), Arc::new(|_: &RunOutcome| {})).await;
        assert!(matches!(result, Err(PipelineError::PermissionDenied(_))));
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn cancel_suppresses_callback_and_frees_pipeline() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handle = pipeline
            .capture(
                source_jpeg(&dir),
                Arc::new(move |_: &RunOutcome| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        assert!(matches!(handle.join().await, Err(PipelineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn cancel_while_composing_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir, Duration::ZERO);
        let pipeline = pipeline.with_composer(OverlayComposer::new(Box::new(SlowFont), 140, 150));
        let source = source_jpeg(&dir);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handle = pipeline
            .capture(
                &source,
                Arc::new(move |_: &RunOutcome| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        wait_until("Composing", || handle.state() == RunState::Composing).await;
        handle.cancel();

        // The blocking compose is still running: the pipeline must not
        // accept a run that could pick the same output name.
        let again = pipeline.capture(&source, Arc::new(|_: &RunOutcome| {})).await;
        assert!(matches!(again, Err(PipelineError::RunInFlight)));

        assert!(matches!(handle.join().await, Err(PipelineError::Cancelled)));
        wait_until("idle pipeline", || !pipeline.is_busy()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let written: Vec<_> = fs::read_dir(dir.path().join("out")).unwrap().collect();
        assert!(written.is_empty(), "cancelled run left {written:?}");
    }

    #[test]
    fn cancelled_output_removal_spares_later_revisions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_1.jpg");
        fs::write(&path, b"x").unwrap();

        discard_output(&path, 2);
        assert!(path.exists(), "a later revision keeps the delivered file");
        discard_output(&path, 1);
        assert!(!path.exists());
        // Already gone is fine.
        discard_output(&path, 1);
    }

    #[tokio::test]
    async fn disabled_overlay_only_scales() {
        let dir = TempDir::new().unwrap();
        let (pipeline, transport) = pipeline(&dir, Duration::ZERO);
        let mut config = pipeline.config().clone();
        config.render.enabled = false;
        let resolver = GeoResolver::new(Arc::new(FixedLocationProvider::unavailable()), None);
        let fetcher = Arc::new(MapThumbnailFetcher::new("https://m/s".into(), transport.clone()));
        let pipeline = GeoTagPipeline::new(config, resolver, fetcher);

        let outcomes = pipeline.process(source_jpeg(&dir)).await.unwrap();
        let out = &outcomes[0];
        assert!(out.is_success());
        assert!(out.rows.is_empty());
        assert!(!out.metadata_written);
        assert!(out.warnings.is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    // ── collect_images ───────────────────────────────────────────────

    #[test]
    fn supported_image_extensions() {
        assert!(is_supported_image(Path::new("photo.jpg")));
        assert!(is_supported_image(Path::new("photo.JPEG")));
        assert!(is_supported_image(Path::new("photo.png")));
        assert!(is_supported_image(Path::new("photo.webp")));
        assert!(!is_supported_image(Path::new("photo.heic")));
        assert!(!is_supported_image(Path::new("readme.txt")));
        assert!(!is_supported_image(Path::new("noext")));
    }

    #[test]
    fn collect_images_directory_recursive() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        fs::write(dir.path().join("a.jpg"), b"fake").unwrap();
        fs::write(sub.join("b.png"), b"fake").unwrap();
        fs::write(sub.join("c.txt"), b"fake").unwrap();

        let images = collect_images(&[dir.path().to_path_buf()]);
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn collect_images_skips_unsupported_and_missing() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("readme.txt");
        fs::write(&txt, b"hello").unwrap();

        let images = collect_images(&[txt, PathBuf::from("/nonexistent/path")]);
        assert!(images.is_empty());
    }

    #[test]
    fn collect_images_mixed_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        let jpg = dir.path().join("photo.jpg");
        let sub = dir.path().join("folder");
        fs::create_dir(&sub).unwrap();
        fs::write(&jpg, b"fake").unwrap();
        fs::write(sub.join("deep.webp"), b"fake").unwrap();

        let images = collect_images(&[jpg.clone(), sub]);
        assert_eq!(images.len(), 2);
    }
}
