use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use geotag_image::config::{AspectPolicy, Config};
use geotag_image::geo::{Coordinate, ExifGpsProvider, FixedLocationProvider, LocationProvider};
use geotag_image::pipeline::{self, GeoTagPipeline, RunOutcome};
use geotag_image::exif;

#[derive(Parser, Debug)]
#[command(
    name = "geotag-cli",
    version,
    about = "Stamp photos with a location overlay (address, coordinates, date, map thumbnail) and matching EXIF tags"
)]
struct Cli {
    /// Image files or directories to process
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Latitude to use instead of the photo's own GPS tags
    #[arg(long, requires = "lng", allow_hyphen_values = true)]
    lat: Option<f64>,

    /// Longitude to use instead of the photo's own GPS tags
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lng: Option<f64>,

    /// Output size preset: 4x3, 16x9, 1x1 or full
    #[arg(long, value_name = "PRESET")]
    aspect: Option<String>,

    /// Directory for generated images (default: next to each source)
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Author name to render (turns the author line on)
    #[arg(long)]
    author: Option<String>,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Display the EXIF tags this tool reads and writes, then exit
    #[arg(long = "show-tags")]
    show_tags: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    if cli.paths.is_empty() {
        anyhow::bail!("No input files or directories specified. Use --help for usage.");
    }

    let images = pipeline::collect_images(&cli.paths);
    if images.is_empty() {
        anyhow::bail!("No supported image files found in the specified paths.");
    }

    // Handle --show-tags
    if cli.show_tags {
        for image_path in &images {
            print_tags(image_path)?;
        }
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli)?;

    let fixed = match (cli.lat, cli.lng) {
        (Some(lat), Some(lng)) => {
            let coordinate = Coordinate::new(lat, lng);
            if !coordinate.is_valid() {
                anyhow::bail!("Coordinate out of range: {coordinate}");
            }
            Some(coordinate)
        }
        _ => None,
    };

    log::info!("Found {} image(s) to process", images.len());
    if !config.map_requested() && config.render.show_map {
        log::info!("No map API key configured; overlays will be drawn without a map");
    }

    let total = images.len();
    let mut results: Vec<RunOutcome> = Vec::new();
    let mut failed = 0usize;

    for (i, image_path) in images.iter().enumerate() {
        log::info!("[{}/{}] Processing: {}", i + 1, total, image_path.display());

        let provider: Arc<dyn LocationProvider> = match fixed {
            Some(c) => Arc::new(FixedLocationProvider::new(c)),
            None => Arc::new(ExifGpsProvider::new(image_path)),
        };
        let pipeline = GeoTagPipeline::from_config(config.clone(), provider);

        let outcomes = match pipeline.process(image_path.clone()).await {
            Ok(o) => o,
            Err(e) => {
                log::error!("  Error: {e}");
                failed += 1;
                continue;
            }
        };

        // The last outcome supersedes earlier revisions of the same file.
        let Some(outcome) = outcomes.into_iter().last() else {
            log::error!("  Error: run finished without an outcome");
            failed += 1;
            continue;
        };

        report(&outcome);
        if !outcome.is_success() {
            failed += 1;
        }
        results.push(outcome);
    }

    // JSON output
    if cli.json {
        let json_results: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "source": r.source.display().to_string(),
                    "output": r.output.as_ref().map(|p| p.display().to_string()),
                    "revision": r.revision,
                    "latitude": r.location.as_ref().map(|l| l.coordinate.latitude),
                    "longitude": r.location.as_ref().map(|l| l.coordinate.longitude),
                    "address": r.location.as_ref().map(|l| l.address.clone()),
                    "rows": r.rows,
                    "map_drawn": r.map_drawn,
                    "metadata_written": r.metadata_written,
                    "warnings": r.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
                    "error": r.error.as_ref().map(|e| e.to_string()),
                })
            })
            .collect();

        println!("{}", serde_json::to_string_pretty(&json_results)?);
    }

    // Summary
    let success = total - failed;
    log::info!("Done: {success} succeeded, {failed} failed out of {total} images");

    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) -> Result<()> {
    if let Some(ref name) = cli.aspect {
        config.output.aspect = AspectPolicy::from_preset(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown aspect preset '{name}' (use 4x3, 16x9, 1x1 or full)"))?;
    }
    if let Some(ref dir) = cli.output_dir {
        config.output.output_dir = Some(dir.clone());
    }
    if let Some(ref author) = cli.author {
        config.render.author_name = author.clone();
        config.render.show_author_name = true;
    }
    Ok(())
}

fn report(outcome: &RunOutcome) {
    if let Some(ref err) = outcome.error {
        log::error!("  Error: {err}");
        return;
    }

    if let Some(ref output) = outcome.output {
        log::info!("  Wrote: {}", output.display());
    }
    match &outcome.location {
        Some(loc) => log::info!("  Location: {} ({})", loc.address, loc.coordinate),
        None => log::info!("  Location: not available"),
    }

    let mut extras = Vec::new();
    if outcome.map_drawn {
        extras.push("map");
    }
    if outcome.metadata_written {
        extras.push("exif");
    }
    if !extras.is_empty() {
        log::info!("  Included: {}", extras.join(", "));
    }
    for warning in &outcome.warnings {
        log::warn!("  {warning}");
    }
}

// ANSI color codes
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Max width for the value column before wrapping.
const VAL_WIDTH: usize = 46;
/// Indent for continuation lines (tag column width + " : " = 25 chars + 2 leading spaces).
const INDENT: &str = "                           ";

/// Print the EXIF tags relevant to geotagging for one file.
fn print_tags(path: &Path) -> Result<()> {
    let data = exif::read_tags(path)?;

    println!();
    println!("{BOLD}File:{RESET} {}", path.display());
    println!("{DIM}{}{RESET}", "═".repeat(72));

    let orientation = data.orientation.map(|o| o.to_string());
    let fields: Vec<(&str, Option<&str>)> = vec![
        ("Make", data.make.as_deref()),
        ("Model", data.model.as_deref()),
        ("Software", data.software.as_deref()),
        ("DateTime", data.date_time.as_deref()),
        ("DateTimeOriginal", data.date_time_original.as_deref()),
        ("Orientation", orientation.as_deref()),
        ("UserComment", data.user_comment.as_deref()),
    ];
    for (tag, val) in &fields {
        if let Some(v) = val {
            print_row(tag, v);
        }
    }

    if let Some(c) = data.coordinate() {
        print_row("GPSLatitude", &format!("{:.6}", c.latitude));
        print_row("GPSLongitude", &format!("{:.6}", c.longitude));
    }

    if fields.iter().all(|(_, v)| v.is_none()) && data.coordinate().is_none() {
        println!("  {DIM}(no EXIF metadata found){RESET}");
    }
    println!();

    Ok(())
}

/// Print a single row in the tag table.
fn print_row(tag: &str, val: &str) {
    let tag_col = format!("{:<22}", tag);
    let lines = wrap_text(val, VAL_WIDTH);
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            println!("  {tag_col} : {line}");
        } else {
            println!("  {INDENT}{line}");
        }
    }
}

/// Wrap text at word boundaries to fit within max_width.
fn wrap_text(s: &str, max_width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in s.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_width {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            lines.push(current_line);
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    if lines.is_empty() {
        lines.push(s.to_string());
    }

    lines
}
