//! # geotag-image
//!
//! Bake location context into photos: a translucent panel with the
//! reverse-geocoded address, latitude/longitude, capture date, author and
//! app name, plus a satellite map thumbnail, composited onto the image and
//! mirrored into its EXIF tags (GPS, DateTime, Make/Model, Software,
//! UserComment).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use geotag_image::config::Config;
//! use geotag_image::geo::{Coordinate, FixedLocationProvider};
//! use geotag_image::pipeline::{GeoTagPipeline, RunOutcome};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load(Some(Path::new("config.json")))?;
//!     config.render.show_author_name = true;
//!     config.render.author_name = "Jane".into();
//!
//!     let provider = Arc::new(FixedLocationProvider::new(Coordinate::new(37.7749, -122.4194)));
//!     let pipeline = GeoTagPipeline::from_config(config, provider);
//!
//!     let handle = pipeline
//!         .capture(
//!             "photo.jpg",
//!             Arc::new(|outcome: &RunOutcome| match &outcome.error {
//!                 None => println!("Wrote {:?} (revision {})", outcome.output, outcome.revision),
//!                 Some(err) => eprintln!("Failed: {err}"),
//!             }),
//!         )
//!         .await?;
//!     handle.join().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Lower-Level Usage
//!
//! Each stage is usable on its own:
//!
//! ```rust,no_run
//! use geotag_image::config::{AspectPolicy, Config};
//! use geotag_image::render::{self, Orientation, OverlayComposer, OverlayLines};
//! use geotag_image::exif::{self, TagSet};
//! use geotag_image::pipeline::{self, ImageKind};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::default();
//! let path = Path::new("photo.jpg");
//!
//! let img = image::open(path)?;
//! let upright = render::normalize(&img, Orientation::from_exif(exif::read_orientation(path)));
//! let scaled = render::scale(&upright, AspectPolicy::RATIO_4X3).to_rgba8();
//!
//! let now = chrono::Local::now().fixed_offset();
//! let lines = OverlayLines::build(None, &now, &config.render);
//! let composed = OverlayComposer::from_config(&config).compose(&scaled, None, &lines, &config.render);
//! // JPEG has no alpha channel; encode_image drops it before encoding.
//! let bytes = pipeline::encode_image(composed.image, ImageKind::Jpeg, 80)?;
//! std::fs::write("out.jpg", bytes)?;
//!
//! let tags = TagSet::from_config(None, now.naive_local(), &config.metadata, None);
//! exif::write_tags(Path::new("out.jpg"), &tags)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`] — Configuration types and loading/saving
//! - [`error`] — Pipeline failure taxonomy
//! - [`geo`] — Location providers, reverse geocoding, [`geo::GeoResolver`]
//! - [`map`] — Static satellite map thumbnails
//! - [`render`] — Orientation, scaling, text layout and overlay compositing
//! - [`exif`] — EXIF reading and writing
//! - [`pipeline`] — The capture → compose → persist orchestrator and batch helpers

pub mod config;
pub mod error;
pub mod exif;
pub mod geo;
pub mod map;
pub mod pipeline;
pub mod render;
