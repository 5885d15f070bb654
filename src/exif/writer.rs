use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use img_parts::jpeg::Jpeg;
use img_parts::{Bytes, DynImage, ImageEXIF};
use little_exif::endian::Endian;
use little_exif::exif_tag::{ExifTag, ExifTagGroup};
use little_exif::exif_tag_format::ExifTagFormat;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use std::path::Path;

use super::EXIF_DATE_FORMAT;
use crate::config::MetadataConfig;
use crate::geo::Coordinate;

const TAG_GPS_LATITUDE_REF: u16 = 0x0001;
const TAG_GPS_LATITUDE: u16 = 0x0002;
const TAG_GPS_LONGITUDE_REF: u16 = 0x0003;
const TAG_GPS_LONGITUDE: u16 = 0x0004;

// little_exif as_u8_vec(JPEG) returns: [APP1 marker 2B][length 2B][Exif\0\0 6B][TIFF data]
// img-parts set_exif() expects just the TIFF data (after Exif\0\0)
const JPEG_EXIF_OVERHEAD: usize = 10; // 2 + 2 + 6

const DEFAULT_ATTRIBUTION: &str = "GeoTagImage App";

/// The tag values stamped onto one output image.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSet {
    /// GPS block; omitted when `None`.
    pub coordinate: Option<Coordinate>,
    /// Written to both DateTime and DateTimeOriginal.
    pub captured_at: NaiveDateTime,
    pub make: String,
    pub model: String,
    pub software: String,
    pub comment: Option<String>,
}

impl TagSet {
    /// Tags for a capture. The model gets a `", Captured via {app}"` suffix.
    pub fn from_config(
        coordinate: Option<Coordinate>,
        captured_at: NaiveDateTime,
        metadata: &MetadataConfig,
        app_name: Option<&str>,
    ) -> Self {
        let software = metadata
            .software
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| std::env::consts::OS.to_string());

        Self {
            coordinate,
            captured_at,
            make: metadata.make.clone(),
            model: attributed_model(&metadata.model, app_name),
            software,
            comment: metadata.comment.clone().filter(|c| !c.trim().is_empty()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Self {
            coordinate: None,
            captured_at: chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
                .and_then(|d| d.and_hms_opt(14, 5, 0))
                .unwrap(),
            make: "Acme".into(),
            model: "Snapper 3".into(),
            software: "test".into(),
            comment: None,
        }
    }
}

fn attributed_model(model: &str, app_name: Option<&str>) -> String {
    let app = app_name
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(DEFAULT_ATTRIBUTION);
    let model = model.trim();
    if model.is_empty() {
        format!("Captured via {app}")
    } else {
        format!("{model}, Captured via {app}")
    }
}

/// Result of writing EXIF data to an image.
#[derive(Debug, Default, PartialEq)]
pub struct WriteResult {
    pub tags_written: usize,
    pub gps_written: bool,
    pub comment_written: bool,
}

/// Persists a [`TagSet`] into a finished image file.
pub trait TagWriter: Send + Sync {
    fn write_tags(&self, path: &Path, tags: &TagSet) -> Result<WriteResult>;
}

/// [`TagWriter`] backed by [`write_tags`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifTagWriter;

impl TagWriter for ExifTagWriter {
    fn write_tags(&self, path: &Path, tags: &TagSet) -> Result<WriteResult> {
        write_tags(path, tags)
    }
}

/// Encode a GPS rational value as raw bytes (3 rationals = 24 bytes, little-endian).
fn encode_gps_rational(degrees: u32, minutes: u32, seconds_num: u32, seconds_den: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&degrees.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&minutes.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&seconds_num.to_le_bytes());
    bytes.extend_from_slice(&seconds_den.to_le_bytes());
    bytes
}

/// Load existing EXIF metadata from a file path using little_exif.
/// Returns None if it can't parse (instead of losing data).
fn load_existing_metadata(path: &Path) -> Option<Metadata> {
    let path_owned = path.to_path_buf();
    // little_exif panics on some malformed blocks.
    let result = std::panic::catch_unwind(move || Metadata::new_from_path(&path_owned));

    match result {
        Ok(Ok(m)) => {
            if m.data().is_empty() {
                log::debug!("little_exif loaded empty metadata");
                None
            } else {
                log::debug!("little_exif loaded {} existing EXIF tags", m.data().len());
                Some(m)
            }
        }
        Ok(Err(e)) => {
            log::debug!("little_exif could not parse EXIF: {e}");
            None
        }
        Err(_) => {
            log::debug!("little_exif panicked parsing EXIF");
            None
        }
    }
}

/// Write `tags` into the image at `path`, in place.
///
/// JPEG and PNG are supported. For JPEG, existing EXIF tags that little_exif
/// can parse are kept and the new values replace same-named ones, so
/// writing the same `TagSet` twice leaves the file's tags unchanged. All
/// non-EXIF segments are preserved byte for byte.
pub fn write_tags(path: &Path, tags: &TagSet) -> Result<WriteResult> {
    let mut result = WriteResult::default();
    let mut new_tags: Vec<ExifTag> = Vec::new();

    let date = tags.captured_at.format(EXIF_DATE_FORMAT).to_string();
    new_tags.push(ExifTag::ModifyDate(date.clone()));
    new_tags.push(ExifTag::DateTimeOriginal(date));
    if !tags.make.is_empty() {
        new_tags.push(ExifTag::Make(tags.make.clone()));
    }
    if !tags.model.is_empty() {
        new_tags.push(ExifTag::Model(tags.model.clone()));
    }
    if !tags.software.is_empty() {
        new_tags.push(ExifTag::Software(tags.software.clone()));
    }
    // Pixels are upright after normalization.
    new_tags.push(ExifTag::Orientation(vec![1]));

    if let Some(ref comment) = tags.comment {
        let mut comment_bytes = b"ASCII\0\0\0".to_vec();
        comment_bytes.extend_from_slice(comment.as_bytes());
        new_tags.push(ExifTag::UserComment(comment_bytes));
        result.comment_written = true;
    }

    if let Some(coordinate) = tags.coordinate {
        collect_gps_tags(&mut new_tags, coordinate);
        result.gps_written = true;
    }

    result.tags_written = new_tags.len();
    log::debug!("Writing {} EXIF tags to {}", new_tags.len(), path.display());

    write_tags_to_image(path, &new_tags).context("Failed to write EXIF metadata to file")?;
    Ok(result)
}

fn write_tags_to_image(path: &Path, new_tags: &[ExifTag]) -> Result<()> {
    let file_bytes = std::fs::read(path).context("Failed to read image file")?;

    let mut image = DynImage::from_bytes(Bytes::from(file_bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse image: {e}"))?
        .with_context(|| format!("Unsupported image format: {}", path.display()))?;

    let orig_exif_pos = match &image {
        DynImage::Jpeg(jpeg) => find_exif_segment_pos(jpeg),
        _ => None,
    };

    // Merge into what little_exif can read; otherwise start fresh.
    let mut metadata = match image {
        DynImage::Jpeg(_) => load_existing_metadata(path),
        _ => None,
    }
    .unwrap_or_else(Metadata::new);

    for tag in new_tags {
        metadata.set_tag(tag.clone());
    }

    let exif_bytes = metadata.as_u8_vec(FileExtension::JPEG);
    if exif_bytes.len() <= JPEG_EXIF_OVERHEAD {
        anyhow::bail!("little_exif produced an empty EXIF block");
    }
    image.set_exif(Some(Bytes::from(exif_bytes[JPEG_EXIF_OVERHEAD..].to_vec())));

    // set_exif() inserts at position 3, which may be after XMP APP1.
    // Move the EXIF segment back to its original position so EXIF comes
    // before XMP (required for many EXIF parsers).
    if let DynImage::Jpeg(ref mut jpeg) = image {
        if let Some(new_pos) = find_exif_segment_pos(jpeg) {
            let target_pos = orig_exif_pos.unwrap_or(1); // default: right after APP0
            if target_pos < new_pos {
                let segments = jpeg.segments_mut();
                let seg = segments.remove(new_pos);
                segments.insert(target_pos, seg);
            }
        }
    }

    let output = image.encoder().bytes();
    std::fs::write(path, &output).context("Failed to write image file")?;

    Ok(())
}

/// Find the position of the EXIF APP1 segment in a JPEG.
/// EXIF segments have marker 0xE1 (APP1) and contents starting with "Exif\0\0".
fn find_exif_segment_pos(jpeg: &Jpeg) -> Option<usize> {
    const EXIF_PREFIX: &[u8] = b"Exif\0\0";
    jpeg.segments()
        .iter()
        .position(|s| s.marker() == 0xE1 && s.contents().starts_with(EXIF_PREFIX))
}

const SECONDS_SCALE: u32 = 10_000;

/// Split decimal degrees into whole degrees, whole minutes and seconds × 10000.
/// Seconds that round up to 60 carry into the minutes (and minutes into degrees).
fn to_dms(value: f64) -> (u32, u32, u32) {
    let abs = value.abs();
    let mut deg = abs.floor() as u32;
    let mut min = ((abs - deg as f64) * 60.0).floor() as u32;
    let mut sec =
        ((abs - deg as f64 - min as f64 / 60.0) * 3600.0 * SECONDS_SCALE as f64).round() as u32;
    if sec >= 60 * SECONDS_SCALE {
        sec -= 60 * SECONDS_SCALE;
        min += 1;
    }
    if min >= 60 {
        min -= 60;
        deg += 1;
    }
    (deg, min, sec)
}

fn collect_gps_tags(tags: &mut Vec<ExifTag>, coordinate: Coordinate) {
    let lat = coordinate.latitude;
    let lon = coordinate.longitude;

    let lat_ref = if lat >= 0.0 { "N" } else { "S" };
    let lon_ref = if lon >= 0.0 { "E" } else { "W" };

    let (lat_deg, lat_min, lat_sec) = to_dms(lat);
    let (lon_deg, lon_min, lon_sec) = to_dms(lon);

    let entries = [
        (
            TAG_GPS_LATITUDE_REF,
            ExifTagFormat::STRING,
            format!("{lat_ref}\0").into_bytes(),
        ),
        (
            TAG_GPS_LATITUDE,
            ExifTagFormat::RATIONAL64U,
            encode_gps_rational(lat_deg, lat_min, lat_sec, SECONDS_SCALE),
        ),
        (
            TAG_GPS_LONGITUDE_REF,
            ExifTagFormat::STRING,
            format!("{lon_ref}\0").into_bytes(),
        ),
        (
            TAG_GPS_LONGITUDE,
            ExifTagFormat::RATIONAL64U,
            encode_gps_rational(lon_deg, lon_min, lon_sec, SECONDS_SCALE),
        ),
    ];

    for (id, format, data) in entries {
        match ExifTag::from_u16_with_data(id, &format, &data, &Endian::Little, &ExifTagGroup::GPSIFD)
        {
            Ok(tag) => tags.push(tag),
            Err(e) => log::warn!("Could not encode GPS tag 0x{id:04X}: {e}"),
        }
    }
}
