use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime};
use nom_exif::*;
use std::path::Path;

use crate::geo::Coordinate;

// IFD0 DateTime; nom-exif names it ModifyDate.
const TAG_DATE_TIME: u16 = 0x0132;
const USER_COMMENT_ASCII: &str = "ASCII\0\0\0";

/// EXIF tags read back from an image. Dates use the EXIF `yyyy:MM:dd HH:mm:ss`
/// form regardless of how the parser surfaces them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifData {
    pub make: Option<String>,
    pub model: Option<String>,
    pub software: Option<String>,
    pub date_time: Option<String>,
    pub date_time_original: Option<String>,
    pub user_comment: Option<String>,
    pub orientation: Option<u32>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
}

impl ExifData {
    pub fn coordinate(&self) -> Option<Coordinate> {
        Some(Coordinate::new(self.gps_latitude?, self.gps_longitude?))
    }
}

/// Read EXIF tags from an image file. A file without EXIF yields empty data.
pub fn read_tags(path: &Path) -> Result<ExifData> {
    let mut parser = MediaParser::new();
    let ms = MediaSource::file_path(path).context("Failed to open image file")?;

    let iter: ExifIter = match parser.parse(ms) {
        Ok(iter) => iter,
        Err(_) => {
            log::debug!("No EXIF data found in {}", path.display());
            return Ok(ExifData::default());
        }
    };

    // Parse GPS info before converting to Exif (consumes the iterator)
    let gps_info = iter.parse_gps_info().ok().flatten();
    let exif: Exif = iter.into();

    let mut data = ExifData {
        make: exif.get(ExifTag::Make).and_then(entry_to_string),
        model: exif.get(ExifTag::Model).and_then(entry_to_string),
        software: exif.get(ExifTag::Software).and_then(entry_to_string),
        date_time: exif
            .get_by_ifd_tag_code(0, TAG_DATE_TIME)
            .and_then(entry_to_exif_date),
        date_time_original: exif
            .get(ExifTag::DateTimeOriginal)
            .and_then(entry_to_exif_date),
        user_comment: exif
            .get(ExifTag::UserComment)
            .and_then(entry_to_string)
            .map(|s| s.trim_start_matches(USER_COMMENT_ASCII).to_string()),
        orientation: exif
            .get(ExifTag::Orientation)
            .and_then(|v| v.to_string().trim().parse().ok()),
        ..ExifData::default()
    };

    if let Some(gps) = gps_info {
        data.gps_latitude = Some(latlng_to_decimal(&gps.latitude, gps.latitude_ref));
        data.gps_longitude = Some(latlng_to_decimal(&gps.longitude, gps.longitude_ref));
    }

    Ok(data)
}

/// EXIF orientation value of an image, if it has one and it can be read.
pub fn read_orientation(path: &Path) -> Option<u32> {
    match read_tags(path) {
        Ok(data) => data.orientation,
        Err(e) => {
            log::debug!("Could not read orientation of {}: {e:#}", path.display());
            None
        }
    }
}

/// Convert an EntryValue to an Option<String>.
fn entry_to_string(val: &EntryValue) -> Option<String> {
    let s = val.to_string();
    let s = s.trim().trim_matches('"').trim_end_matches('\0').to_string();
    if s.is_empty() { None } else { Some(s) }
}

/// Normalize a date entry to `yyyy:MM:dd HH:mm:ss`.
fn entry_to_exif_date(val: &EntryValue) -> Option<String> {
    let raw = entry_to_string(val)?;
    let naive = DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| {
            ["%Y:%m:%d %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&raw, fmt).ok())
        });
    match naive {
        Some(dt) => Some(dt.format(super::EXIF_DATE_FORMAT).to_string()),
        None => Some(raw),
    }
}

/// Convert a nom-exif LatLng (3 URationals: deg, min, sec) to decimal degrees.
fn latlng_to_decimal(latlng: &LatLng, reference: char) -> f64 {
    let degrees = latlng.0.0 as f64 / latlng.0.1 as f64;
    let minutes = latlng.1.0 as f64 / latlng.1.1 as f64;
    let seconds = latlng.2.0 as f64 / latlng.2.1 as f64;

    let mut coord = degrees + minutes / 60.0 + seconds / 3600.0;

    if reference == 'S' || reference == 'W' {
        coord = -coord;
    }

    coord
}
