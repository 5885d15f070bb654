use chrono::{DateTime, FixedOffset};
use std::fmt::Write;

use crate::config::RenderConfig;
use crate::geo::{ADDRESS_NOT_AVAILABLE, ResolvedLocation};

/// Fallback when the configured date format cannot be rendered.
const DEFAULT_DATE_FORMAT: &str = "%d/%m/%Y %I:%M %p %Z";

/// The logical text rows of one overlay, top to bottom.
///
/// Built fresh for every composition. Order is fixed: address, lat/lng,
/// date, author, app name. Rows may still wrap when laid out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayLines {
    rows: Vec<String>,
}

impl OverlayLines {
    /// Build the rows for a capture.
    ///
    /// The address row is always present; it carries the placeholder when
    /// no location was resolved, and the lat/lng row is then skipped.
    pub fn build(
        location: Option<&ResolvedLocation>,
        captured_at: &DateTime<FixedOffset>,
        config: &RenderConfig,
    ) -> Self {
        let mut rows = Vec::with_capacity(5);

        match location {
            Some(loc) => {
                rows.push(loc.address.clone());
                if config.show_lat_lng {
                    rows.push(format!("Lat Lng : {}", loc.coordinate));
                }
            }
            None => rows.push(ADDRESS_NOT_AVAILABLE.to_string()),
        }

        if config.show_date {
            rows.push(format_capture_time(captured_at, &config.date_format));
        }

        if config.show_author_name && !config.author_name.trim().is_empty() {
            rows.push(format!("{}: {}", config.author_label, config.author_name.trim()));
        }

        if config.show_app_name {
            if let Some(app) = config.app_name.as_deref().filter(|a| !a.trim().is_empty()) {
                rows.push(app.to_string());
            }
        }

        Self { rows }
    }

    pub fn from_rows(rows: Vec<String>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Format `at` with a chrono format string, falling back to the default
/// format when `format` contains an unsupported specifier.
pub fn format_capture_time(at: &DateTime<FixedOffset>, format: &str) -> String {
    let mut out = String::new();
    if write!(out, "{}", at.format(format)).is_ok() {
        return out;
    }

    log::warn!("Invalid date format '{format}', using default");
    out.clear();
    let _ = write!(out, "{}", at.format(DEFAULT_DATE_FORMAT));
    out
}
