use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level configuration for the geotag-image library.
///
/// Supplied once before a capture session and read-only while a run is in
/// flight. A later session may load a different `Config` without affecting
/// images that were already written.
///
/// # Loading
///
/// ```rust,no_run
/// use geotag_image::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.map.api_key = Some("AIza...".into());
/// config.render.show_author_name = true;
/// config.render.author_name = "Jane".into();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Overlay appearance and which lines are rendered.
    pub render: RenderConfig,
    /// Static map thumbnail settings.
    pub map: MapConfig,
    /// Location fix and reverse-geocoding settings.
    pub location: LocationConfig,
    /// Output size, format and destination.
    pub output: OutputConfig,
    /// EXIF tags stamped on the finished image.
    pub metadata: MetadataConfig,
}

/// Every user-adjustable knob of the overlay.
///
/// The `show_*` toggles decide which [`OverlayLines`](crate::render::OverlayLines)
/// rows are produced; their stacking order is fixed (address, lat/lng, date,
/// author, app name).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Master switch. When `false` the photo is only scaled and saved: no
    /// overlay is drawn and no metadata is written.
    pub enabled: bool,
    /// Text size in pixels.
    pub text_size: f32,
    /// TrueType/OpenType font file. `None` uses the bundled DejaVu Sans.
    pub font_path: Option<PathBuf>,
    /// Panel corner radius in pixels.
    pub corner_radius: f32,
    /// Panel fill, alpha included.
    pub background_color: Color,
    pub text_color: Color,
    pub show_author_name: bool,
    pub show_app_name: bool,
    pub show_lat_lng: bool,
    pub show_date: bool,
    pub show_map: bool,
    pub author_name: String,
    /// Prefix of the author line, rendered as `"{label}: {author_name}"`.
    pub author_label: String,
    /// Application/display name for the app-name line and the EXIF attribution.
    pub app_name: Option<String>,
    /// chrono format string for the date line.
    pub date_format: String,
}

/// Static map thumbnail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Static-map API credential. No key means no map.
    pub api_key: Option<String>,
    pub width: u32,
    pub height: u32,
    pub zoom: u8,
    /// Endpoint of the static map service.
    pub base_url: String,
    /// How long to wait for the map before composing without it.
    pub wait_ms: u64,
    /// What to do with a map that arrives after the first composite was written.
    pub late_map_policy: LateMapPolicy,
}

/// Behavior when the map thumbnail arrives after a mapless composite was
/// already delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateMapPolicy {
    /// Compose again with the map, overwrite the output and notify again.
    Recompose,
    /// Keep the first composite; the late map is dropped.
    Discard,
}

/// Location fix and reverse-geocoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Upper bound for a live fix once no cached fix is available.
    pub fix_timeout_ms: u64,
    /// Look up a human-readable address for the fix.
    pub reverse_geocode: bool,
    /// Nominatim-compatible reverse geocoding endpoint.
    pub geocoder_url: String,
    /// User-Agent sent to the geocoder (Nominatim requires one).
    pub user_agent: String,
}

/// Output size, format and destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub aspect: AspectPolicy,
    /// `.jpg`, `.jpeg` or `.png`. Also selects the encoder.
    pub extension: String,
    pub jpeg_quality: u8,
    /// Directory for generated files. `None` writes next to the source photo.
    pub output_dir: Option<PathBuf>,
    pub file_prefix: String,
}

/// EXIF tags written to the finished image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub enabled: bool,
    pub make: String,
    pub model: String,
    /// Originating-software string. Defaults to the host OS name when empty.
    pub software: Option<String>,
    pub comment: Option<String>,
}

/// Output resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AspectPolicy {
    /// Resize to exactly `width × height`, ignoring the source aspect ratio.
    Fixed { width: u32, height: u32 },
    /// Center-crop to a square, then resize to `size × size`.
    SquareCrop { size: u32 },
    /// Preserve aspect ratio with the longer side mapped to `max_px`.
    FitLongestSide { max_px: u32 },
}

impl AspectPolicy {
    pub const RATIO_4X3: Self = Self::Fixed { width: 768, height: 1024 };
    pub const RATIO_16X9: Self = Self::Fixed { width: 720, height: 1280 };
    pub const RATIO_1X1: Self = Self::SquareCrop { size: 1024 };
    pub const RATIO_FULL: Self = Self::FitLongestSide { max_px: 1280 };

    /// Parse a preset name as accepted by the CLI (`4x3`, `16x9`, `1x1`, `full`).
    pub fn from_preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "4x3" | "4:3" => Some(Self::RATIO_4X3),
            "16x9" | "16:9" => Some(Self::RATIO_16X9),
            "1x1" | "1:1" | "square" => Some(Self::RATIO_1X1),
            "full" => Some(Self::RATIO_FULL),
            _ => None,
        }
    }
}

/// An RGBA color, serialized as an Android-style `#AARRGGBB` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Self = Self::rgba(255, 255, 255, 255);
    pub const BLACK: Self = Self::rgba(0, 0, 0, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse `#RRGGBB` or `#AARRGGBB`.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s.trim().trim_start_matches('#');
        let value = u32::from_str_radix(hex, 16)
            .with_context(|| format!("Invalid color '{s}'"))?;
        match hex.len() {
            6 => Ok(Self::rgba(
                (value >> 16) as u8,
                (value >> 8) as u8,
                value as u8,
                0xFF,
            )),
            8 => Ok(Self::rgba(
                (value >> 16) as u8,
                (value >> 8) as u8,
                value as u8,
                (value >> 24) as u8,
            )),
            _ => anyhow::bail!("Color '{s}' must be #RRGGBB or #AARRGGBB"),
        }
    }

    pub fn to_rgba(self) -> image::Rgba<u8> {
        image::Rgba([self.r, self.g, self.b, self.a])
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}{:02X}", self.a, self.r, self.g, self.b)
    }
}

impl TryFrom<String> for Color {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            text_size: 25.0,
            font_path: None,
            corner_radius: 12.0,
            background_color: Color::rgba(0, 0, 0, 0x66),
            text_color: Color::WHITE,
            show_author_name: false,
            show_app_name: false,
            show_lat_lng: true,
            show_date: true,
            show_map: true,
            author_name: String::new(),
            author_label: "Captured By".to_string(),
            app_name: None,
            date_format: "%d/%m/%Y %I:%M %p %Z".to_string(),
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            width: 140,
            height: 150,
            zoom: 17,
            base_url: "https://maps.googleapis.com/maps/api/staticmap".to_string(),
            wait_ms: 5000,
            late_map_policy: LateMapPolicy::Recompose,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            fix_timeout_ms: 10_000,
            reverse_geocode: true,
            geocoder_url: "https://nominatim.openstreetmap.org/reverse".to_string(),
            user_agent: concat!("geotag-image/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            aspect: AspectPolicy::RATIO_4X3,
            extension: ".jpg".to_string(),
            jpeg_quality: 80,
            output_dir: None,
            file_prefix: "IMG_".to_string(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            make: String::new(),
            model: String::new(),
            software: None,
            comment: None,
        }
    }
}

impl Config {
    /// Resolve the config file path: `config.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// Whether the run should try to fetch a map thumbnail at all.
    pub fn map_requested(&self) -> bool {
        self.render.enabled
            && self.render.show_map
            && self
                .map
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── Color ────────────────────────────────────────────────────────

    #[test]
    fn color_parse_argb() {
        let c = Color::parse("#66000000").unwrap();
        assert_eq!(c, Color::rgba(0, 0, 0, 0x66));
    }

    #[test]
    fn color_parse_rgb_is_opaque() {
        let c = Color::parse("#FF8000").unwrap();
        assert_eq!(c, Color::rgba(0xFF, 0x80, 0x00, 0xFF));
    }

    #[test]
    fn color_parse_rejects_garbage() {
        assert!(Color::parse("#12345").is_err());
        assert!(Color::parse("not a color").is_err());
    }

    #[test]
    fn color_display_is_argb() {
        assert_eq!(Color::rgba(1, 2, 3, 4).to_string(), "#04010203");
    }

    // ── AspectPolicy ─────────────────────────────────────────────────

    #[test]
    fn aspect_presets() {
        assert_eq!(AspectPolicy::from_preset("4x3"), Some(AspectPolicy::RATIO_4X3));
        assert_eq!(AspectPolicy::from_preset("16:9"), Some(AspectPolicy::RATIO_16X9));
        assert_eq!(AspectPolicy::from_preset("SQUARE"), Some(AspectPolicy::RATIO_1X1));
        assert_eq!(AspectPolicy::from_preset("full"), Some(AspectPolicy::RATIO_FULL));
        assert_eq!(AspectPolicy::from_preset("3x2"), None);
    }

    // ── map_requested ────────────────────────────────────────────────

    #[test]
    fn map_requires_key_and_toggle() {
        let mut config = Config::default();
        assert!(!config.map_requested(), "no key by default");

        config.map.api_key = Some("key".into());
        assert!(config.map_requested());

        config.render.show_map = false;
        assert!(!config.map_requested());

        config.render.show_map = true;
        config.map.api_key = Some("   ".into());
        assert!(!config.map_requested());
    }

    // ── load / save ──────────────────────────────────────────────────

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.output.extension, ".jpg");
        assert_eq!(config.map.zoom, 17);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.render.author_name = "Ashley".into();
        config.render.background_color = Color::rgba(10, 20, 30, 40);
        config.output.aspect = AspectPolicy::FitLongestSide { max_px: 640 };
        config.map.late_map_policy = LateMapPolicy::Discard;
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.render.author_name, "Ashley");
        assert_eq!(loaded.render.background_color, Color::rgba(10, 20, 30, 40));
        assert_eq!(loaded.output.aspect, AspectPolicy::FitLongestSide { max_px: 640 });
        assert_eq!(loaded.map.late_map_policy, LateMapPolicy::Discard);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r##"{"render": {"text_color": "#FFFF0000"}}"##).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.render.text_color, Color::rgba(255, 0, 0, 255));
        assert!(loaded.render.show_date);
        assert_eq!(loaded.map.width, 140);
    }

    #[test]
    fn map_toggle_and_app_name_live_under_render() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"render": {"show_map": false, "app_name": "Field Notes"}, "map": {"api_key": "k"}}"#,
        )
        .unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.render.app_name.as_deref(), Some("Field Notes"));
        assert!(!loaded.map_requested());
    }
}
