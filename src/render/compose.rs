//! Overlay layout and compositing.
//!
//! Layout follows a fixed recipe. The map thumbnail sits in the bottom-left
//! corner; the translucent panel fills the rest of the bottom edge and
//! grows upwards with the number of wrapped text rows.
//!
//! ```text
//!  ┌──────────────────────────────────────────┐
//!  │                                          │
//!  │           ╭───────────────────────────╮  │
//!  │  ┌─────┐  │ Market Street, San Fr...  │  │
//!  │  │ map │  │ Lat Lng : 37.77, -122.41  │  │
//!  │  └─────┘  │ 09/03/2024 02:05 PM       │  │
//!  │           ╰───────────────────────────╯  │
//!  └──────────────────────────────────────────┘
//! ```

use image::imageops::{self, FilterType};
use image::{Pixel, Rgba, RgbaImage};

use super::font::{BitmapFont, TextRenderer, load_renderer};
use super::lines::OverlayLines;
use crate::config::{Config, RenderConfig};

/// Horizontal space reserved around the text block (map gutter + margins).
pub const TEXT_MARGIN: u32 = 60;
pub const PANEL_PADDING: u32 = 20;
pub const LINE_SPACING: u32 = 10;
/// Gap between the photo edge and the map thumbnail.
pub const MAP_INSET: u32 = 10;
/// Distance from the photo bottom to the top of the text block's padding.
const PANEL_BOTTOM_OFFSET: i32 = 30;
const SHADOW: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// An axis-aligned rectangle in photo coordinates. May extend past the photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl PanelRect {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Everything computed before drawing. Pure function of the inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelGeometry {
    /// Final rendered rows after splitting and wrapping.
    pub rows: Vec<String>,
    /// 0 when no map is drawn.
    pub map_width: u32,
    pub text_width: u32,
    /// Font line height plus spacing.
    pub row_height: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub panel: PanelRect,
    pub map: Option<PanelRect>,
}

/// Output of [`OverlayComposer::compose`].
#[derive(Debug, Clone)]
pub struct ComposedImage {
    pub image: RgbaImage,
    pub geometry: PanelGeometry,
}

/// Greedy word-wrap.
///
/// `text` is split on `'\n'` first, then each segment on whitespace. Words
/// are packed while the row still measures at most `max_width`. A single
/// word wider than `max_width` is emitted on its own row, unbroken. Blank
/// segments produce no rows.
pub fn wrap_text(text: &str, font: &dyn TextRenderer, max_width: u32) -> Vec<String> {
    let mut rows = Vec::new();

    for segment in text.split('\n') {
        let mut current = String::new();
        for word in segment.split_whitespace() {
            if current.is_empty() {
                current.push_str(word);
                continue;
            }
            let candidate = format!("{current} {word}");
            if font.measure(&candidate) <= max_width {
                current = candidate;
            } else {
                rows.push(std::mem::take(&mut current));
                current.push_str(word);
            }
        }
        if !current.is_empty() {
            rows.push(current);
        }
    }

    rows
}

/// Draws the informational panel and map onto a photo.
pub struct OverlayComposer {
    font: Box<dyn TextRenderer>,
    map_width: u32,
    map_height: u32,
}

impl OverlayComposer {
    pub fn new(font: Box<dyn TextRenderer>, map_width: u32, map_height: u32) -> Self {
        Self {
            font,
            map_width,
            map_height,
        }
    }

    /// Composer for a config. An unloadable font file falls back to the
    /// bundled font, and that to the bitmap font, each with a warning.
    pub fn from_config(config: &Config) -> Self {
        let render = &config.render;
        let font = load_renderer(render.font_path.as_deref(), render.text_size)
            .or_else(|e| {
                log::warn!("{e:#}; using bundled font");
                load_renderer(None, render.text_size)
            })
            .unwrap_or_else(|e| {
                log::warn!("{e:#}; using built-in bitmap font");
                Box::new(BitmapFont::for_text_size(render.text_size))
            });
        Self::new(font, config.map.width, config.map.height)
    }

    /// Compute panel geometry for a `width × height` photo.
    pub fn layout(
        &self,
        width: u32,
        height: u32,
        has_map: bool,
        lines: &OverlayLines,
        config: &RenderConfig,
    ) -> PanelGeometry {
        let map_width = if has_map && config.show_map {
            self.map_width
        } else {
            0
        };
        let text_width = width.saturating_sub(map_width + TEXT_MARGIN).max(1);

        let rows: Vec<String> = lines
            .rows()
            .iter()
            .flat_map(|line| wrap_text(line, self.font.as_ref(), text_width))
            .collect();

        let row_height = self.font.line_height() + LINE_SPACING;
        let block_height = rows.len() as u32 * row_height;
        let block_width = text_width + 2 * PANEL_PADDING;

        let left = (map_width + PANEL_PADDING) as i32;
        let top = height as i32 - block_height as i32 - PANEL_BOTTOM_OFFSET;
        let panel = PanelRect {
            left,
            top,
            right: left + block_width as i32 - MAP_INSET as i32,
            bottom: top + (block_height + PANEL_PADDING) as i32,
        };

        let map = (map_width > 0).then(|| {
            let bottom = height as i32 - MAP_INSET as i32;
            PanelRect {
                left: MAP_INSET as i32,
                top: bottom - self.map_height as i32,
                right: (MAP_INSET + map_width) as i32,
                bottom,
            }
        });

        PanelGeometry {
            rows,
            map_width,
            text_width,
            row_height,
            block_width,
            block_height,
            panel,
            map,
        }
    }

    /// Composite the overlay onto a copy of `photo`.
    ///
    /// Draw order: photo, rounded panel, map thumbnail, text rows (each
    /// with a 1 px drop shadow). The panel is drawn even when there are no
    /// rows, at padding height.
    pub fn compose(
        &self,
        photo: &RgbaImage,
        map: Option<&RgbaImage>,
        lines: &OverlayLines,
        config: &RenderConfig,
    ) -> ComposedImage {
        let (width, height) = photo.dimensions();
        let geometry = self.layout(width, height, map.is_some(), lines, config);
        log::debug!(
            "Composing {width}x{height}: {} rows, map width {}",
            geometry.rows.len(),
            geometry.map_width
        );

        let mut canvas = photo.clone();

        fill_rounded_rect(
            &mut canvas,
            geometry.panel,
            config.corner_radius,
            config.background_color.to_rgba(),
        );

        if let (Some(map), Some(rect)) = (map, geometry.map) {
            let thumb = imageops::resize(
                map,
                rect.width() as u32,
                rect.height() as u32,
                FilterType::Nearest,
            );
            imageops::overlay(&mut canvas, &thumb, rect.left as i64, rect.top as i64);
        }

        let text_x = geometry.panel.left + PANEL_PADDING as i32;
        let mut y = geometry.panel.top + PANEL_PADDING as i32;
        let color = config.text_color.to_rgba();
        for row in &geometry.rows {
            self.font.draw(&mut canvas, text_x, y + 1, row, SHADOW);
            self.font.draw(&mut canvas, text_x, y, row, color);
            y += geometry.row_height as i32;
        }

        ComposedImage {
            image: canvas,
            geometry,
        }
    }
}

/// Alpha-blend a filled rounded rectangle onto `canvas`, clipped to its
/// bounds. Each pixel is blended exactly once.
pub fn fill_rounded_rect(canvas: &mut RgbaImage, rect: PanelRect, radius: f32, color: Rgba<u8>) {
    if rect.width() <= 0 || rect.height() <= 0 {
        return;
    }
    let (w, h) = canvas.dimensions();
    let r = radius
        .max(0.0)
        .min(rect.width() as f32 / 2.0)
        .min(rect.height() as f32 / 2.0);

    let (left, top) = (rect.left as f32, rect.top as f32);
    let (right, bottom) = (rect.right as f32, rect.bottom as f32);

    let x0 = rect.left.max(0);
    let y0 = rect.top.max(0);
    let x1 = rect.right.min(w as i32);
    let y1 = rect.bottom.min(h as i32);

    for y in y0..y1 {
        for x in x0..x1 {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            let cx = px.clamp(left + r, right - r);
            let cy = py.clamp(top + r, bottom - r);
            let (dx, dy) = (px - cx, py - cy);
            if dx * dx + dy * dy <= r * r {
                canvas.get_pixel_mut(x as u32, y as u32).blend(&color);
            }
        }
    }
}
