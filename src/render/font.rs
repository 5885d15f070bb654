//! Text measurement and drawing.
//!
//! [`TextRenderer`] is the seam the composer lays text out against. Two
//! implementations ship: [`TrueTypeFont`] (any TTF/OTF via ab_glyph, with
//! DejaVu Sans embedded as the default) and [`BitmapFont`], a 5×7 ASCII
//! font kept as the last resort when no TrueType font can be loaded.

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use anyhow::{Context, Result};
use image::{Pixel, Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use std::path::Path;

/// Measures and draws single-line text.
pub trait TextRenderer: Send + Sync {
    /// Advance width of `text` in pixels.
    fn measure(&self, text: &str) -> u32;
    /// Height of one text line in pixels, without extra spacing.
    fn line_height(&self) -> u32;
    /// Draw `text` with its line box's top-left corner at `(x, y)`.
    fn draw(&self, canvas: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>);
}

/// DejaVu Sans, embedded so the default overlay covers Latin, Greek and
/// Cyrillic addresses without a font file on disk.
const BUNDLED_FONT: &[u8] = include_bytes!("../../fonts/DejaVuSans.ttf");

/// Pick the renderer for a render config: the configured font file, or the
/// bundled font when none is set.
pub fn load_renderer(font_path: Option<&Path>, text_size: f32) -> Result<Box<dyn TextRenderer>> {
    match font_path {
        Some(path) => Ok(Box::new(TrueTypeFont::from_path(path, text_size)?)),
        None => Ok(Box::new(TrueTypeFont::bundled(text_size)?)),
    }
}

/// A TrueType/OpenType font at a fixed pixel size.
pub struct TrueTypeFont {
    font: FontArc,
    scale: PxScale,
}

impl TrueTypeFont {
    pub fn from_bytes(data: Vec<u8>, text_size: f32) -> Result<Self> {
        let font = FontArc::try_from_vec(data).context("Invalid font data")?;
        Ok(Self {
            font,
            scale: PxScale::from(text_size.max(1.0)),
        })
    }

    /// The embedded DejaVu Sans.
    pub fn bundled(text_size: f32) -> Result<Self> {
        let font = FontArc::try_from_slice(BUNDLED_FONT).context("Invalid bundled font")?;
        Ok(Self {
            font,
            scale: PxScale::from(text_size.max(1.0)),
        })
    }

    /// Whether the font has an outline for `ch`.
    pub fn has_glyph(&self, ch: char) -> bool {
        self.font.glyph_id(ch).0 != 0
    }

    pub fn from_path(path: &Path, text_size: f32) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read font {}", path.display()))?;
        Self::from_bytes(data, text_size)
    }
}

impl TextRenderer for TrueTypeFont {
    fn measure(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        text_size(self.scale, &self.font, text).0
    }

    fn line_height(&self) -> u32 {
        self.font.as_scaled(self.scale).height().ceil() as u32
    }

    fn draw(&self, canvas: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>) {
        draw_text_mut(canvas, color, x, y, self.scale, &self.font, text);
    }
}

const GLYPH_COLS: u32 = 5;
const GLYPH_ROWS: u32 = 7;
/// Cell = glyph + one blank column / row.
const CELL_W: u32 = GLYPH_COLS + 1;
const CELL_H: u32 = GLYPH_ROWS + 1;
/// Nominal text size of the unscaled font.
const BASE_SIZE: f32 = 8.0;

/// Built-in 5×7 bitmap font for printable ASCII, scaled by an integer factor.
/// Characters outside ASCII render as a hollow box.
#[derive(Debug, Clone, Copy)]
pub struct BitmapFont {
    scale: u32,
}

impl BitmapFont {
    pub fn new(scale: u32) -> Self {
        Self {
            scale: scale.max(1),
        }
    }

    /// Closest integer scale for a requested text size in pixels.
    pub fn for_text_size(text_size: f32) -> Self {
        Self::new((text_size / BASE_SIZE).round().max(1.0) as u32)
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    fn advance(&self) -> u32 {
        CELL_W * self.scale
    }
}

impl TextRenderer for BitmapFont {
    fn measure(&self, text: &str) -> u32 {
        text.chars().count() as u32 * self.advance()
    }

    fn line_height(&self) -> u32 {
        CELL_H * self.scale
    }

    fn draw(&self, canvas: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>) {
        let mut pen_x = x;
        for ch in text.chars() {
            self.draw_char(canvas, pen_x, y, ch, color);
            pen_x += self.advance() as i32;
        }
    }
}

impl BitmapFont {
    fn draw_char(&self, canvas: &mut RgbaImage, x: i32, y: i32, ch: char, color: Rgba<u8>) {
        if ch == ' ' {
            return;
        }
        let rows = glyph_rows(ch);
        let (w, h) = canvas.dimensions();
        let s = self.scale as i32;

        for (row_idx, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_COLS {
                if (bits >> (GLYPH_COLS - 1 - col)) & 1 == 0 {
                    continue;
                }
                let px = x + col as i32 * s;
                let py = y + row_idx as i32 * s;
                for dy in 0..s {
                    for dx in 0..s {
                        let (sx, sy) = (px + dx, py + dy);
                        if sx >= 0 && sy >= 0 && (sx as u32) < w && (sy as u32) < h {
                            canvas.get_pixel_mut(sx as u32, sy as u32).blend(&color);
                        }
                    }
                }
            }
        }
    }
}

const MISSING_GLYPH: [u8; 7] = [0b11111, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11111];

fn glyph_rows(ch: char) -> [u8; 7] {
    let code = ch as u32;
    if (0x20..0x7F).contains(&code) {
        GLYPHS[(code - 0x20) as usize]
    } else {
        MISSING_GLYPH
    }
}

// Each row is 5 bits, leftmost pixel in bit 4. Indexed by `ch - 0x20`.
#[rustfmt::skip]
const GLYPHS: [[u8; 7]; 95] = [
    [0b00000,0b00000,0b00000,0b00000,0b00000,0b00000,0b00000], // ' '
    [0b00100,0b00100,0b00100,0b00100,0b00100,0b00000,0b00100], // !
    [0b01010,0b01010,0b01010,0b00000,0b00000,0b00000,0b00000], // "
    [0b01010,0b01010,0b11111,0b01010,0b11111,0b01010,0b01010], // #
    [0b00100,0b01111,0b10100,0b01110,0b00101,0b11110,0b00100], // $
    [0b11000,0b11001,0b00010,0b00100,0b01000,0b10011,0b00011], // %
    [0b01100,0b10010,0b10100,0b01000,0b10101,0b10010,0b01101], // &
    [0b00100,0b00100,0b01000,0b00000,0b00000,0b00000,0b00000], // '
    [0b00010,0b00100,0b01000,0b01000,0b01000,0b00100,0b00010], // (
    [0b01000,0b00100,0b00010,0b00010,0b00010,0b00100,0b01000], // )
    [0b00000,0b00100,0b10101,0b01110,0b10101,0b00100,0b00000], // *
    [0b00000,0b00100,0b00100,0b11111,0b00100,0b00100,0b00000], // +
    [0b00000,0b00000,0b00000,0b00000,0b01100,0b00100,0b01000], // ,
    [0b00000,0b00000,0b00000,0b11111,0b00000,0b00000,0b00000], // -
    [0b00000,0b00000,0b00000,0b00000,0b00000,0b01100,0b01100], // .
    [0b00000,0b00001,0b00010,0b00100,0b01000,0b10000,0b00000], // /
    [0b01110,0b10001,0b10011,0b10101,0b11001,0b10001,0b01110], // 0
    [0b00100,0b01100,0b00100,0b00100,0b00100,0b00100,0b01110], // 1
    [0b01110,0b10001,0b00001,0b00010,0b00100,0b01000,0b11111], // 2
    [0b11111,0b00010,0b00100,0b00010,0b00001,0b10001,0b01110], // 3
    [0b00010,0b00110,0b01010,0b10010,0b11111,0b00010,0b00010], // 4
    [0b11111,0b10000,0b11110,0b00001,0b00001,0b10001,0b01110], // 5
    [0b00110,0b01000,0b10000,0b11110,0b10001,0b10001,0b01110], // 6
    [0b11111,0b00001,0b00010,0b00100,0b01000,0b01000,0b01000], // 7
    [0b01110,0b10001,0b10001,0b01110,0b10001,0b10001,0b01110], // 8
    [0b01110,0b10001,0b10001,0b01111,0b00001,0b00010,0b01100], // 9
    [0b00000,0b01100,0b01100,0b00000,0b01100,0b01100,0b00000], // :
    [0b00000,0b01100,0b01100,0b00000,0b01100,0b00100,0b01000], // ;
    [0b00010,0b00100,0b01000,0b10000,0b01000,0b00100,0b00010], // <
    [0b00000,0b00000,0b11111,0b00000,0b11111,0b00000,0b00000], // =
    [0b01000,0b00100,0b00010,0b00001,0b00010,0b00100,0b01000], // >
    [0b01110,0b10001,0b00001,0b00010,0b00100,0b00000,0b00100], // ?
    [0b01110,0b10001,0b00001,0b01101,0b10101,0b10101,0b01110], // @
    [0b01110,0b10001,0b10001,0b11111,0b10001,0b10001,0b10001], // A
    [0b11110,0b10001,0b10001,0b11110,0b10001,0b10001,0b11110], // B
    [0b01110,0b10001,0b10000,0b10000,0b10000,0b10001,0b01110], // C
    [0b11100,0b10010,0b10001,0b10001,0b10001,0b10010,0b11100], // D
    [0b11111,0b10000,0b10000,0b11110,0b10000,0b10000,0b11111], // E
    [0b11111,0b10000,0b10000,0b11110,0b10000,0b10000,0b10000], // F
    [0b01110,0b10001,0b10000,0b10111,0b10001,0b10001,0b01111], // G
    [0b10001,0b10001,0b10001,0b11111,0b10001,0b10001,0b10001], // H
    [0b01110,0b00100,0b00100,0b00100,0b00100,0b00100,0b01110], // I
    [0b00111,0b00010,0b00010,0b00010,0b00010,0b10010,0b01100], // J
    [0b10001,0b10010,0b10100,0b11000,0b10100,0b10010,0b10001], // K
    [0b10000,0b10000,0b10000,0b10000,0b10000,0b10000,0b11111], // L
    [0b10001,0b11011,0b10101,0b10101,0b10001,0b10001,0b10001], // M
    [0b10001,0b10001,0b11001,0b10101,0b10011,0b10001,0b10001], // N
    [0b01110,0b10001,0b10001,0b10001,0b10001,0b10001,0b01110], // O
    [0b11110,0b10001,0b10001,0b11110,0b10000,0b10000,0b10000], // P
    [0b01110,0b10001,0b10001,0b10001,0b10101,0b10010,0b01101], // Q
    [0b11110,0b10001,0b10001,0b11110,0b10100,0b10010,0b10001], // R
    [0b01111,0b10000,0b10000,0b01110,0b00001,0b00001,0b11110], // S
    [0b11111,0b00100,0b00100,0b00100,0b00100,0b00100,0b00100], // T
    [0b10001,0b10001,0b10001,0b10001,0b10001,0b10001,0b01110], // U
    [0b10001,0b10001,0b10001,0b10001,0b10001,0b01010,0b00100], // V
    [0b10001,0b10001,0b10001,0b10101,0b10101,0b10101,0b01010], // W
    [0b10001,0b10001,0b01010,0b00100,0b01010,0b10001,0b10001], // X
    [0b10001,0b10001,0b10001,0b01010,0b00100,0b00100,0b00100], // Y
    [0b11111,0b00001,0b00010,0b00100,0b01000,0b10000,0b11111], // Z
    [0b01110,0b01000,0b01000,0b01000,0b01000,0b01000,0b01110], // [
    [0b00000,0b10000,0b01000,0b00100,0b00010,0b00001,0b00000], // \
    [0b01110,0b00010,0b00010,0b00010,0b00010,0b00010,0b01110], // ]
    [0b00100,0b01010,0b10001,0b00000,0b00000,0b00000,0b00000], // ^
    [0b00000,0b00000,0b00000,0b00000,0b00000,0b00000,0b11111], // _
    [0b01000,0b00100,0b00010,0b00000,0b00000,0b00000,0b00000], // `
    [0b00000,0b00000,0b01110,0b00001,0b01111,0b10001,0b01111], // a
    [0b10000,0b10000,0b10110,0b11001,0b10001,0b10001,0b11110], // b
    [0b00000,0b00000,0b01110,0b10000,0b10000,0b10001,0b01110], // c
    [0b00001,0b00001,0b01101,0b10011,0b10001,0b10001,0b01111], // d
    [0b00000,0b00000,0b01110,0b10001,0b11111,0b10000,0b01110], // e
    [0b00110,0b01001,0b01000,0b11100,0b01000,0b01000,0b01000], // f
    [0b00000,0b01111,0b10001,0b10001,0b01111,0b00001,0b01110], // g
    [0b10000,0b10000,0b10110,0b11001,0b10001,0b10001,0b10001], // h
    [0b00100,0b00000,0b01100,0b00100,0b00100,0b00100,0b01110], // i
    [0b00010,0b00000,0b00110,0b00010,0b00010,0b10010,0b01100], // j
    [0b10000,0b10000,0b10010,0b10100,0b11000,0b10100,0b10010], // k
    [0b01100,0b00100,0b00100,0b00100,0b00100,0b00100,0b01110], // l
    [0b00000,0b00000,0b11010,0b10101,0b10101,0b10001,0b10001], // m
    [0b00000,0b00000,0b10110,0b11001,0b10001,0b10001,0b10001], // n
    [0b00000,0b00000,0b01110,0b10001,0b10001,0b10001,0b01110], // o
    [0b00000,0b00000,0b11110,0b10001,0b11110,0b10000,0b10000], // p
    [0b00000,0b00000,0b01101,0b10011,0b01111,0b00001,0b00001], // q
    [0b00000,0b00000,0b10110,0b11001,0b10000,0b10000,0b10000], // r
    [0b00000,0b00000,0b01110,0b10000,0b01110,0b00001,0b11110], // s
    [0b01000,0b01000,0b11100,0b01000,0b01000,0b01001,0b00110], // t
    [0b00000,0b00000,0b10001,0b10001,0b10001,0b10011,0b01101], // u
    [0b00000,0b00000,0b10001,0b10001,0b10001,0b01010,0b00100], // v
    [0b00000,0b00000,0b10001,0b10001,0b10101,0b10101,0b01010], // w
    [0b00000,0b00000,0b10001,0b01010,0b00100,0b01010,0b10001], // x
    [0b00000,0b00000,0b10001,0b10001,0b01111,0b00001,0b01110], // y
    [0b00000,0b00000,0b11111,0b00010,0b00100,0b01000,0b11111], // z
    [0b00010,0b00100,0b00100,0b01000,0b00100,0b00100,0b00010], // {
    [0b00100,0b00100,0b00100,0b00100,0b00100,0b00100,0b00100], // |
    [0b01000,0b00100,0b00100,0b00010,0b00100,0b00100,0b01000], // }
    [0b00000,0b00000,0b01000,0b10101,0b00010,0b00000,0b00000], // ~
];
