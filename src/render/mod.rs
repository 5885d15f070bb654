//! Pixel work: orientation, scaling, text and overlay compositing.
//!
//! Every function here takes its input by reference and returns a newly
//! allocated image.

pub mod compose;
pub mod font;
pub mod lines;
pub mod orientation;
pub mod scale;

pub use compose::{ComposedImage, OverlayComposer, PanelGeometry, PanelRect, wrap_text};
pub use font::{BitmapFont, TextRenderer, TrueTypeFont};
pub use lines::OverlayLines;
pub use orientation::{Orientation, normalize};
pub use scale::{scale, target_dimensions};
