//! EXIF metadata reading and writing.
//!
//! - [`read_tags`] reads make/model/software, dates, orientation and GPS via nom-exif.
//! - [`write_tags`] (behind the [`TagWriter`] seam) stamps a [`TagSet`] onto a finished JPEG or PNG in place,
//!   using little_exif to build the EXIF block and img-parts to splice it in.

mod reader;
mod writer;

pub use reader::{ExifData, read_orientation, read_tags};
pub use writer::{ExifTagWriter, TagSet, TagWriter, WriteResult, write_tags};

/// EXIF date/time layout (`yyyy:MM:dd HH:mm:ss`).
pub const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";
