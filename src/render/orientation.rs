use image::DynamicImage;

/// Rotation needed to bring stored pixels upright.
///
/// Only the four pure rotations are recognized. Mirrored EXIF values
/// (2, 4, 5, 7), unknown values and a missing tag all map to `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    /// Map an EXIF `Orientation` value (0x0112) to a rotation.
    pub fn from_exif(value: Option<u32>) -> Self {
        match value {
            Some(6) => Self::Rotate90,
            Some(3) => Self::Rotate180,
            Some(8) => Self::Rotate270,
            _ => Self::Normal,
        }
    }

    /// Clockwise rotation in degrees.
    pub fn degrees(self) -> u16 {
        match self {
            Self::Normal => 0,
            Self::Rotate90 => 90,
            Self::Rotate180 => 180,
            Self::Rotate270 => 270,
        }
    }
}

/// Return an upright copy of `img`. The input is never modified.
pub fn normalize(img: &DynamicImage, orientation: Orientation) -> DynamicImage {
    log::debug!("Normalizing orientation: {}°", orientation.degrees());
    match orientation {
        Orientation::Normal => img.clone(),
        Orientation::Rotate90 => img.rotate90(),
        Orientation::Rotate180 => img.rotate180(),
        Orientation::Rotate270 => img.rotate270(),
    }
}
