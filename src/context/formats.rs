//! Resolution of abstract pixel formats to native image formats.

use crate::driver::{ChannelOrder, ChannelType, ImageFormat};
use std::collections::HashMap;
use tracing::debug;

/// Element type of one image channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Unorm8,
    Unorm16,
    Snorm8,
    Snorm16,
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Half,
    Float,
}

impl ElementType {
    pub const ALL: [ElementType; 12] = [
        ElementType::Unorm8,
        ElementType::Unorm16,
        ElementType::Snorm8,
        ElementType::Snorm16,
        ElementType::Int8,
        ElementType::Int16,
        ElementType::Int32,
        ElementType::Uint8,
        ElementType::Uint16,
        ElementType::Uint32,
        ElementType::Half,
        ElementType::Float,
    ];

    pub fn channel_type(self) -> ChannelType {
        match self {
            ElementType::Unorm8 => ChannelType::UnormInt8,
            ElementType::Unorm16 => ChannelType::UnormInt16,
            ElementType::Snorm8 => ChannelType::SnormInt8,
            ElementType::Snorm16 => ChannelType::SnormInt16,
            ElementType::Int8 => ChannelType::SignedInt8,
            ElementType::Int16 => ChannelType::SignedInt16,
            ElementType::Int32 => ChannelType::SignedInt32,
            ElementType::Uint8 => ChannelType::UnsignedInt8,
            ElementType::Uint16 => ChannelType::UnsignedInt16,
            ElementType::Uint32 => ChannelType::UnsignedInt32,
            ElementType::Half => ChannelType::HalfFloat,
            ElementType::Float => ChannelType::Float,
        }
    }

    pub fn is_float(self) -> bool {
        self.channel_type().is_float()
    }
}

/// Channel layout requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    R,
    Rg,
    Rgb,
    Rgba,
}

impl ChannelLayout {
    pub const ALL: [ChannelLayout; 4] = [
        ChannelLayout::R,
        ChannelLayout::Rg,
        ChannelLayout::Rgb,
        ChannelLayout::Rgba,
    ];

    /// Native channel orders to try, best first. Wider layouts hold the
    /// requested channels when the exact one is missing.
    pub fn candidates(self) -> &'static [ChannelOrder] {
        match self {
            ChannelLayout::R => &[ChannelOrder::R, ChannelOrder::Rg, ChannelOrder::Rgba],
            ChannelLayout::Rg => &[ChannelOrder::Rg, ChannelOrder::Rgba],
            ChannelLayout::Rgb => &[ChannelOrder::Rgb, ChannelOrder::Rgba],
            ChannelLayout::Rgba => &[ChannelOrder::Rgba, ChannelOrder::Bgra],
        }
    }
}

/// Best native format per (element type, layout) for one context.
#[derive(Debug, Clone, Default)]
pub struct FormatTable {
    supported: Vec<ImageFormat>,
    best: HashMap<(ElementType, ChannelLayout), ImageFormat>,
}

impl FormatTable {
    /// A table with nothing resolved, for contexts without usable formats.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Check each candidate against `supported`.
    ///
    /// With `skip_small_float` set, one and two channel float formats are
    /// treated as missing even if reported: AMD contexts holding both a CPU
    /// and a GPU advertise them but cannot create them.
    pub fn build(supported: &[ImageFormat], skip_small_float: bool) -> Self {
        let mut best = HashMap::new();
        for element in ElementType::ALL {
            for layout in ChannelLayout::ALL {
                let found = layout.candidates().iter().copied().find_map(|order| {
                    let format = ImageFormat::new(order, element.channel_type());
                    let unreliable = skip_small_float
                        && element.is_float()
                        && matches!(order, ChannelOrder::R | ChannelOrder::Rg);
                    if unreliable {
                        debug!("skipping over-reported format {format}");
                        return None;
                    }
                    supported.contains(&format).then_some(format)
                });
                if let Some(format) = found {
                    best.insert((element, layout), format);
                }
            }
        }
        Self {
            supported: supported.to_vec(),
            best,
        }
    }

    pub fn supported(&self) -> &[ImageFormat] {
        &self.supported
    }

    pub fn resolve(&self, element: ElementType, layout: ChannelLayout) -> Option<ImageFormat> {
        self.best.get(&(element, layout)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::default_image_formats;

    #[test]
    fn test_exact_match_preferred() {
        let table = FormatTable::build(&default_image_formats(), false);
        assert_eq!(
            table.resolve(ElementType::Float, ChannelLayout::R),
            Some(ImageFormat::new(ChannelOrder::R, ChannelType::Float))
        );
    }

    #[test]
    fn test_rgb_widens_to_rgba() {
        let table = FormatTable::build(&default_image_formats(), false);
        assert_eq!(
            table.resolve(ElementType::Unorm8, ChannelLayout::Rgb),
            Some(ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8))
        );
    }

    #[test]
    fn test_small_float_override() {
        let table = FormatTable::build(&default_image_formats(), true);
        assert_eq!(
            table.resolve(ElementType::Float, ChannelLayout::R),
            Some(ImageFormat::new(ChannelOrder::Rgba, ChannelType::Float))
        );
        assert_eq!(
            table.resolve(ElementType::Half, ChannelLayout::Rg),
            Some(ImageFormat::new(ChannelOrder::Rgba, ChannelType::HalfFloat))
        );
        // Integer formats are unaffected.
        assert_eq!(
            table.resolve(ElementType::Uint8, ChannelLayout::R),
            Some(ImageFormat::new(ChannelOrder::R, ChannelType::UnsignedInt8))
        );
    }

    #[test]
    fn test_missing_format() {
        let table = FormatTable::build(&[], false);
        assert!(table.is_empty());
        assert!(table.resolve(ElementType::Float, ChannelLayout::Rgba).is_none());
    }
}
