//! Emulated graphics objects for interop testing.
//!
//! A share-group stands in for a windowing layer's rendering context. Each
//! graphics object owns host storage that compute memory objects wrap
//! directly, so kernel writes are visible through
//! [`HostDriver::graphics_contents`](super::HostDriver::graphics_contents).

use crate::driver::{ImageDesc, ImageFormat, ImageType, ShareGroup};
use crate::memory::HostMemory;

/// What kind of graphics object a handle names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsKind {
    Buffer { size: usize },
    Texture { width: usize, height: usize, format: ImageFormat },
    Renderbuffer { width: usize, height: usize, format: ImageFormat },
}

impl GraphicsKind {
    pub fn byte_size(&self) -> usize {
        match *self {
            GraphicsKind::Buffer { size } => size,
            GraphicsKind::Texture {
                width,
                height,
                format,
            }
            | GraphicsKind::Renderbuffer {
                width,
                height,
                format,
            } => width * height * format.pixel_size(),
        }
    }

    /// Shape of the object when wrapped as a compute image.
    pub fn image_desc(&self) -> Option<ImageDesc> {
        match *self {
            GraphicsKind::Buffer { .. } => None,
            GraphicsKind::Texture {
                width,
                height,
                format,
            }
            | GraphicsKind::Renderbuffer {
                width,
                height,
                format,
            } => Some(ImageDesc {
                image_type: ImageType::Image2D,
                extent: [width, height, 1],
                format,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GraphicsEntry {
    pub(crate) group: ShareGroup,
    pub(crate) kind: GraphicsKind,
    pub(crate) data: HostMemory,
}

impl GraphicsEntry {
    pub(crate) fn new(group: ShareGroup, kind: GraphicsKind) -> Self {
        Self {
            group,
            kind,
            data: HostMemory::zeroed(kind.byte_size()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ChannelOrder, ChannelType};

    #[test]
    fn test_texture_shape() {
        let format = ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8);
        let kind = GraphicsKind::Texture {
            width: 8,
            height: 4,
            format,
        };
        assert_eq!(kind.byte_size(), 128);
        let desc = kind.image_desc().unwrap();
        assert_eq!(desc.extent, [8, 4, 1]);
        assert_eq!(desc.image_type, ImageType::Image2D);
        assert!(GraphicsKind::Buffer { size: 16 }.image_desc().is_none());
    }
}
