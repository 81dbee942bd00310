//! Image region checks.

use crate::driver::ImageType;
use crate::error::{Error, Result};

const AXES: [&str; 3] = ["x", "y", "z"];

/// Normalize and check an image region.
///
/// Axes past the image's dimensionality are forced to origin 0 and size 1.
/// A zero region component stands for the full extent of that axis. The
/// origin, the region and their sum are each checked against the extent,
/// and the first violation names its axis.
pub fn validate_region(
    what: &str,
    image_type: ImageType,
    extent: [usize; 3],
    origin: [usize; 3],
    region: [usize; 3],
) -> Result<([usize; 3], [usize; 3])> {
    let dims = image_type.dims();
    let mut origin = origin;
    let mut region = region;
    for axis in 0..3 {
        if axis >= dims {
            origin[axis] = 0;
            region[axis] = 1;
            continue;
        }
        let limit = extent[axis];
        if region[axis] == 0 {
            region[axis] = limit;
        }
        if origin[axis] >= limit {
            return Err(Error::out_of_bounds(what, AXES[axis], origin[axis], limit));
        }
        if region[axis] > limit {
            return Err(Error::out_of_bounds(what, AXES[axis], region[axis], limit));
        }
        let end = origin[axis].saturating_add(region[axis]);
        if end > limit {
            return Err(Error::out_of_bounds(what, AXES[axis], end, limit));
        }
    }
    Ok((origin, region))
}

/// Check a byte range against a buffer size.
pub fn validate_range(what: &str, offset: usize, size: usize, limit: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::invalid_argument(format!("{what}: empty transfer")));
    }
    if offset >= limit {
        return Err(Error::out_of_bounds(what, "offset", offset, limit));
    }
    let end = offset.saturating_add(size);
    if end > limit {
        return Err(Error::out_of_bounds(what, "offset + size", end, limit));
    }
    Ok(())
}
