//! Execution-grid sizing.
//!
//! The work-group size is capped by both the kernel's preferred size and the
//! device's per-dimension work-item limit. The global size is rounded up to
//! a whole number of work-groups, so a grid usually covers more invocations
//! than the problem has items; kernels mask the excess themselves.

use crate::error::Error;

const AXES: [&str; 3] = ["x", "y", "z"];

/// A (global, local) pair ready to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionGrid {
    pub dims: u32,
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl ExecutionGrid {
    pub fn new_1d(global: usize, local: usize) -> Self {
        Self {
            dims: 1,
            global: [global, 1, 1],
            local: [local, 1, 1],
        }
    }

    pub fn new_2d(global: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            dims: 2,
            global: [global[0], global[1], 1],
            local: [local[0], local[1], 1],
        }
    }

    pub fn new_3d(global: [usize; 3], local: [usize; 3]) -> Self {
        Self {
            dims: 3,
            global,
            local,
        }
    }

    /// Total number of invocations.
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }

    /// Invocations per work-group.
    pub fn group_size(&self) -> usize {
        self.local.iter().product()
    }

    /// Number of work-groups along each axis.
    pub fn groups(&self) -> [usize; 3] {
        let mut groups = [1; 3];
        for axis in 0..3 {
            groups[axis] = self.global[axis] / self.local[axis].max(1);
        }
        groups
    }

    /// Check the grid against device limits, naming the first violation.
    pub fn check(&self, max_items: [usize; 3], max_group: usize) -> Result<(), String> {
        if !(1..=3).contains(&self.dims) {
            return Err(format!("invalid dimension count {}", self.dims));
        }
        for axis in 0..3 {
            let local = self.local[axis];
            if local == 0 {
                return Err(format!("local size of axis {axis} is zero"));
            }
            if local > max_items[axis].max(1) {
                return Err(format!(
                    "local size {local} exceeds device limit {} on axis {axis}",
                    max_items[axis]
                ));
            }
            if self.global[axis] % local != 0 {
                return Err(format!(
                    "global size {} is not a multiple of local size {local} on axis {axis}",
                    self.global[axis]
                ));
            }
        }
        if self.group_size() > max_group.max(1) {
            return Err(format!(
                "work-group size {} exceeds device limit {max_group}",
                self.group_size()
            ));
        }
        Ok(())
    }
}

fn round_up(n: usize, multiple: usize, axis: usize) -> crate::error::Result<usize> {
    n.max(1)
        .div_ceil(multiple)
        .checked_mul(multiple)
        .ok_or_else(|| Error::out_of_bounds("execution grid", AXES[axis], n, usize::MAX))
}

fn target_local(preferred: usize, max_items: [usize; 3]) -> usize {
    preferred.max(1).min(max_items[0].max(1))
}

/// Repeatedly halve the largest axis and double the smallest while the
/// doubled axis stays within its limit and no larger than the halved one.
fn balance(local: &mut [usize], max_items: &[usize]) {
    loop {
        let mut hi = 0;
        let mut lo = 0;
        for axis in 0..local.len() {
            if local[axis] > local[hi] {
                hi = axis;
            }
            if local[axis] <= local[lo] {
                lo = axis;
            }
        }
        if hi == lo || local[hi] % 2 != 0 {
            break;
        }
        let half = local[hi] / 2;
        let doubled = local[lo] * 2;
        if doubled > max_items[lo].max(1) || half < doubled {
            break;
        }
        local[hi] = half;
        local[lo] = doubled;
    }
}

/// Size a one-dimensional grid for `problem` items.
///
/// Fails when rounding `problem` up to a whole work-group overflows.
pub fn grid_1d(
    problem: usize,
    preferred: usize,
    max_items: [usize; 3],
) -> crate::error::Result<ExecutionGrid> {
    let local = target_local(preferred, max_items);
    Ok(ExecutionGrid::new_1d(round_up(problem, local, 0)?, local))
}

/// Size a two-dimensional grid, spreading the work-group over both axes.
pub fn grid_2d(
    problem: [usize; 2],
    preferred: usize,
    max_items: [usize; 3],
) -> crate::error::Result<ExecutionGrid> {
    let mut local = [target_local(preferred, max_items), 1];
    balance(&mut local, &max_items[..2]);
    Ok(ExecutionGrid::new_2d(
        [round_up(problem[0], local[0], 0)?, round_up(problem[1], local[1], 1)?],
        local,
    ))
}

/// Size a three-dimensional grid, spreading the work-group over all axes.
pub fn grid_3d(
    problem: [usize; 3],
    preferred: usize,
    max_items: [usize; 3],
) -> crate::error::Result<ExecutionGrid> {
    let mut local = [target_local(preferred, max_items), 1, 1];
    balance(&mut local, &max_items);
    Ok(ExecutionGrid::new_3d(
        [
            round_up(problem[0], local[0], 0)?,
            round_up(problem[1], local[1], 1)?,
            round_up(problem[2], local[2], 2)?,
        ],
        local,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: [usize; 3] = [1024, 1024, 64];

    #[test]
    fn test_1d_rounds_up() {
        let grid = grid_1d(1000, 256, LIMITS).unwrap();
        assert_eq!(grid.local[0], 256);
        assert_eq!(grid.global[0], 1024);
        assert_eq!(grid.dims, 1);
    }

    #[test]
    fn test_1d_capped_by_device() {
        let grid = grid_1d(10, 512, [128, 128, 128]).unwrap();
        assert_eq!(grid.local[0], 128);
        assert_eq!(grid.global[0], 128);
    }

    #[test]
    fn test_1d_zero_problem_still_dispatchable() {
        let grid = grid_1d(0, 64, LIMITS).unwrap();
        assert_eq!(grid.global[0], 64);
        assert!(grid.check(LIMITS, 1024).is_ok());
    }

    #[test]
    fn test_2d_balances_square() {
        let grid = grid_2d([640, 480], 256, LIMITS).unwrap();
        assert_eq!(grid.local, [16, 16, 1]);
        assert_eq!(grid.global, [640, 480, 1]);
    }

    #[test]
    fn test_2d_respects_second_axis_limit() {
        let grid = grid_2d([100, 100], 256, [1024, 4, 1]).unwrap();
        assert_eq!(grid.local, [64, 4, 1]);
        assert_eq!(grid.group_size(), 256);
    }

    #[test]
    fn test_2d_odd_target_stops() {
        let grid = grid_2d([100, 100], 1000, LIMITS).unwrap();
        assert_eq!(grid.local, [125, 8, 1]);
        assert_eq!(grid.group_size(), 1000);
    }

    #[test]
    fn test_3d_preserves_product() {
        let grid = grid_3d([33, 33, 33], 256, LIMITS).unwrap();
        assert_eq!(grid.group_size(), 256);
        for axis in 0..3 {
            assert!(grid.local[axis] <= LIMITS[axis]);
            assert_eq!(grid.global[axis] % grid.local[axis], 0);
            assert!(grid.global[axis] >= 33);
        }
    }

    #[test]
    fn test_overflowing_problem_rejected() {
        let err = grid_1d(usize::MAX - 10, 256, LIMITS).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfBounds { axis: "x", value, limit: usize::MAX, .. } if value == usize::MAX - 10
        ));
        let err = grid_2d([16, usize::MAX], 256, LIMITS).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { axis: "y", .. }));
        // Already a whole number of groups.
        let grid = grid_1d(usize::MAX - 255, 256, LIMITS).unwrap();
        assert_eq!(grid.global[0], usize::MAX - 255);
    }

    #[test]
    fn test_check_rejects_bad_grid() {
        let grid = ExecutionGrid::new_1d(100, 64);
        assert!(grid.check(LIMITS, 1024).is_err());
        let grid = ExecutionGrid::new_1d(2048, 2048);
        assert!(grid.check(LIMITS, 4096).is_err());
        assert_eq!(ExecutionGrid::new_2d([64, 64], [8, 8]).groups(), [8, 8, 1]);
    }
}
