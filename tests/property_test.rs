use proptest::prelude::*;
use veda_cl::dispatch::{grid_1d, grid_2d, grid_3d, ExecutionGrid};
use veda_cl::error::ErrorKind;
use veda_cl::memory::{MemFlags, ValidatedFlags};

fn limits() -> impl Strategy<Value = [usize; 3]> {
    (1usize..=2048, 1usize..=1024, 1usize..=128).prop_map(|(x, y, z)| [x, y, z])
}

fn covers(grid: &ExecutionGrid, problem: &[usize], max_items: [usize; 3]) {
    for (axis, &n) in problem.iter().enumerate() {
        assert!(grid.local[axis] >= 1);
        assert!(grid.local[axis] <= max_items[axis], "axis {axis}: {grid:?}");
        assert_eq!(grid.global[axis] % grid.local[axis], 0, "axis {axis}: {grid:?}");
        assert!(grid.global[axis] >= n, "axis {axis}: {grid:?}");
    }
}

proptest! {
    #[test]
    fn grid_1d_covers_problem(n in 0usize..10_000_000, preferred in 1usize..=4096, max_items in limits()) {
        let grid = grid_1d(n, preferred, max_items).unwrap();
        covers(&grid, &[n], max_items);
        prop_assert!(grid.local[0] <= preferred);
    }

    #[test]
    fn grid_2d_covers_problem(
        x in 0usize..100_000,
        y in 0usize..100_000,
        preferred in 1usize..=4096,
        max_items in limits(),
    ) {
        let grid = grid_2d([x, y], preferred, max_items).unwrap();
        covers(&grid, &[x, y], max_items);
        prop_assert_eq!(grid.group_size(), grid_1d(x, preferred, max_items).unwrap().local[0]);
    }

    #[test]
    fn grid_3d_covers_problem(
        problem in prop::array::uniform3(0usize..4096),
        preferred in 1usize..=4096,
        max_items in limits(),
    ) {
        let grid = grid_3d(problem, preferred, max_items).unwrap();
        covers(&grid, &problem, max_items);
        prop_assert!(grid.check(max_items, preferred.max(grid.group_size())).is_ok());
    }

    #[test]
    fn grid_1d_near_usize_max_covers_or_fails(
        gap in 0usize..=8192,
        preferred in 1usize..=4096,
        max_items in limits(),
    ) {
        let n = usize::MAX - gap;
        match grid_1d(n, preferred, max_items) {
            Ok(grid) => covers(&grid, &[n], max_items),
            Err(err) => {
                prop_assert_eq!(err.kind(), ErrorKind::Bounds);
                // Only fails when the next whole group is past the end.
                let local = grid_1d(0, preferred, max_items).unwrap().local[0];
                prop_assert!(n % local != 0);
            }
        }
    }

    #[test]
    fn derived_flags_never_conflict(
        bits in prop::collection::vec(any::<bool>(), 8),
        has_data in any::<bool>(),
    ) {
        let mut requested = MemFlags::default();
        if bits[0] { requested = MemFlags::read_only(); }
        if bits[1] { requested = MemFlags::write_only(); }
        if bits[2] { requested = requested.with_host_memory(); }
        if bits[3] { requested = requested.with_copy_on_use(); }
        if bits[4] { requested = requested.with_read_back(); }
        if bits[5] { requested = requested.without_initial_copy(); }
        if bits[6] { requested = requested.with_delete_after_use(); }
        if bits[7] { requested = requested.with_manual_graphics_sharing(); }

        let flags = ValidatedFlags::derive(requested, has_data);
        prop_assert!(!(flags.initial_copy && flags.use_host_memory));
        prop_assert!(has_data || !(flags.copy_on_use || flags.read_back));
    }
}
