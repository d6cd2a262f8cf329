use crate::{concurrency::par_iter_mut1, ActiveIndex, VI};

/// Flat cell id from a multi-dimensional cell origin and a stride vector:
/// `cell_id[i] = sum_d cell_origin[i][d] * strides[d]`.
pub fn recalculate_cell_ids<const D: usize>(cell_id: &mut [usize], cell_origin: &[VI<D>], strides: VI<D>) {
    assert!(cell_id.len() == cell_origin.len(), "cell id / cell origin length mismatch");

    par_iter_mut1(cell_id, |i, id| {
        let flat = cell_origin[i].dot(&strides);
        assert!(flat >= 0, "cell origin {:?} maps outside the grid", cell_origin[i]);
        *id = flat as usize;
    });
}

/// Re-sorts the active prefix of `idx` by cell id and rebuilds the CSR range
/// table `cell_start` (length `n_cell + 1`).
///
/// Every entry is first set to the sentinel `n_sd`; with at least two active
/// droplets the table is then fully established: cells up to and including
/// the first droplet's cell start at 0, each cell transition back-fills the
/// empty cells in between with the transition position, and cells behind the
/// last droplet's cell are closed with the active count. The resulting table
/// is non-decreasing with `cell_start[n_cell]` equal to the active count.
///
/// With fewer than two active droplets no fill pass runs at all and the
/// table stays entirely sentinel-valued (observed behavior of the reference
/// design, preserved); callers skip the step in that case and must not
/// consume the table.
///
/// A single sparse cell-id gap makes one transition's back-fill proportional
/// to the gap width; cost is O(active + n_cell) overall, this is a
/// performance caveat only.
pub fn sort_by_cell_id_and_update_cell_start(
    idx: &mut ActiveIndex,
    cell_id: &[usize],
    cell_start: &mut [usize],
) {
    let n_sd = idx.capacity();
    let n_cell = cell_start.len() - 1;

    idx.sort_active_by_cell(cell_id);

    for entry in cell_start.iter_mut() {
        *entry = n_sd;
    }

    let active = idx.len();
    if active < 2 {
        return;
    }

    let first_cell = cell_id[idx.droplet_at(0)];
    assert!(first_cell < n_cell, "cell id {} outside the {}-cell grid", first_cell, n_cell);
    for entry in cell_start[..=first_cell].iter_mut() {
        *entry = 0;
    }

    for i in 0..active - 1 {
        let curr = cell_id[idx.droplet_at(i)];
        let next = cell_id[idx.droplet_at(i + 1)];
        debug_assert!(curr <= next);
        assert!(next < n_cell, "cell id {} outside the {}-cell grid", next, n_cell);
        for entry in cell_start[curr + 1..=next].iter_mut() {
            *entry = i + 1;
        }
    }

    let last_cell = cell_id[idx.droplet_at(active - 1)];
    for entry in cell_start[last_cell + 1..=n_cell].iter_mut() {
        *entry = active;
    }
}

#[test]
fn cell_ids_from_origins_and_strides() {
    use crate::vec2i;

    let origins = vec![vec2i(0, 0), vec2i(1, 0), vec2i(0, 1), vec2i(2, 1)];
    let strides = vec2i(1, 3);
    let mut cell_id = vec![0; 4];
    recalculate_cell_ids(&mut cell_id, &origins, strides);
    assert_eq!(cell_id, vec![0, 1, 3, 5]);
}

#[test]
fn cell_start_covers_empty_and_occupied_cells() {
    // droplets in cells [0, 0, 2, 2, 2, 5] over a 6-cell grid
    let cell_id = vec![0, 0, 2, 2, 2, 5];
    let mut idx = ActiveIndex::new(6);
    let mut cell_start = vec![0; 7];
    sort_by_cell_id_and_update_cell_start(&mut idx, &cell_id, &mut cell_start);

    assert_eq!(cell_start, vec![0, 2, 2, 5, 5, 5, 6]);

    // non-decreasing, closed by the active count
    for c in 0..6 {
        assert!(cell_start[c] <= cell_start[c + 1]);
    }
    assert_eq!(cell_start[6], idx.len());
}

#[test]
fn cell_start_leading_empty_cells_start_at_zero() {
    let cell_id = vec![3, 3, 4];
    let mut idx = ActiveIndex::new(3);
    let mut cell_start = vec![0; 6];
    sort_by_cell_id_and_update_cell_start(&mut idx, &cell_id, &mut cell_start);

    assert_eq!(cell_start, vec![0, 0, 0, 0, 2, 3]);
}

#[test]
fn cell_start_restores_cell_order_after_compaction() {
    // active order scrambled by an id-ordered compaction sort; the rebuild
    // re-sorts by cell and the table matches the new prefix
    let cell_id = vec![2, 0, 1, 0];
    let mut idx = ActiveIndex::new(4);
    let mut cell_start = vec![0; 4];
    sort_by_cell_id_and_update_cell_start(&mut idx, &cell_id, &mut cell_start);

    let prefix: Vec<usize> = (0..idx.len()).map(|p| idx.droplet_at(p)).collect();
    assert_eq!(prefix, vec![1, 3, 2, 0]);
    assert_eq!(cell_start, vec![0, 2, 3, 4]);
}

#[test]
fn degenerate_active_count_leaves_table_sentinel_valued() {
    let cell_id = vec![0, 1];
    let mut idx = ActiveIndex::new(2);
    idx.remove_zero_or_flagged(&[3, 0], None, 2);
    assert_eq!(idx.len(), 1);

    let mut cell_start = vec![0; 3];
    sort_by_cell_id_and_update_cell_start(&mut idx, &cell_id, &mut cell_start);
    assert_eq!(cell_start, vec![2, 2, 2]);
}
