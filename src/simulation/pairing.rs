use crate::{concurrency::par_iter_mut1, ActiveIndex, Real};

/// Pairing collaborator: permutes the active order inside each cell and
/// marks which positions begin a pair.
///
/// Guarantees required from every implementation: the permutation stays
/// within cells (the cell-sorted order of `idx` is preserved), marked pairs
/// are `(i, i + 1)` within one cell, and a cell with an odd active count
/// leaves exactly one element unpaired.
pub trait Pairer<F: Real> {
    fn toss_pairs(
        &self,
        u01: &[F],
        idx: &mut ActiveIndex,
        cell_id: &[usize],
        cell_start: &[usize],
        is_first_in_pair: &mut [bool],
    );
}

/// Reference pairer: per-cell Fisher-Yates shuffle driven by the supplied
/// uniform draws, followed by even-offset pair marking.
pub struct ShufflePairer;

impl<F: Real> Pairer<F> for ShufflePairer {
    fn toss_pairs(
        &self,
        u01: &[F],
        idx: &mut ActiveIndex,
        cell_id: &[usize],
        cell_start: &[usize],
        is_first_in_pair: &mut [bool],
    ) {
        let active = idx.len();
        assert!(u01.len() >= active, "need one uniform draw per active position");
        assert!(is_first_in_pair.len() >= active, "pair marker buffer too short");

        let n_cell = cell_start.len() - 1;
        for c in 0..n_cell {
            let start = cell_start[c];
            let end = cell_start[c + 1];
            for i in (start + 1..end).rev() {
                let span = i - start + 1;
                // draw in (0, 1] -> ceil(u * span) in 1..=span
                let draw = u01[i].to_f64().unwrap_or(1.0);
                let offset = ((draw * span as f64).ceil() as usize).clamp(1, span) - 1;
                idx.swap(i, start + offset);
            }
        }

        let idx_ref = &*idx;
        par_iter_mut1(is_first_in_pair, |i, marker| {
            *marker = if i + 1 < active {
                let a = idx_ref.droplet_at(i);
                let b = idx_ref.droplet_at(i + 1);
                let cell = cell_id[a];
                cell_id[b] == cell && (i - cell_start[cell]) % 2 == 0
            } else {
                false
            };
        });
    }
}

#[cfg(test)]
fn pairing_fixture(cell_id: &[usize], n_cell: usize) -> (ActiveIndex, Vec<usize>) {
    use crate::sort_by_cell_id_and_update_cell_start;

    let mut idx = ActiveIndex::new(cell_id.len());
    let mut cell_start = vec![0; n_cell + 1];
    sort_by_cell_id_and_update_cell_start(&mut idx, cell_id, &mut cell_start);
    (idx, cell_start)
}

#[test]
fn pairs_never_cross_cell_boundaries() {
    use crate::{ChaChaStream, RandomStream};

    let cell_id = vec![0, 0, 0, 1, 1, 2, 2, 2, 2];
    let (mut idx, cell_start) = pairing_fixture(&cell_id, 3);

    let mut u01 = vec![0.0f64; 9];
    ChaChaStream::seeded(3).fill_uniform(&mut u01);
    let mut marks = vec![false; 9];
    ShufflePairer.toss_pairs(&u01, &mut idx, &cell_id, &cell_start, &mut marks);

    let mut pairs = 0;
    for i in 0..9 {
        if marks[i] {
            pairs += 1;
            assert_eq!(cell_id[idx.droplet_at(i)], cell_id[idx.droplet_at(i + 1)]);
        }
    }
    // cells of size 3, 2 and 4: one pair, one pair, two pairs
    assert_eq!(pairs, 4);
}

#[test]
fn shuffle_preserves_cell_sorted_order_and_id_set() {
    use crate::{ChaChaStream, RandomStream};

    let cell_id = vec![1, 0, 1, 0, 1, 1];
    let (mut idx, cell_start) = pairing_fixture(&cell_id, 2);

    let mut u01 = vec![0.0f64; 6];
    ChaChaStream::seeded(11).fill_uniform(&mut u01);
    let mut marks = vec![false; 6];
    ShufflePairer.toss_pairs(&u01, &mut idx, &cell_id, &cell_start, &mut marks);

    let prefix: Vec<usize> = (0..idx.len()).map(|p| idx.droplet_at(p)).collect();
    for w in prefix.windows(2) {
        assert!(cell_id[w[0]] <= cell_id[w[1]]);
    }
    let mut sorted = prefix.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn unit_draws_leave_order_untouched() {
    let cell_id = vec![0, 0, 0, 0];
    let (mut idx, cell_start) = pairing_fixture(&cell_id, 1);

    let u01 = vec![1.0f64; 4];
    let mut marks = vec![false; 4];
    ShufflePairer.toss_pairs(&u01, &mut idx, &cell_id, &cell_start, &mut marks);

    let prefix: Vec<usize> = (0..4).map(|p| idx.droplet_at(p)).collect();
    assert_eq!(prefix, vec![0, 1, 2, 3]);
    assert_eq!(marks, vec![true, false, true, false]);
}

#[test]
fn odd_cell_count_leaves_exactly_one_unpaired() {
    let cell_id = vec![0, 0, 0, 0, 0];
    let (mut idx, cell_start) = pairing_fixture(&cell_id, 1);

    let u01 = vec![1.0f64; 5];
    let mut marks = vec![false; 5];
    ShufflePairer.toss_pairs(&u01, &mut idx, &cell_id, &cell_start, &mut marks);

    assert_eq!(marks, vec![true, false, true, false, false]);
}
