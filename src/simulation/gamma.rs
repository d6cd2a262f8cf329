use crate::{
    atomics::AtomicReal,
    concurrency::{par_iter_mut0, par_iter_mut1, par_iter_mut2},
    probability::{ordered_pair, pair_positions},
    ActiveIndex, Real,
};

/// Direct-mode gamma resolution.
///
/// Each slot enters holding the pair's expected coalescence count and leaves
/// holding a realizable non-negative integer: stochastic rounding
/// `ceil(p - u)` first, then the physical cap `floor(n[j]/n[k])` (with
/// `n[j] >= n[k]`); the cap must come after the rounding, never before.
/// A pair whose smaller member is already inert contributes no event.
pub fn compute_gamma<F: Real>(
    gamma: &mut [F],
    rand: &[F],
    idx: &ActiveIndex,
    multiplicity: &[u64],
    is_first_in_pair: &[bool],
) {
    let active = idx.len();
    let n_pairs = active / 2;
    assert!(gamma.len() >= n_pairs, "gamma buffer too short");
    assert!(rand.len() >= n_pairs, "need one uniform draw per pair");

    par_iter_mut1(&mut gamma[..n_pairs], |p, g| {
        *g = (*g - rand[p]).ceil();
        if *g <= F::zero() {
            *g = F::zero();
            return;
        }

        let (pos_a, pos_b) = match pair_positions(p, is_first_in_pair, active) {
            Some(pair) => pair,
            None => {
                *g = F::zero();
                return;
            }
        };
        let (j, k) = ordered_pair(idx, multiplicity, pos_a, pos_b);
        if multiplicity[k] == 0 {
            *g = F::zero();
            return;
        }

        let prop = F::from_u64(multiplicity[j] / multiplicity[k]).unwrap_or_else(F::infinity);
        if prop < *g {
            *g = prop;
        }
    });
}

/// Adaptive substep selection: four barrier-separated passes that shrink the
/// per-cell timestep until no pair's effective gamma exceeds its cap.
///
/// `gamma` holds the *expected* event counts for the macro step `dt` (before
/// stochastic rounding). On return every cell's `dt_todo` holds the chosen
/// substep, `gamma` is rescaled to it, `dt_left` is decremented and nonzero
/// substeps are counted.
pub fn adaptive_sdm_gamma<F: Real>(
    gamma: &mut [F],
    idx: &ActiveIndex,
    multiplicity: &[u64],
    cell_id: &[usize],
    is_first_in_pair: &[bool],
    dt: F,
    dt_max: F,
    dt_left: &mut [F],
    dt_todo: &[F::Atomic],
    stats_n_substep: &mut [u32],
) {
    let n_cell = dt_left.len();
    assert!(dt_todo.len() == n_cell, "dt_todo cell count mismatch");
    assert!(stats_n_substep.len() == n_cell, "substep counter cell count mismatch");

    let active = idx.len();
    let n_pairs = active / 2;

    // pass 1: clamp this round's substep to the remaining per-cell budget
    let dt_left_now = &*dt_left;
    par_iter_mut0(n_cell, |c| {
        dt_todo[c].store(F::min(dt_left_now[c], dt_max));
    });

    // pass 2: per cell, the largest common substep that keeps every pair's
    // effective gamma within its cap; the atomic minimum is fully settled by
    // the invocation barrier before pass 3 reads it
    let gamma_now = &*gamma;
    par_iter_mut0(n_pairs, |p| {
        let g = gamma_now[p];
        if g <= F::zero() {
            return;
        }
        let (pos_a, pos_b) = match pair_positions(p, is_first_in_pair, active) {
            Some(pair) => pair,
            None => return,
        };
        let (j, k) = ordered_pair(idx, multiplicity, pos_a, pos_b);
        if multiplicity[k] == 0 {
            return;
        }
        let prop = F::from_u64(multiplicity[j] / multiplicity[k]).unwrap_or_else(F::infinity);
        let dt_optimal = dt * prop / g;
        dt_todo[cell_id[j]].fetch_min(dt_optimal);
    });

    // pass 3: rescale every pair's gamma to the chosen substep
    par_iter_mut1(&mut gamma[..n_pairs], |p, g| {
        if *g == F::zero() {
            return;
        }
        if let Some((pos_a, _)) = pair_positions(p, is_first_in_pair, active) {
            let cid = cell_id[idx.droplet_at(pos_a)];
            *g = *g * dt_todo[cid].load() / dt;
        }
    });

    // pass 4: account the substep
    par_iter_mut2(dt_left, stats_n_substep, |c, left, substeps| {
        let todo = dt_todo[c].load();
        *left = *left - todo;
        if todo > F::zero() {
            *substeps += 1;
        }
    });
}

/// First cell whose remaining time has reached exactly 0, mapped to the
/// corresponding prefix of `cell_start`; with no such cell the full range is
/// returned. Callers use this to restrict subsequent work to still-active
/// cells.
pub fn adaptive_sdm_end<F: Real>(dt_left: &[F], cell_start: &[usize]) -> usize {
    let i = dt_left
        .iter()
        .position(|&left| left == F::zero())
        .unwrap_or(dt_left.len());
    cell_start[i]
}

#[cfg(test)]
use crate::atomics::AtomicF64;

#[test]
fn stochastic_rounding_splits_on_the_fractional_part() {
    let idx = ActiveIndex::new(2);
    let multiplicity = vec![10u64, 10];
    let marks = vec![true, false];

    // u above frac(p): round down
    let mut gamma = vec![0.4f64];
    compute_gamma(&mut gamma, &[0.5], &idx, &multiplicity, &marks);
    assert_eq!(gamma[0], 0.0);

    // u below frac(p): round up
    let mut gamma = vec![0.4f64];
    compute_gamma(&mut gamma, &[0.3], &idx, &multiplicity, &marks);
    assert_eq!(gamma[0], 1.0);

    // zero probability can never produce an event, even at u == 1
    let mut gamma = vec![0.0f64];
    compute_gamma(&mut gamma, &[1.0], &idx, &multiplicity, &marks);
    assert_eq!(gamma[0], 0.0);
}

#[test]
fn gamma_is_capped_after_rounding() {
    let idx = ActiveIndex::new(2);
    let marks = vec![true, false];

    // ceil(2.6 - 0.5) = 3, capped at floor(10/4) = 2
    let mut gamma = vec![2.6f64];
    compute_gamma(&mut gamma, &[0.5], &idx, &[10, 4], &marks);
    assert_eq!(gamma[0], 2.0);

    // storage order does not matter: the smaller multiplicity divides
    let mut gamma = vec![2.6f64];
    compute_gamma(&mut gamma, &[0.5], &idx, &[4, 10], &marks);
    assert_eq!(gamma[0], 2.0);
}

#[test]
fn inert_partner_contributes_no_event() {
    let idx = ActiveIndex::new(2);
    let marks = vec![true, false];
    let mut gamma = vec![5.0f64];
    compute_gamma(&mut gamma, &[0.5], &idx, &[10, 0], &marks);
    assert_eq!(gamma[0], 0.0);
}

#[test]
fn adaptive_passes_choose_and_account_the_substep() {
    let idx = ActiveIndex::new(2);
    let multiplicity = vec![6u64, 2];
    let cell_id = vec![0usize, 0];
    let marks = vec![true, false];

    let dt = 10.0;
    let mut gamma = vec![5.0f64];
    let mut dt_left = vec![10.0f64];
    let dt_todo = vec![AtomicF64::new(0.0)];
    let mut substeps = vec![0u32];

    adaptive_sdm_gamma(
        &mut gamma, &idx, &multiplicity, &cell_id, &marks, dt, 4.0, &mut dt_left, &dt_todo, &mut substeps,
    );

    // pass 1 clamps to dt_max = 4; pass 2's optimum dt*prop/gamma = 6 is
    // larger and leaves the clamp in place
    assert_eq!(dt_todo[0].load(), 4.0);
    // gamma rescaled by dt_todo/dt
    crate::assert_ft_approx_eq(gamma[0], 2.0, 1e-12, || format!("rescaled gamma"));
    assert_eq!(dt_left[0], 6.0);
    assert_eq!(substeps[0], 1);
}

#[test]
fn adaptive_minimum_is_shared_across_a_cell() {
    // two pairs in one cell; the tighter pair dictates the cell substep
    let idx = ActiveIndex::new(4);
    let multiplicity = vec![8u64, 4, 100, 2];
    let cell_id = vec![0usize; 4];
    let marks = vec![true, false, true, false];

    let dt = 1.0;
    // pair 0: prop 2, gamma 8 -> optimum 0.25; pair 1: prop 50, gamma 10 -> 5
    let mut gamma = vec![8.0f64, 10.0];
    let mut dt_left = vec![1.0f64];
    let dt_todo = vec![AtomicF64::new(0.0)];
    let mut substeps = vec![0u32];

    adaptive_sdm_gamma(
        &mut gamma, &idx, &multiplicity, &cell_id, &marks, dt, 1.0, &mut dt_left, &dt_todo, &mut substeps,
    );

    assert_eq!(dt_todo[0].load(), 0.25);
    crate::assert_ft_approx_eq(gamma[0], 2.0, 1e-12, || format!("pair 0"));
    crate::assert_ft_approx_eq(gamma[1], 2.5, 1e-12, || format!("pair 1"));
    assert_eq!(dt_left[0], 0.75);
}

#[test]
fn adaptive_end_returns_the_prefix_of_the_first_finished_cell() {
    let cell_start = vec![0usize, 2, 4, 6];

    assert_eq!(adaptive_sdm_end(&[1.0f64, 0.0, 2.0], &cell_start), 2);
    assert_eq!(adaptive_sdm_end(&[0.0f64, 1.0, 2.0], &cell_start), 0);
    // no finished cell: the full range
    assert_eq!(adaptive_sdm_end(&[1.0f64, 1.0, 2.0], &cell_start), 6);
}
