use crate::{concurrency::par_iter_mut1, ActiveIndex, CollisionKernelTrait, Real};

/// Positions of pair slot `p` within the active order, or `None` if the slot
/// holds no pair this step.
///
/// Slot `p` covers positions `2p`/`2p+1`; when an odd-count cell shifts the
/// marked start to `2p + 1`, the pair is `(2p+1, 2p+2)`. At most one of the
/// two positions can be marked (pairs never overlap).
pub fn pair_positions(p: usize, is_first_in_pair: &[bool], active: usize) -> Option<(usize, usize)> {
    let base = 2 * p;
    if base + 1 < active && is_first_in_pair[base] {
        Some((base, base + 1))
    } else if base + 2 < active && is_first_in_pair[base + 1] {
        Some((base + 1, base + 2))
    } else {
        None
    }
}

/// Droplet ids of a pair ordered so the first carries the larger
/// multiplicity; ties keep position order.
pub fn ordered_pair(idx: &ActiveIndex, multiplicity: &[u64], pos_a: usize, pos_b: usize) -> (usize, usize) {
    let a = idx.droplet_at(pos_a);
    let b = idx.droplet_at(pos_b);
    if multiplicity[b] > multiplicity[a] {
        (b, a)
    } else {
        (a, b)
    }
}

/// Stage A of the probability evaluation: raw per-pair collision rates from
/// the physical kernel, evaluated on the pair's ordered reference radii.
/// Slots without a pair stay at zero.
pub fn evaluate_pairwise_rates<F: Real>(
    kernel: &(impl CollisionKernelTrait<F> + Sync),
    radii: &[F],
    idx: &ActiveIndex,
    is_first_in_pair: &[bool],
    prob: &mut [F],
) {
    let active = idx.len();
    let n_pairs = active / 2;
    assert!(prob.len() >= n_pairs, "probability buffer too short");

    par_iter_mut1(prob, |p, value| {
        *value = F::zero();
        if let Some((pos_a, pos_b)) = pair_positions(p, is_first_in_pair, active) {
            let ra = radii[idx.droplet_at(pos_a)];
            let rb = radii[idx.droplet_at(pos_b)];
            let (r, r_s) = if ra >= rb { (ra, rb) } else { (rb, ra) };
            *value = kernel.pairwise_rate(r, r_s);
        }
    });
}

/// Optional stage between kernel evaluation and normalization: scale each
/// pair's rate by the larger multiplicity of the pair, turning the
/// droplet-pair rate into the expected collision count of the two
/// superdroplet populations.
pub fn scale_by_max_multiplicity<F: Real>(
    prob: &mut [F],
    idx: &ActiveIndex,
    multiplicity: &[u64],
    is_first_in_pair: &[bool],
) {
    let active = idx.len();
    par_iter_mut1(prob, |p, value| {
        if let Some((pos_a, pos_b)) = pair_positions(p, is_first_in_pair, active) {
            let n_a = multiplicity[idx.droplet_at(pos_a)];
            let n_b = multiplicity[idx.droplet_at(pos_b)];
            *value = *value * F::from_u64(n_a.max(n_b)).unwrap_or_else(F::infinity);
        }
    });
}

/// Stage B: rescale each pair's rate by its cell's normalization factor.
///
/// A cell of `m` droplets realizes only `floor(m/2)` of its `m(m-1)/2` candidate
/// pairs per step; the factor scales the expected per-pair event count back
/// up to the full combinatorial population, times the timestep/volume ratio.
/// Cells with fewer than two droplets collide nothing.
pub fn normalize_probabilities<F: Real>(
    prob: &mut [F],
    norm_factor: &mut [F],
    cell_start: &[usize],
    cell_id: &[usize],
    idx: &ActiveIndex,
    is_first_in_pair: &[bool],
    dt: F,
    dv: F,
) {
    let n_cell = cell_start.len() - 1;
    assert!(norm_factor.len() == n_cell, "normalization factor buffer has wrong cell count");

    let dt_div_dv = dt / dv;
    let two = F::one() + F::one();

    par_iter_mut1(norm_factor, |c, factor| {
        debug_assert!(cell_start[c] <= cell_start[c + 1]);
        let m = cell_start[c + 1] - cell_start[c];
        *factor = if m < 2 {
            F::zero()
        } else {
            let m_f = F::from_usize(m).unwrap();
            let half_m = F::from_usize(m / 2).unwrap();
            dt_div_dv * m_f * (m_f - F::one()) / two / half_m
        };
    });

    let active = idx.len();
    let norm_factor = &*norm_factor;
    par_iter_mut1(prob, |p, value| {
        if let Some((pos_a, _)) = pair_positions(p, is_first_in_pair, active) {
            *value *= norm_factor[cell_id[idx.droplet_at(pos_a)]];
        }
    });
}

#[test]
fn pair_slot_addressing_follows_the_mark_offset() {
    // marks at 0 and 3: pairs (0,1) and (3,4) out of 5 active positions
    let marks = vec![true, false, false, true, false];
    assert_eq!(pair_positions(0, &marks, 5), Some((0, 1)));
    assert_eq!(pair_positions(1, &marks, 5), Some((3, 4)));
    assert_eq!(pair_positions(2, &marks, 5), None);

    // mark at the very last position can never form a pair
    let marks = vec![false, true];
    assert_eq!(pair_positions(0, &marks, 2), None);
}

#[test]
fn unmarked_slots_keep_zero_rate() {
    use crate::ConstantRate;

    let idx = ActiveIndex::new(6);
    let radii = vec![1.0f64; 6];
    let marks = vec![true, false, false, false, true, false];
    let mut prob = vec![9.0f64; 3];

    evaluate_pairwise_rates(&ConstantRate { rate: 0.5 }, &radii, &idx, &marks, &mut prob);
    assert_eq!(prob, vec![0.5, 0.0, 0.5]);
}

#[test]
fn rates_see_radii_in_descending_order() {
    use crate::{LinearCollectionEfficiency, LinearCollectionEfficiencyParams};

    // the efficiency fit is asymmetric: fed in the wrong order the ratio
    // p = r_s / r leaves the (0, 1) domain and the rate collapses to 0
    let kernel = LinearCollectionEfficiency {
        params: LinearCollectionEfficiencyParams::<f64> {
            a: 1.0,
            b: 2.0,
            d1: 0.5,
            d2: 1.0,
            e1: 0.25,
            e2: 1.0,
            f1: 1.0,
            f2: 1.0,
            g1: 1.0,
            g2: 0.5,
            g3: 0.0,
            mf: 1.0,
            mg: 1.0,
        },
        unit: 1.0,
    };

    // the smaller radius is stored first
    let idx = ActiveIndex::new(2);
    let radii = vec![1.0f64, 2.0];
    let marks = vec![true, false];
    let mut prob = vec![0.0f64; 1];

    evaluate_pairwise_rates(&kernel, &radii, &idx, &marks, &mut prob);
    assert!(prob[0] > 0.0);
    crate::assert_ft_approx_eq(prob[0], kernel.pairwise_rate(2.0, 1.0), 1e-12, || {
        format!("pair rate with swapped storage order")
    });
}

#[test]
fn five_droplet_cell_normalization_factor() {
    // m = 5: factor = dt/dv * 5*4/2/2 = dt/dv * 5
    let cell_id = vec![0usize; 5];
    let idx = ActiveIndex::new(5);
    let cell_start = vec![0usize, 5];
    let marks = vec![true, false, true, false, false];
    let mut prob = vec![1.0f64, 1.0];
    let mut norm_factor = vec![0.0f64; 1];

    let (dt, dv) = (2.0, 4.0);
    normalize_probabilities(&mut prob, &mut norm_factor, &cell_start, &cell_id, &idx, &marks, dt, dv);

    crate::assert_ft_approx_eq(norm_factor[0], dt / dv * 5.0, 1e-12, || format!("norm factor"));
    crate::assert_ft_approx_eq(prob[0], 2.5, 1e-12, || format!("pair 0"));
    crate::assert_ft_approx_eq(prob[1], 2.5, 1e-12, || format!("pair 1"));
}

#[test]
fn max_multiplicity_scaling_uses_the_larger_member() {
    let idx = ActiveIndex::new(4);
    let multiplicity = vec![3u64, 12, 7, 5];
    let marks = vec![true, false, true, false];
    let mut prob = vec![0.5f64, 2.0];

    scale_by_max_multiplicity(&mut prob, &idx, &multiplicity, &marks);
    assert_eq!(prob, vec![0.5 * 12.0, 2.0 * 7.0]);
}

#[test]
fn lone_droplet_cell_collides_nothing() {
    let cell_id = vec![0usize, 1, 1];
    let idx = ActiveIndex::new(3);
    let cell_start = vec![0usize, 1, 3];
    let marks = vec![false, true, false];
    let mut prob = vec![1.0f64];
    let mut norm_factor = vec![0.0f64; 2];

    normalize_probabilities(&mut prob, &mut norm_factor, &cell_start, &cell_id, &idx, &marks, 1.0, 1.0);

    assert_eq!(norm_factor[0], 0.0);
    assert_eq!(norm_factor[1], 1.0);
    assert_eq!(prob[0], 1.0);
}
