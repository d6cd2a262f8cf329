use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    atomics::SharedSlicePtr,
    concurrency::par_iter_mut0,
    ensemble::AttributeMatrix,
    probability::pair_positions,
    ActiveIndex, Real,
};

/// Applies the resolved coalescence events pair-parallel, in place.
///
/// For a pair `(j, k)` with `n[j] >= n[k]` and `new_n = n[j] - gamma * n[k]`:
/// the positive case shrinks the donor `j` and accumulates `gamma` copies of
/// its extensive attributes into `k`; exact depletion (`new_n == 0`, the only
/// admissible non-positive case under the gamma cap) splits `n[k]` between
/// the two droplets and leaves them as attribute duplicates.
///
/// Each lane writes only its own pair's two droplets (pairs are disjoint).
/// A resulting zero multiplicity raises the shared unhealthy signal; the
/// store is relaxed and unsynchronized, which is correctness-preserving only
/// because every lane writes the same value.
pub fn apply_coalescence<F: Real>(
    multiplicity: &mut [u64],
    attributes: &mut AttributeMatrix<F>,
    healthy: &AtomicBool,
    idx: &ActiveIndex,
    gamma: &[F],
    is_first_in_pair: &[bool],
) {
    let active = idx.len();
    if active < 2 {
        return;
    }
    let n_pairs = active / 2;
    assert!(gamma.len() >= n_pairs, "gamma buffer too short");

    let n_ptr = SharedSlicePtr::new(multiplicity);
    let attr_ptr = attributes.shared_ptr();
    let n_attr = attr_ptr.n_attr();

    par_iter_mut0(n_pairs, |p| {
        let g = gamma[p];
        if g <= F::zero() {
            return;
        }
        let (pos_a, pos_b) = match pair_positions(p, is_first_in_pair, active) {
            Some(pair) => pair,
            None => return,
        };
        let a = idx.droplet_at(pos_a);
        let b = idx.droplet_at(pos_b);

        unsafe {
            let n_a = n_ptr.read(a);
            let n_b = n_ptr.read(b);
            let (j, k, n_j, n_k) = if n_b > n_a { (b, a, n_b, n_a) } else { (a, b, n_a, n_b) };
            if n_k == 0 {
                return;
            }
            let gamma_int = g.to_u64().unwrap_or(0);
            if gamma_int == 0 {
                return;
            }

            // the gamma cap guarantees absorbed <= n_j
            let absorbed = gamma_int.saturating_mul(n_k);
            if absorbed < n_j {
                *n_ptr.get_mut(j) = n_j - absorbed;
                for attr in 0..n_attr {
                    let transferred = g * attr_ptr.read(attr, j);
                    attr_ptr.write(attr, k, attr_ptr.read(attr, k) + transferred);
                }
            } else {
                // exact depletion: split k's population between the two and
                // make them attribute duplicates
                *n_ptr.get_mut(j) = n_k / 2;
                *n_ptr.get_mut(k) = n_k - n_k / 2;
                for attr in 0..n_attr {
                    let blended = g * attr_ptr.read(attr, j) + attr_ptr.read(attr, k);
                    attr_ptr.write(attr, j, blended);
                    attr_ptr.write(attr, k, blended);
                }
            }

            if n_ptr.read(j) == 0 || n_ptr.read(k) == 0 {
                healthy.store(false, Ordering::Relaxed);
            }
        }
    });
}

#[cfg(test)]
fn coalescence_fixture(multiplicity: Vec<u64>, volumes: Vec<f64>) -> (Vec<u64>, AttributeMatrix<f64>, AtomicBool) {
    assert!(multiplicity.len() == volumes.len());
    (multiplicity, AttributeMatrix::from_rows(vec![volumes]), AtomicBool::new(true))
}

#[test]
fn single_event_pairs_shrink_the_donor() {
    // one cell, four droplets, pairs (0,1) and (2,3), one event each:
    // multiplicities [10,4,6,2] -> [6,4,4,2], acceptors absorb one copy
    let (mut n, mut attrs, healthy) = coalescence_fixture(vec![10, 4, 6, 2], vec![1.0; 4]);
    let idx = ActiveIndex::new(4);
    let marks = vec![true, false, true, false];
    let gamma = vec![1.0f64, 1.0];

    let before: f64 = (0..4).map(|i| n[i] as f64 * attrs.get(0, i)).sum();
    apply_coalescence(&mut n, &mut attrs, &healthy, &idx, &gamma, &marks);

    assert_eq!(n, vec![6, 4, 4, 2]);
    assert_eq!(attrs.row(0), &[1.0, 2.0, 1.0, 2.0]);
    assert!(healthy.load(Ordering::Relaxed));

    let after: f64 = (0..4).map(|i| n[i] as f64 * attrs.get(0, i)).sum();
    crate::assert_ft_approx_eq(before, after, 1e-9, || format!("mass sum"));
}

#[test]
fn exact_depletion_splits_the_acceptor_population() {
    // n[j]=4, n[k]=4, gamma=1: new_n == 0, both droplets end at 2 with
    // identical attributes; no zero multiplicity, so the ensemble stays
    // healthy
    let (mut n, mut attrs, healthy) = coalescence_fixture(vec![4, 4], vec![3.0, 5.0]);
    let idx = ActiveIndex::new(2);
    let marks = vec![true, false];

    let before: f64 = (0..2).map(|i| n[i] as f64 * attrs.get(0, i)).sum();
    apply_coalescence(&mut n, &mut attrs, &healthy, &idx, &vec![1.0f64], &marks);

    assert_eq!(n, vec![2, 2]);
    assert_eq!(attrs.get(0, 0), 8.0);
    assert_eq!(attrs.get(0, 1), 8.0);
    assert!(healthy.load(Ordering::Relaxed));

    let after: f64 = (0..2).map(|i| n[i] as f64 * attrs.get(0, i)).sum();
    crate::assert_ft_approx_eq(before, after, 1e-9, || format!("mass sum"));
}

#[test]
fn depleting_a_lone_real_particle_flags_unhealthy() {
    // n[k] == 1 cannot be split: floor(1/2) == 0 leaves a zero multiplicity
    let (mut n, mut attrs, healthy) = coalescence_fixture(vec![1, 1], vec![1.0, 1.0]);
    let idx = ActiveIndex::new(2);
    let marks = vec![true, false];

    apply_coalescence(&mut n, &mut attrs, &healthy, &idx, &vec![1.0f64], &marks);

    assert_eq!(n.iter().filter(|&&x| x == 0).count(), 1);
    assert!(!healthy.load(Ordering::Relaxed));
}

#[test]
fn storage_order_does_not_decide_donor_and_acceptor() {
    // the larger multiplicity donates regardless of which droplet the pair
    // lists first
    let (mut n, mut attrs, healthy) = coalescence_fixture(vec![4, 10], vec![1.0, 1.0]);
    let idx = ActiveIndex::new(2);
    let marks = vec![true, false];

    apply_coalescence(&mut n, &mut attrs, &healthy, &idx, &vec![2.0f64], &marks);

    // j = droplet 1 (n=10), k = droplet 0 (n=4): n[j] -> 10 - 2*4 = 2
    assert_eq!(n, vec![4, 2]);
    assert_eq!(attrs.row(0), &[3.0, 1.0]);
    assert!(healthy.load(Ordering::Relaxed));
}

#[test]
fn mass_is_conserved_across_a_parallel_pass() {
    use crate::{ChaChaStream, RandomStream};

    let n_sd = 64;
    let mut volumes = vec![0.0f64; n_sd];
    ChaChaStream::seeded(5).fill_uniform(&mut volumes);
    let multiplicity: Vec<u64> = (0..n_sd).map(|i| 1 + (i as u64 * 13) % 97).collect();

    let (mut n, mut attrs, healthy) = coalescence_fixture(multiplicity, volumes);
    let idx = ActiveIndex::new(n_sd);
    let marks: Vec<bool> = (0..n_sd).map(|i| i % 2 == 0).collect();
    // per-pair event counts within each pair's cap
    let gamma: Vec<f64> = (0..n_sd / 2)
        .map(|p| {
            let (a, b) = (2 * p, 2 * p + 1);
            let (hi, lo) = if n[a] >= n[b] { (n[a], n[b]) } else { (n[b], n[a]) };
            ((hi / lo) as f64).min(3.0)
        })
        .collect();

    let before: f64 = (0..n_sd).map(|i| n[i] as f64 * attrs.get(0, i)).sum();
    apply_coalescence(&mut n, &mut attrs, &healthy, &idx, &gamma, &marks);
    let after: f64 = (0..n_sd).map(|i| n[i] as f64 * attrs.get(0, i)).sum();

    crate::assert_ft_approx_eq(before, after, before * 1e-12, || format!("mass sum"));
}
