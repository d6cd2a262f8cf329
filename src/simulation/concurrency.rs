/*!
Wide data-parallel kernel launches.

Every per-pair or per-cell operation of the engine runs as one of these
helpers; a returned call is the synchronization barrier between kernel
invocations (all lanes of one invocation complete before any lane of the
next one starts). Within a single invocation only disjoint per-lane writes,
the atomic substep minimum and the idempotent healthy-flag store are
permitted on shared state.
*/

use rayon::prelude::*;

/// Kernel over `0..n` lanes without a dedicated output array.
pub fn par_iter_mut0<F: Fn(usize) + Send + Sync>(n: usize, f: F) {
    (0..n).into_par_iter().for_each(|idx| {
        f(idx);
    });
}

pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
    arr1: &mut [T1],
    arr2: &mut [T2],
    f: F,
) {
    arr1.into_par_iter()
        .zip(arr2.into_par_iter())
        .enumerate()
        .for_each(|(idx, (v1, v2))| {
            f(idx, v1, v2);
        });
}

#[test]
fn par_iter_mut_lane_indices() {
    let mut values = vec![0usize; 1000];
    par_iter_mut1(&mut values, |i, v| {
        *v = i * 2;
    });
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, i * 2);
    }

    let mut a = vec![0usize; 100];
    let mut b = vec![0usize; 100];
    par_iter_mut2(&mut a, &mut b, |i, va, vb| {
        *va = i;
        *vb = i + 1;
    });
    assert_eq!(a[99], 99);
    assert_eq!(b[0], 1);
}
