use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Atomic floating-point cell with a minimum reduction.
///
/// The minimum is an explicit compare-and-swap retry loop: the comparison is
/// done on the floating-point values, only the exchange itself operates on
/// the bit representation. Valid for the non-negative, non-NaN timestep
/// domain it is used on.
///
/// All accesses are `Relaxed`; cross-invocation visibility comes from the
/// kernel-launch barrier in `concurrency`, not from the atomics themselves.
pub trait AtomicReal<F>: Send + Sync {
    fn new(value: F) -> Self;
    fn load(&self) -> F;
    fn store(&self, value: F);

    /// Lowers the stored value to `min(current, value)`; returns the value
    /// observed immediately before the update took effect.
    fn fetch_min(&self, value: F) -> F;
}

pub struct AtomicF32(AtomicU32);

impl AtomicReal<f32> for AtomicF32 {
    fn new(value: f32) -> Self {
        AtomicF32(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn fetch_min(&self, value: f32) -> f32 {
        let mut observed = self.0.load(Ordering::Relaxed);
        loop {
            let current = f32::from_bits(observed);
            if current <= value {
                return current;
            }
            match self.0.compare_exchange_weak(
                observed,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => observed = actual,
            }
        }
    }
}

pub struct AtomicF64(AtomicU64);

impl AtomicReal<f64> for AtomicF64 {
    fn new(value: f64) -> Self {
        AtomicF64(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn fetch_min(&self, value: f64) -> f64 {
        let mut observed = self.0.load(Ordering::Relaxed);
        loop {
            let current = f64::from_bits(observed);
            if current <= value {
                return current;
            }
            match self.0.compare_exchange_weak(
                observed,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => observed = actual,
            }
        }
    }
}

/// Shared mutable view into a slice for kernels whose lanes write disjoint
/// element sets (e.g. one coalescence lane owns exactly the two droplets of
/// its pair).
pub struct SharedSlicePtr<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<'a, T: Send> Send for SharedSlicePtr<'a, T> {}
unsafe impl<'a, T: Send> Sync for SharedSlicePtr<'a, T> {}

impl<'a, T> SharedSlicePtr<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        SharedSlicePtr {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// No other lane of the same kernel invocation may read or write index `i`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, i: usize) -> &mut T {
        debug_assert!(i < self.len);
        &mut *self.ptr.add(i)
    }

    /// # Safety
    /// No other lane of the same kernel invocation may write index `i`.
    pub unsafe fn read(&self, i: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(i < self.len);
        *self.ptr.add(i)
    }
}

#[test]
fn atomic_min_sequential() {
    let cell = AtomicF64::new(4.0);
    assert_eq!(cell.fetch_min(2.5), 4.0);
    assert_eq!(cell.load(), 2.5);
    // larger candidate leaves the stored value untouched
    assert_eq!(cell.fetch_min(3.0), 2.5);
    assert_eq!(cell.load(), 2.5);
}

#[test]
fn atomic_min_parallel_reduction() {
    use crate::concurrency::par_iter_mut0;

    let cell = AtomicF32::new(f32::MAX);
    par_iter_mut0(10_000, |i| {
        cell.fetch_min(1.0 + (i % 997) as f32);
    });
    assert_eq!(cell.load(), 1.0);
}

#[test]
fn shared_slice_disjoint_writes() {
    use crate::concurrency::par_iter_mut0;

    let mut values = vec![0u64; 256];
    let ptr = SharedSlicePtr::new(&mut values);
    // each lane owns two slots
    par_iter_mut0(128, |i| unsafe {
        *ptr.get_mut(2 * i) = i as u64;
        *ptr.get_mut(2 * i + 1) = ptr.read(2 * i) + 1;
    });
    assert_eq!(values[254], 127);
    assert_eq!(values[255], 128);
}
