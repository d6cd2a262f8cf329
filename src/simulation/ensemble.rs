use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{cell_index::recalculate_cell_ids, Real, VI};

/// Extensive per-droplet attributes, shape `(n_attr, n_sd)`.
///
/// Replaces the flat `n_attr * n_sd` buffer convention with an explicit
/// two-dimensional container; all addressing goes through bounds-checked
/// accessors.
pub struct AttributeMatrix<F> {
    n_attr: usize,
    n_sd: usize,
    data: Vec<F>,
}

impl<F: Real> AttributeMatrix<F> {
    pub fn zeros(n_attr: usize, n_sd: usize) -> Self {
        AttributeMatrix {
            n_attr,
            n_sd,
            data: vec![F::zero(); n_attr * n_sd],
        }
    }

    /// One row per attribute; every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<F>>) -> Self {
        let n_attr = rows.len();
        assert!(n_attr > 0, "attribute matrix needs at least one attribute");
        let n_sd = rows[0].len();
        for row in &rows {
            assert!(row.len() == n_sd, "attribute rows differ in length");
        }
        AttributeMatrix {
            n_attr,
            n_sd,
            data: rows.into_iter().flatten().collect(),
        }
    }

    pub fn n_attr(&self) -> usize {
        self.n_attr
    }

    pub fn n_sd(&self) -> usize {
        self.n_sd
    }

    fn flat(&self, attr: usize, i: usize) -> usize {
        assert!(attr < self.n_attr, "attribute index {} out of range", attr);
        assert!(i < self.n_sd, "droplet index {} out of range", i);
        attr * self.n_sd + i
    }

    pub fn get(&self, attr: usize, i: usize) -> F {
        self.data[self.flat(attr, i)]
    }

    pub fn set(&mut self, attr: usize, i: usize, value: F) {
        let idx = self.flat(attr, i);
        self.data[idx] = value;
    }

    pub fn row(&self, attr: usize) -> &[F] {
        assert!(attr < self.n_attr, "attribute index {} out of range", attr);
        &self.data[attr * self.n_sd..(attr + 1) * self.n_sd]
    }

    /// Shared view for pair-parallel kernels with disjoint per-lane droplet
    /// ownership.
    pub fn shared_ptr(&mut self) -> SharedAttributes<'_, F> {
        SharedAttributes {
            ptr: self.data.as_mut_ptr(),
            n_attr: self.n_attr,
            n_sd: self.n_sd,
            _marker: PhantomData,
        }
    }
}

/// Raw `(attribute, droplet)` addressed view into an [`AttributeMatrix`].
pub struct SharedAttributes<'a, F> {
    ptr: *mut F,
    n_attr: usize,
    n_sd: usize,
    _marker: PhantomData<&'a mut [F]>,
}

unsafe impl<'a, F: Send> Send for SharedAttributes<'a, F> {}
unsafe impl<'a, F: Send> Sync for SharedAttributes<'a, F> {}

impl<'a, F: Copy> SharedAttributes<'a, F> {
    pub fn n_attr(&self) -> usize {
        self.n_attr
    }

    /// # Safety
    /// No other lane of the same kernel invocation may access droplet `i`.
    pub unsafe fn read(&self, attr: usize, i: usize) -> F {
        debug_assert!(attr < self.n_attr && i < self.n_sd);
        *self.ptr.add(attr * self.n_sd + i)
    }

    /// # Safety
    /// No other lane of the same kernel invocation may access droplet `i`.
    pub unsafe fn write(&self, attr: usize, i: usize, value: F) {
        debug_assert!(attr < self.n_attr && i < self.n_sd);
        *self.ptr.add(attr * self.n_sd + i) = value;
    }
}

/// Superdroplet ensemble: parallel per-droplet arrays of length `n_sd`.
///
/// `multiplicity[i]` is the number of real particles superdroplet `i` stands
/// for; zero marks the droplet as inert (it keeps its slot but contributes
/// nothing until compacted away).
pub struct DropletEnsemble<F: Real, const D: usize> {
    multiplicity: Vec<u64>,
    attributes: AttributeMatrix<F>,
    cell_origin: Vec<VI<D>>,
    cell_id: Vec<usize>,
    healthy: AtomicBool,
}

impl<F: Real, const D: usize> DropletEnsemble<F, D> {
    pub fn new(
        multiplicity: Vec<u64>,
        attributes: AttributeMatrix<F>,
        cell_origin: Vec<VI<D>>,
        strides: VI<D>,
    ) -> Self {
        let n_sd = multiplicity.len();
        assert!(attributes.n_sd() == n_sd, "attribute shape does not match droplet count");
        assert!(cell_origin.len() == n_sd, "cell origin length does not match droplet count");

        let mut cell_id = vec![0; n_sd];
        recalculate_cell_ids(&mut cell_id, &cell_origin, strides);

        DropletEnsemble {
            multiplicity,
            attributes,
            cell_origin,
            cell_id,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn n_sd(&self) -> usize {
        self.multiplicity.len()
    }

    pub fn multiplicity(&self) -> &[u64] {
        &self.multiplicity
    }

    pub fn attributes(&self) -> &AttributeMatrix<F> {
        &self.attributes
    }

    pub fn cell_id(&self) -> &[usize] {
        &self.cell_id
    }

    pub fn cell_origin(&self) -> &[VI<D>] {
        &self.cell_origin
    }

    /// Reassign cell ids after cell origins changed (e.g. external advection).
    pub fn update_cell_ids(&mut self, strides: VI<D>) {
        recalculate_cell_ids(&mut self.cell_id, &self.cell_origin, strides);
    }

    pub fn multiplicity_and_attributes_mut(&mut self) -> (&mut [u64], &mut AttributeMatrix<F>, &AtomicBool) {
        (&mut self.multiplicity, &mut self.attributes, &self.healthy)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Idempotent relaxed store; safe to issue from any number of lanes of
    /// one kernel invocation because every write carries the same value.
    pub fn flag_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Only the orchestrator's sanitization pass may declare the ensemble
    /// healthy again.
    pub fn reset_healthy(&mut self) {
        self.healthy.store(true, Ordering::Relaxed);
    }

    /// `sum_i multiplicity[i] * attributes[attr][i]`, the conserved total of
    /// an extensive attribute.
    pub fn total_weighted_attribute(&self, attr: usize) -> F {
        self.multiplicity
            .iter()
            .enumerate()
            .map(|(i, &n)| F::from_u64(n).unwrap_or_else(F::infinity) * self.attributes.get(attr, i))
            .sum()
    }
}

#[test]
fn attribute_matrix_rows_and_cells() {
    let m = AttributeMatrix::from_rows(vec![vec![1.0f64, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    assert_eq!(m.n_attr(), 2);
    assert_eq!(m.n_sd(), 3);
    assert_eq!(m.get(0, 2), 3.0);
    assert_eq!(m.get(1, 0), 4.0);
    assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);

    let mut m = m;
    m.set(1, 1, 50.0);
    assert_eq!(m.get(1, 1), 50.0);
}

#[test]
fn ensemble_weighted_total_ignores_inert_droplets() {
    use crate::vec2i;

    let attributes = AttributeMatrix::from_rows(vec![vec![2.0f64, 3.0, 7.0]]);
    let origins = vec![vec2i(0, 0); 3];
    let ensemble = DropletEnsemble::<f64, 2>::new(vec![5, 0, 1], attributes, origins, vec2i(1, 0));

    // droplet 1 is inert, contributes nothing
    assert_eq!(ensemble.total_weighted_attribute(0), 5.0 * 2.0 + 7.0);
}

#[test]
fn healthy_flag_lifecycle() {
    use crate::vec2i;

    let attributes = AttributeMatrix::zeros(1, 2);
    let origins = vec![vec2i(0, 0); 2];
    let mut ensemble = DropletEnsemble::<f64, 2>::new(vec![1, 1], attributes, origins, vec2i(1, 0));

    assert!(ensemble.is_healthy());
    ensemble.flag_unhealthy();
    ensemble.flag_unhealthy();
    assert!(!ensemble.is_healthy());
    ensemble.reset_healthy();
    assert!(ensemble.is_healthy());
}
