use log::{debug, warn};

use crate::{
    apply_coalescence,
    atomics::AtomicReal,
    concurrency::par_iter_mut1,
    gamma::{adaptive_sdm_gamma, compute_gamma},
    probability::{evaluate_pairwise_rates, normalize_probabilities, scale_by_max_multiplicity},
    sort_by_cell_id_and_update_cell_start, sphere_volume_to_radius, ActiveIndex, ChaChaStream,
    CollisionKernel, DropletEnsemble, Pairer, RandomStream, Real, SdmParams, ShufflePairer,
};

/// Runaway guard for the adaptive substep loop; any physical configuration
/// converges orders of magnitude earlier.
const MAX_ADAPTIVE_PASSES: usize = 100_000;

/// One collision-coalescence timestep, sequenced:
/// sanitize -> permutation draw -> pair -> probability -> gamma draw ->
/// gamma resolution -> coalescence. In adaptive mode the pass after the
/// probability evaluation subdivides the timestep per cell and the sequence
/// repeats until every cell has consumed the macro step.
pub struct SdmSimulation<F: Real, const D: usize> {
    params: SdmParams<F>,
    kernel: CollisionKernel<F>,
    pairer: Box<dyn Pairer<F> + Send + Sync>,
    random: Box<dyn RandomStream<F>>,

    ensemble: DropletEnsemble<F, D>,
    idx: ActiveIndex,
    cell_start: Vec<usize>,

    // per-step scratch, allocated once
    temp: Vec<F>,
    rand: Vec<F>,
    prob: Vec<F>,
    is_first_in_pair: Vec<bool>,
    radii: Vec<F>,
    norm_factor: Vec<F>,

    // adaptive substep state
    dt_left: Vec<F>,
    dt_todo: Vec<F::Atomic>,
    stats_n_substep: Vec<u32>,

    step_number: usize,
}

impl<F: Real, const D: usize> SdmSimulation<F, D> {
    pub fn new(
        ensemble: DropletEnsemble<F, D>,
        n_cell: usize,
        params: SdmParams<F>,
        kernel: CollisionKernel<F>,
    ) -> Self {
        let seed = params.seed;
        Self::with_collaborators(
            ensemble,
            n_cell,
            params,
            kernel,
            Box::new(ShufflePairer),
            Box::new(ChaChaStream::seeded(seed)),
        )
    }

    pub fn with_collaborators(
        ensemble: DropletEnsemble<F, D>,
        n_cell: usize,
        params: SdmParams<F>,
        kernel: CollisionKernel<F>,
        pairer: Box<dyn Pairer<F> + Send + Sync>,
        random: Box<dyn RandomStream<F>>,
    ) -> Self {
        params.validate();
        assert!(n_cell >= 1, "need at least one cell");
        assert!(
            params.volume_attribute < ensemble.attributes().n_attr(),
            "volume attribute row out of range"
        );
        for &c in ensemble.cell_id() {
            assert!(c < n_cell, "cell id {} outside the {}-cell grid", c, n_cell);
        }

        let n_sd = ensemble.n_sd();
        SdmSimulation {
            params,
            kernel,
            pairer,
            random,
            idx: ActiveIndex::new(n_sd),
            cell_start: vec![n_sd; n_cell + 1],
            temp: vec![F::zero(); n_sd],
            rand: vec![F::zero(); n_sd / 2],
            prob: vec![F::zero(); n_sd / 2],
            is_first_in_pair: vec![false; n_sd],
            radii: vec![F::zero(); n_sd],
            norm_factor: vec![F::zero(); n_cell],
            dt_left: vec![F::zero(); n_cell],
            dt_todo: (0..n_cell).map(|_| F::Atomic::new(F::zero())).collect(),
            stats_n_substep: vec![0; n_cell],
            step_number: 0,
            ensemble,
        }
    }

    pub fn ensemble(&self) -> &DropletEnsemble<F, D> {
        &self.ensemble
    }

    pub fn active_index(&self) -> &ActiveIndex {
        &self.idx
    }

    pub fn cell_start(&self) -> &[usize] {
        &self.cell_start
    }

    /// Substeps each cell consumed during the last adaptive step.
    pub fn substep_stats(&self) -> &[u32] {
        &self.stats_n_substep
    }

    pub fn step_number(&self) -> usize {
        self.step_number
    }

    /// Drop externally flagged superdroplets from the active set.
    pub fn remove_flagged(&mut self, flagged: &[bool]) -> usize {
        assert!(flagged.len() == self.ensemble.n_sd(), "flag buffer length mismatch");
        let length = self.idx.len();
        let surviving = self
            .idx
            .remove_zero_or_flagged(self.ensemble.multiplicity(), Some(flagged), length);
        sort_by_cell_id_and_update_cell_start(&mut self.idx, self.ensemble.cell_id(), &mut self.cell_start);
        surviving
    }

    /// One collision-coalescence macro step.
    pub fn step(&mut self) {
        if !self.ensemble.is_healthy() {
            warn!(
                "step {}: unhealthy multiplicities left by the previous step, sanitizing",
                self.step_number
            );
        }
        self.sanitize();

        if self.idx.len() < 2 {
            // nothing can collide; the degenerate cell table is never consumed
            self.step_number += 1;
            return;
        }

        let conserved_before = if self.params.check_conservation {
            Some(self.ensemble.total_weighted_attribute(self.params.volume_attribute))
        } else {
            None
        };

        if self.params.adaptive {
            let dt = self.params.dt;
            for left in self.dt_left.iter_mut() {
                *left = dt;
            }
            for substeps in self.stats_n_substep.iter_mut() {
                *substeps = 0;
            }

            let mut passes = 0;
            while self.dt_left.iter().any(|&left| left > F::zero()) {
                assert!(
                    passes < MAX_ADAPTIVE_PASSES,
                    "adaptive substepping failed to consume the timestep"
                );
                self.collision_pass();
                passes += 1;
            }
            debug!(
                "step {}: {} adaptive passes, busiest cell took {} substeps",
                self.step_number,
                passes,
                self.stats_n_substep.iter().max().copied().unwrap_or(0)
            );
        } else {
            self.collision_pass();
        }

        if let Some(before) = conserved_before {
            let after = self.ensemble.total_weighted_attribute(self.params.volume_attribute);
            crate::assert_ft_approx_eq(before, after, before * F::from_f64(1e-6).unwrap(), || {
                format!("conserved volume total, step {}", self.step_number)
            });
        }

        self.step_number += 1;
    }

    /// Compact inert superdroplets away, declare the ensemble healthy again
    /// and rebuild the cell range table over the surviving prefix.
    fn sanitize(&mut self) {
        let length = self.idx.len();
        let surviving = self
            .idx
            .remove_zero_or_flagged(self.ensemble.multiplicity(), None, length);
        if surviving < length {
            debug!(
                "step {}: compaction removed {} inert superdroplets",
                self.step_number,
                length - surviving
            );
        }
        self.ensemble.reset_healthy();
        sort_by_cell_id_and_update_cell_start(&mut self.idx, self.ensemble.cell_id(), &mut self.cell_start);
    }

    /// One pairing/probability/gamma/coalescence pass over the active set
    /// (the whole step in fixed mode, one substep round in adaptive mode).
    fn collision_pass(&mut self) {
        let active = self.idx.len();
        let n_pairs = active / 2;

        // pairing radii from the current droplet volumes
        let volumes = self.ensemble.attributes().row(self.params.volume_attribute);
        par_iter_mut1(&mut self.radii, |i, r| {
            *r = sphere_volume_to_radius(volumes[i]);
        });

        // fresh draw for the permutation
        self.random.fill_uniform(&mut self.temp[..active]);
        self.pairer.toss_pairs(
            &self.temp,
            &mut self.idx,
            self.ensemble.cell_id(),
            &self.cell_start,
            &mut self.is_first_in_pair,
        );

        evaluate_pairwise_rates(
            &self.kernel,
            &self.radii,
            &self.idx,
            &self.is_first_in_pair,
            &mut self.prob,
        );
        if self.params.scale_by_max_multiplicity {
            scale_by_max_multiplicity(
                &mut self.prob,
                &self.idx,
                self.ensemble.multiplicity(),
                &self.is_first_in_pair,
            );
        }
        normalize_probabilities(
            &mut self.prob,
            &mut self.norm_factor,
            &self.cell_start,
            self.ensemble.cell_id(),
            &self.idx,
            &self.is_first_in_pair,
            self.params.dt,
            self.params.dv,
        );

        if self.params.adaptive {
            adaptive_sdm_gamma(
                &mut self.prob,
                &self.idx,
                self.ensemble.multiplicity(),
                self.ensemble.cell_id(),
                &self.is_first_in_pair,
                self.params.dt,
                self.params.dt_max,
                &mut self.dt_left,
                &self.dt_todo,
                &mut self.stats_n_substep,
            );
        }

        // second, independent draw for the gamma resolution
        self.random.fill_uniform(&mut self.rand[..n_pairs]);
        compute_gamma(
            &mut self.prob,
            &self.rand,
            &self.idx,
            self.ensemble.multiplicity(),
            &self.is_first_in_pair,
        );

        let (multiplicity, attributes, healthy) = self.ensemble.multiplicity_and_attributes_mut();
        apply_coalescence(multiplicity, attributes, healthy, &self.idx, &self.prob, &self.is_first_in_pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vec2i, AttributeMatrix, ConstantRate, Golovin, ReplayStream, VI};

    fn uniform_box_ensemble(multiplicity: Vec<u64>, volumes: Vec<f64>) -> DropletEnsemble<f64, 2> {
        let n_sd = multiplicity.len();
        let origins = vec![vec2i(0, 0); n_sd];
        DropletEnsemble::new(multiplicity, AttributeMatrix::from_rows(vec![volumes]), origins, vec2i(1, 0))
    }

    /// Pairing draws of 1.0 keep the identity order; gamma draws of 0.5
    /// round a forced unit probability to exactly one event per pair.
    fn forced_event_stream(n_sd: usize) -> Box<ReplayStream> {
        let mut draws = vec![1.0; n_sd];
        draws.extend(std::iter::repeat(0.5).take(n_sd / 2));
        Box::new(ReplayStream::new(draws))
    }

    #[test]
    fn forced_unit_probability_executes_one_event_per_pair() {
        // one cell, four droplets: factor = dt/dv * 4*3/2/2 = 3*dt/dv; with
        // dt = 1, dv = 3 and a unit kernel rate every pair's probability is
        // exactly 1
        let ensemble = uniform_box_ensemble(vec![10, 4, 6, 2], vec![1.0; 4]);
        let mut params = SdmParams::fixed_timestep(1.0, 3.0);
        params.check_conservation = true;
        let mut sim = SdmSimulation::with_collaborators(
            ensemble,
            1,
            params,
            CollisionKernel::ConstantRate(ConstantRate { rate: 1.0 }),
            Box::new(ShufflePairer),
            forced_event_stream(4),
        );

        sim.step();

        assert_eq!(sim.ensemble().multiplicity(), &[6, 4, 4, 2]);
        assert_eq!(sim.ensemble().attributes().row(0), &[1.0, 2.0, 1.0, 2.0]);
        assert!(sim.ensemble().is_healthy());
        assert_eq!(sim.active_index().len(), 4);
    }

    #[test]
    fn golovin_box_run_conserves_volume_and_stays_healthy() {
        let n_sd = 64;
        let multiplicity: Vec<u64> = (0..n_sd).map(|i| 1000 + (i as u64 * 37) % 500).collect();
        let volumes: Vec<f64> = (0..n_sd).map(|i| 1.0 + (i as f64) * 0.125).collect();
        let ensemble = uniform_box_ensemble(multiplicity, volumes);

        let mut params = SdmParams::fixed_timestep(0.05, 1000.0);
        params.check_conservation = true;
        let mut sim = SdmSimulation::new(ensemble, 1, params, CollisionKernel::Golovin(Golovin { b: 1e-3 }));

        let total_before = sim.ensemble().total_weighted_attribute(0);
        for _ in 0..20 {
            sim.step();
        }
        let total_after = sim.ensemble().total_weighted_attribute(0);

        crate::assert_ft_approx_eq(total_before, total_after, total_before * 1e-9, || {
            format!("volume total over 20 steps")
        });
        assert!(sim.ensemble().is_healthy());
        assert!(sim.active_index().len() <= n_sd);
        assert_eq!(sim.step_number(), 20);
    }

    #[test]
    fn pairs_stay_cell_local_in_a_multi_cell_grid() {
        let n_sd = 30;
        let multiplicity = vec![100u64; n_sd];
        let volumes = vec![2.0f64; n_sd];
        let origins: Vec<VI<2>> = (0..n_sd).map(|i| vec2i((i % 3) as i32, 0)).collect();
        let ensemble =
            DropletEnsemble::new(multiplicity, AttributeMatrix::from_rows(vec![volumes]), origins, vec2i(1, 3));

        let params = SdmParams::fixed_timestep(1.0, 100.0);
        let mut sim = SdmSimulation::new(ensemble, 3, params, CollisionKernel::Golovin(Golovin { b: 1e-4 }));
        sim.step();

        // rebuildable invariant: the active prefix is cell-sorted and closed
        // by the range table
        let cell_start = sim.cell_start().to_vec();
        let idx = sim.active_index();
        let cell_id = sim.ensemble().cell_id();
        for c in 0..3 {
            for pos in cell_start[c]..cell_start[c + 1] {
                assert_eq!(cell_id[idx.droplet_at(pos)], c);
            }
        }
        assert_eq!(cell_start[3], idx.len());
    }

    #[test]
    fn adaptive_stepping_consumes_the_whole_timestep() {
        // aggressive rate on wide multiplicity spreads forces subdivision
        let n_sd = 16;
        let multiplicity: Vec<u64> = (0..n_sd).map(|i| if i % 2 == 0 { 100_000 } else { 3 }).collect();
        let volumes = vec![1.0f64; n_sd];
        let ensemble = uniform_box_ensemble(multiplicity, volumes);

        let mut params = SdmParams::adaptive_timestep(1.0, 1.0, 0.25);
        params.check_conservation = true;
        let mut sim =
            SdmSimulation::new(ensemble, 1, params, CollisionKernel::ConstantRate(ConstantRate { rate: 2.0 }));

        sim.step();

        // terminal state: every cell consumed its budget, in at least
        // ceil(dt / dt_max) = 4 substeps
        assert!(sim.dt_left.iter().all(|&left| left == 0.0));
        assert!(sim.substep_stats()[0] >= 4);
    }

    #[test]
    fn unhealthy_step_is_sanitized_by_the_next_one() {
        // two lone real particles deplete exactly and leave one zero
        // multiplicity behind
        let ensemble = uniform_box_ensemble(vec![1, 1], vec![1.0, 1.0]);
        let params = SdmParams::fixed_timestep(1.0, 1.0);
        let mut sim = SdmSimulation::with_collaborators(
            ensemble,
            1,
            params,
            CollisionKernel::ConstantRate(ConstantRate { rate: 1.0 }),
            Box::new(ShufflePairer),
            forced_event_stream(2),
        );

        sim.step();
        assert!(!sim.ensemble().is_healthy());
        assert_eq!(
            sim.ensemble().multiplicity().iter().filter(|&&n| n == 0).count(),
            1
        );

        sim.step();
        assert!(sim.ensemble().is_healthy());
        assert_eq!(sim.active_index().len(), 1);
    }

    #[test]
    fn lone_droplet_step_is_a_no_op() {
        let ensemble = uniform_box_ensemble(vec![5], vec![1.0]);
        let params = SdmParams::fixed_timestep(1.0, 1.0);
        let mut sim =
            SdmSimulation::new(ensemble, 1, params, CollisionKernel::ConstantRate(ConstantRate { rate: 1.0 }));

        sim.step();

        assert_eq!(sim.ensemble().multiplicity(), &[5]);
        assert!(sim.ensemble().is_healthy());
        assert_eq!(sim.step_number(), 1);
    }

    #[test]
    fn engine_instantiates_at_single_precision() {
        let n_sd = 8;
        let origins = vec![vec2i(0, 0); n_sd];
        let attributes = AttributeMatrix::from_rows(vec![vec![1.0f32; n_sd]]);
        let ensemble = DropletEnsemble::<f32, 2>::new(vec![50; n_sd], attributes, origins, vec2i(1, 0));

        let params = SdmParams::<f32>::fixed_timestep(0.5, 10.0);
        let mut sim =
            SdmSimulation::new(ensemble, 1, params, CollisionKernel::Golovin(Golovin { b: 1e-2f32 }));
        sim.step();
        assert!(sim.ensemble().is_healthy());
    }

    #[test]
    fn externally_flagged_droplets_are_compacted() {
        let ensemble = uniform_box_ensemble(vec![4, 4, 4, 4], vec![1.0; 4]);
        let params = SdmParams::fixed_timestep(1.0, 1.0);
        let mut sim =
            SdmSimulation::new(ensemble, 1, params, CollisionKernel::ConstantRate(ConstantRate { rate: 0.0 }));

        let surviving = sim.remove_flagged(&[false, true, false, true]);
        assert_eq!(surviving, 2);
        assert_eq!(sim.active_index().len(), 2);
        assert_eq!(sim.active_index().droplet_at(0), 0);
        assert_eq!(sim.active_index().droplet_at(1), 2);
    }
}
