use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::Real;

/// Physical collision kernel evaluated per candidate pair.
///
/// `r >= r_s` are the pair's ordered reference radii. The returned rate is
/// non-negative; any out-of-domain input yields 0 (there is no per-lane
/// error channel inside a kernel invocation).
#[enum_dispatch]
pub trait CollisionKernelTrait<F: Real> {
    fn pairwise_rate(&self, r: F, r_s: F) -> F;
}

#[enum_dispatch(CollisionKernelTrait<F>)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(bound = "F: Real")]
pub enum CollisionKernel<F: Real> {
    LinearCollectionEfficiency(LinearCollectionEfficiency<F>),
    Golovin(Golovin<F>),
    ConstantRate(ConstantRate<F>),
}

/// Coefficients of the parameterized collection-efficiency expression; the
/// engine treats them opaquely.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinearCollectionEfficiencyParams<F> {
    pub a: F,
    pub b: F,
    pub d1: F,
    pub d2: F,
    pub e1: F,
    pub e2: F,
    pub f1: F,
    pub f2: F,
    pub g1: F,
    pub g2: F,
    pub g3: F,
    pub mf: F,
    pub mg: F,
}

/// Rational/power collection-efficiency fit over the radius ratio
/// `p = r_s / r`, valid on `p ∈ (0, 1)`; everything else collapses to 0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinearCollectionEfficiency<F> {
    pub params: LinearCollectionEfficiencyParams<F>,
    /// Reference length unit the radii are expressed in before evaluation.
    pub unit: F,
}

impl<F: Real> CollisionKernelTrait<F> for LinearCollectionEfficiency<F> {
    fn pairwise_rate(&self, r: F, r_s: F) -> F {
        let r = r / self.unit;
        let r_s = r_s / self.unit;

        let p = r_s / r;
        if !(p > F::zero() && p < F::one()) {
            return F::zero();
        }

        let pr = &self.params;
        let g = (pr.g1 / r).powf(pr.mg) + pr.g2 + pr.g3 * r;
        let gp = (F::one() - p).powf(g);
        if gp == F::zero() {
            return F::zero();
        }

        let d = pr.d1 / r.powf(pr.d2);
        let e = pr.e1 / r.powf(pr.e2);
        let f = (pr.f1 / r).powf(pr.mf) + pr.f2;

        let efficiency = pr.a + pr.b * p + d / p.powf(f) + e / gp;
        efficiency.max(F::zero())
    }
}

/// Golovin (sum-of-volumes) kernel, `b * (v + v_s)`, the analytically
/// solvable reference case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Golovin<F> {
    pub b: F,
}

impl<F: Real> CollisionKernelTrait<F> for Golovin<F> {
    fn pairwise_rate(&self, r: F, r_s: F) -> F {
        self.b * (radius_to_sphere_volume(r) + radius_to_sphere_volume(r_s))
    }
}

/// Pair-independent constant rate; lets tests force exact probabilities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConstantRate<F> {
    pub rate: F,
}

impl<F: Real> CollisionKernelTrait<F> for ConstantRate<F> {
    fn pairwise_rate(&self, _r: F, _r_s: F) -> F {
        self.rate
    }
}

fn frac_4pi_3<F: Real>() -> F {
    F::from_f64(4.0 / 3.0 * std::f64::consts::PI).unwrap()
}

pub fn radius_to_sphere_volume<F: Real>(r: F) -> F {
    frac_4pi_3::<F>() * r * r * r
}

pub fn sphere_volume_to_radius<F: Real>(volume: F) -> F {
    // V = 4PI/3 * r^3   =>   r = (3V/(4PI))^(1/3)
    (volume / frac_4pi_3::<F>()).powf(F::from_f64(1.0 / 3.0).unwrap())
}

#[test]
fn radius_and_sphere_volume_roundtrip() {
    fn inner<F: Real>() {
        for x in [0.1, 0.5, 1.0, 100.] {
            let x = F::from_f64(x).unwrap();
            let x2 = radius_to_sphere_volume(sphere_volume_to_radius(x));
            crate::assert_ft_approx_eq(x, x2, x * F::from_f64(1e-5).unwrap(), || {
                format!("roundtrip sphere_volume->radius->sphere_volume")
            });
        }
    }

    inner::<f32>();
    inner::<f64>();
}

#[cfg(test)]
fn test_efficiency_params() -> LinearCollectionEfficiencyParams<f64> {
    LinearCollectionEfficiencyParams {
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
    }
}

#[test]
fn collection_efficiency_out_of_domain_radii_yield_zero() {
    let kernel = LinearCollectionEfficiency {
        params: test_efficiency_params(),
        unit: 1.0,
    };

    // equal radii: p == 1
    assert_eq!(kernel.pairwise_rate(2.0, 2.0), 0.0);
    // vanished small droplet: p == 0
    assert_eq!(kernel.pairwise_rate(2.0, 0.0), 0.0);
    // vanished pair: p is NaN
    assert_eq!(kernel.pairwise_rate(0.0, 0.0), 0.0);
}

#[test]
fn collection_efficiency_is_clamped_non_negative() {
    let params = LinearCollectionEfficiencyParams::<f64> {
        a: -10.0,
        b: 0.0,
        d1: 0.0,
        d2: 1.0,
        e1: 0.0,
        e2: 1.0,
        f1: 1.0,
        f2: 1.0,
        g1: 0.0,
        g2: 1.0,
        g3: 0.0,
        mf: 1.0,
        mg: 1.0,
    };
    let kernel = LinearCollectionEfficiency { params, unit: 1.0 };
    assert_eq!(kernel.pairwise_rate(2.0, 1.0), 0.0);
}

#[test]
fn collection_efficiency_positive_inside_domain() {
    let kernel = LinearCollectionEfficiency {
        params: test_efficiency_params(),
        unit: 1.0,
    };
    let rate = kernel.pairwise_rate(2.0, 1.0);
    assert!(rate > 0.0);
    assert!(rate.is_finite());
}

#[test]
fn golovin_rate_is_sum_of_volumes() {
    let kernel = Golovin { b: 1.5f64 };
    let v1 = radius_to_sphere_volume(1.0);
    let v2 = radius_to_sphere_volume(2.0);
    crate::assert_ft_approx_eq(kernel.pairwise_rate(2.0, 1.0), 1.5 * (v1 + v2), 1e-12, || {
        format!("golovin additivity")
    });
}
