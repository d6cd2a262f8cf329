use serde::{Deserialize, Serialize};

use crate::Real;

/// Engine parameters for one collision-coalescence configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SdmParams<F> {
    /// Macro timestep of one `step()` call.
    pub dt: F,
    /// Volume of one spatial cell.
    pub dv: F,

    /// Subdivide the timestep per cell so no pair's gamma exceeds its cap.
    pub adaptive: bool,
    /// Upper clamp on a single adaptive substep.
    pub dt_max: F,

    /// Attribute row holding the droplet volume; the pairing radius is
    /// derived from it.
    pub volume_attribute: usize,

    /// Scale each pair's rate by its larger multiplicity before the cell
    /// normalization (superdroplet-population rates instead of droplet-pair
    /// rates).
    pub scale_by_max_multiplicity: bool,

    /// Seed of the default random stream.
    pub seed: u64,

    /// Re-sum the conserved volume total before and after every step and
    /// assert it is unchanged. Slow, diagnostics only.
    pub check_conservation: bool,
}

impl<F: Real> SdmParams<F> {
    pub fn fixed_timestep(dt: F, dv: F) -> Self {
        SdmParams {
            dt,
            dv,
            adaptive: false,
            dt_max: dt,
            volume_attribute: 0,
            scale_by_max_multiplicity: false,
            seed: 44,
            check_conservation: false,
        }
    }

    pub fn adaptive_timestep(dt: F, dv: F, dt_max: F) -> Self {
        SdmParams {
            adaptive: true,
            dt_max,
            ..Self::fixed_timestep(dt, dv)
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn validate(&self) {
        assert!(self.dt > F::zero(), "timestep must be positive");
        assert!(self.dv > F::zero(), "cell volume must be positive");
        assert!(self.dt_max > F::zero(), "substep clamp must be positive");
    }
}

#[test]
fn params_yaml_roundtrip() {
    let params = SdmParams::<f64>::adaptive_timestep(1.0, 1e6, 0.25);
    let text = serde_yaml::to_string(&params).unwrap();
    let parsed = SdmParams::<f64>::from_yaml_str(&text).unwrap();
    assert_eq!(parsed.dt, 1.0);
    assert_eq!(parsed.dt_max, 0.25);
    assert!(parsed.adaptive);
}

#[test]
fn params_yaml_parses_hand_written_config() {
    let text = "
dt: 0.5
dv: 1000000.0
adaptive: true
dt_max: 0.1
volume_attribute: 0
scale_by_max_multiplicity: true
seed: 7
check_conservation: false
";
    let params = SdmParams::<f32>::from_yaml_str(text).unwrap();
    params.validate();
    assert_eq!(params.seed, 7);
    assert_eq!(params.dt, 0.5);
}
