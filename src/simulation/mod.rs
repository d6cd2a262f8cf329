pub mod active_index;
pub mod atomics;
pub mod cell_index;
pub mod coalescence;
pub mod collision_kernel;
pub mod concurrency;
pub mod ensemble;
pub mod gamma;
pub mod pairing;
pub mod params;
pub mod probability;
pub mod random;
pub mod sdm;

use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::MulAssign;

use num_traits::{Float, FromPrimitive, ToPrimitive};
use serde::{de::DeserializeOwned, Serialize};

use self::atomics::{AtomicF32, AtomicF64, AtomicReal};

pub use active_index::{ActiveIndex, Slot};
pub use cell_index::{recalculate_cell_ids, sort_by_cell_id_and_update_cell_start};
pub use coalescence::apply_coalescence;
pub use collision_kernel::{
    radius_to_sphere_volume, sphere_volume_to_radius, CollisionKernel, CollisionKernelTrait,
    ConstantRate, Golovin, LinearCollectionEfficiency, LinearCollectionEfficiencyParams,
};
pub use ensemble::{AttributeMatrix, DropletEnsemble};
pub use gamma::{adaptive_sdm_end, adaptive_sdm_gamma, compute_gamma};
pub use pairing::{Pairer, ShufflePairer};
pub use params::SdmParams;
pub use probability::{
    evaluate_pairwise_rates, normalize_probabilities, pair_positions, scale_by_max_multiplicity,
};
pub use random::{ChaChaStream, RandomStream, ReplayStream};
pub use sdm::SdmSimulation;

pub type IT = i32;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
}

use nalgebra::SVector;

pub type V<T, const D: usize> = SVector<T, D>;

/// Integer cell-coordinate vector (cell origins, grid strides).
pub type VI<const D: usize> = V<IT, D>;

pub fn vec2i(x: IT, y: IT) -> VI<2> {
    [x, y].into()
}

pub fn vec3i(x: IT, y: IT, z: IT) -> VI<3> {
    [x, y, z].into()
}

/// Floating-point width the engine kernels are generic over. Instantiated at
/// `f32` and `f64`; the `Atomic` associated type carries the matching
/// compare-and-swap cell used for the per-cell substep reduction.
pub trait Real:
    Float
    + FromPrimitive
    + ToPrimitive
    + MulAssign
    + Sum
    + Display
    + Debug
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    type Atomic: AtomicReal<Self>;
}

impl Real for f32 {
    type Atomic = AtomicF32;
}

impl Real for f64 {
    type Atomic = AtomicF64;
}

/// Engine instantiated at the crate's default precision (see the
/// `double-precision` feature).
pub type DefaultSdmSimulation<const D: usize> = sdm::SdmSimulation<floating_type_mod::FT, D>;

pub fn is_ft_approx_eq<F: Float>(a: F, b: F, tolerance: F) -> bool {
    (a - b).abs() <= tolerance
}

pub fn assert_ft_approx_eq<F: Float + Display>(a: F, b: F, tolerance: F, s: impl FnOnce() -> String) {
    assert!(
        is_ft_approx_eq(a, b, tolerance),
        "Assertion '{} == {}' failed ({})!",
        a,
        b,
        s()
    );
}
