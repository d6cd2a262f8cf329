/*!
Stochastic collision-coalescence engine for superdroplet ensembles.

Each simulated superdroplet stands for a large multiplicity of real
particles; coalescence between superdroplets is resolved per spatial cell
by random pairing and an integer-valued stochastic event count per pair.
*/

mod simulation;

pub use simulation::*;
