//! CapR-style structural profiling: energy model, partition-function
//! engine and the parallel prediction driver.

pub mod capr;
pub mod energy;
pub mod predictor;

pub use capr::{CapREngine, StructuralContext, StructuralProfile, NUM_CONTEXTS};
pub use energy::EnergyModel;
pub use predictor::{ProfileCollector, ProfileSink, StructurePredictor};
