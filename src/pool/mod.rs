//! Aptamer pool and selection-cycle data structures.

pub mod aptamer_pool;
pub mod selection_cycle;

pub use aptamer_pool::AptamerPool;
pub use selection_cycle::SelectionCycle;
