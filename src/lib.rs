//! # AptaForge - SELEX Aptamer Pool Indexing and Structural Profiling
//!
//! A high-performance pipeline for high-throughput SELEX sequencing data
//! built in Rust. Maintains a persistent, Bloom-filter-accelerated
//! aptamer pool with per-selection-cycle cardinalities, demultiplexes
//! raw single- and paired-end reads against primers and barcodes, and
//! computes per-base RNA secondary-structure context probabilities with
//! a parallel partition-function engine.

pub mod core;
pub mod database;
pub mod export;
pub mod parser;
pub mod pool;
pub mod structure;
pub mod utils;

// Re-export commonly used types at crate level
pub use crate::core::data_structures::{RejectionReason, SequencingRead};
pub use crate::core::experiment::Experiment;
pub use crate::parser::{AptaPlexParser, ParserStats};
pub use crate::pool::{AptamerPool, SelectionCycle};
pub use crate::structure::{StructuralContext, StructuralProfile, StructurePredictor};
pub use crate::utils::configuration::{AptaForgeConfig, ConfigurationManager};

/// Result type used throughout the crate
pub type Result<T> = anyhow::Result<T>;

/// Error type used throughout the crate
pub type Error = anyhow::Error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_result_type() -> Result<()> {
        let success: Result<i32> = Ok(42);
        let error: Result<i32> = Err(anyhow::anyhow!("test error"));

        assert!(success.is_ok());
        assert_eq!(success?, 42);

        assert!(error.is_err());
        assert!(error.unwrap_err().to_string().contains("test error"));
        Ok(())
    }

    #[test]
    fn test_error_propagation() {
        fn failing_function() -> Result<i32> {
            Err(anyhow::anyhow!("inner error"))
        }

        fn wrapping_function() -> Result<String> {
            let _value = failing_function()?;
            Ok("success".to_string())
        }

        let result = wrapping_function();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("inner error"));
    }

    #[test]
    fn test_module_exports() {
        // Core data structures are re-exported at crate level.
        let read = SequencingRead::single_end(b"ACGT".to_vec(), b"IIII".to_vec());
        assert!(!read.is_paired());

        let _reason = RejectionReason::NoOverlap;
        let _context = StructuralContext::Hairpin;
    }

    #[test]
    fn test_default_configuration_loads() {
        let config = AptaForgeConfig::default();
        assert_eq!(config.parser.reader, "fastq");
        assert!(config.bloom.fp_rate > 0.0);
    }
}
