pub mod data_structures;
pub mod experiment;

pub use data_structures::{
    complement, is_valid_nucleotides, mean_phred, reverse_complement, FileFormat, RejectionReason,
    SequencingRead, PHRED_OFFSET,
};
pub use experiment::Experiment;
