//! Parsing statistics and the rejection-reason histogram.

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::data_structures::RejectionReason;

/// Counters aggregated by the demultiplexing driver. Each consumer keeps
/// its own instance; the driver merges them after joining the workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserStats {
    /// Reads produced from the input files
    pub reads_input: u64,
    /// Reads registered into the pool and a cycle
    pub reads_accepted: u64,
    /// Reads dropped, by reason
    pub rejections: HashMap<RejectionReason, u64>,
    /// Input files processed
    pub files_processed: u64,
}

impl ParserStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&mut self) {
        self.reads_accepted += 1;
    }

    pub fn record_rejection(&mut self, reason: RejectionReason) {
        *self.rejections.entry(reason).or_insert(0) += 1;
    }

    /// Total number of rejected reads.
    pub fn reads_rejected(&self) -> u64 {
        self.rejections.values().sum()
    }

    pub fn rejected_for(&self, reason: RejectionReason) -> u64 {
        self.rejections.get(&reason).copied().unwrap_or(0)
    }

    /// Fold another worker's counters into this one.
    pub fn merge(&mut self, other: &ParserStats) {
        self.reads_input += other.reads_input;
        self.reads_accepted += other.reads_accepted;
        self.files_processed += other.files_processed;
        for (reason, count) in &other.rejections {
            *self.rejections.entry(*reason).or_insert(0) += count;
        }
    }

    /// Human-readable summary of the parsing run.
    pub fn print_summary(&self) {
        println!(
            "\n{}",
            "═══════════════════════════════════════════".bright_cyan()
        );
        println!("{}", "   DEMULTIPLEXING STATISTICS".bright_cyan().bold());
        println!(
            "{}",
            "═══════════════════════════════════════════".bright_cyan()
        );

        let accept_rate = if self.reads_input > 0 {
            self.reads_accepted as f64 / self.reads_input as f64 * 100.0
        } else {
            0.0
        };

        println!("\n{}", "📊 Input/Output Summary:".bright_blue().bold());
        println!(
            "  {} {}",
            "Input reads:".white(),
            format!("{:>10}", self.reads_input).yellow()
        );
        println!(
            "  {} {}",
            "Accepted:   ".white(),
            format!("{:>10} ({:.1}%)", self.reads_accepted, accept_rate)
                .bright_green()
                .bold()
        );
        println!(
            "  {} {}",
            "Rejected:   ".white(),
            format!("{:>10}", self.reads_rejected()).bright_red()
        );

        if !self.rejections.is_empty() {
            println!("\n{}", "❌ Rejection Reasons:".bright_red().bold());
            let mut reasons: Vec<_> = self.rejections.iter().collect();
            reasons.sort_by(|a, b| b.1.cmp(a.1));
            for (reason, count) in reasons {
                println!("  {:<30} {:>10}", format!("{reason}:").white(), count.to_string().red());
            }
        }

        println!(
            "\n{}",
            "═══════════════════════════════════════════\n".bright_cyan()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_totals() {
        let mut stats = ParserStats::new();
        stats.reads_input = 5;
        stats.record_accepted();
        stats.record_accepted();
        stats.record_rejection(RejectionReason::NoOverlap);
        stats.record_rejection(RejectionReason::NoOverlap);
        stats.record_rejection(RejectionReason::QualityTooLow);

        assert_eq!(stats.reads_accepted, 2);
        assert_eq!(stats.reads_rejected(), 3);
        assert_eq!(stats.rejected_for(RejectionReason::NoOverlap), 2);
        assert_eq!(stats.rejected_for(RejectionReason::PrimerUnmatched), 0);
    }

    #[test]
    fn test_merge() {
        let mut a = ParserStats::new();
        a.reads_input = 10;
        a.record_accepted();
        a.record_rejection(RejectionReason::PrimerUnmatched);

        let mut b = ParserStats::new();
        b.reads_input = 4;
        b.record_rejection(RejectionReason::PrimerUnmatched);
        b.record_rejection(RejectionReason::BarcodeCollision);

        a.merge(&b);
        assert_eq!(a.reads_input, 14);
        assert_eq!(a.reads_accepted, 1);
        assert_eq!(a.rejected_for(RejectionReason::PrimerUnmatched), 2);
        assert_eq!(a.rejected_for(RejectionReason::BarcodeCollision), 1);
    }

    #[test]
    fn test_serializes_to_json() {
        let mut stats = ParserStats::new();
        stats.reads_input = 1;
        stats.record_rejection(RejectionReason::NoOverlap);

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("NoOverlap"));
    }
}
