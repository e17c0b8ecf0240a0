//! End-to-end demultiplexing tests: paired-end stitching, primer
//! trimming, barcode routing and per-file cycle assignment through the
//! full producer/consumer driver.

use aptaforge::core::experiment::Experiment;
use aptaforge::core::data_structures::RejectionReason;
use aptaforge::parser::AptaPlexParser;
use aptaforge::utils::configuration::{AptaForgeConfig, CycleConfig};
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

fn write_fastq(dir: &TempDir, name: &str, records: &[&str]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for (i, seq) in records.iter().enumerate() {
        let quality: String = "I".repeat(seq.len());
        writeln!(file, "@read{i}\n{seq}\n+\n{quality}").unwrap();
    }
    path
}

fn cycle(name: &str, round: usize, barcode5: Option<&str>, barcode3: Option<&str>) -> CycleConfig {
    CycleConfig {
        name: name.to_string(),
        round,
        barcode5: barcode5.map(str::to_string),
        barcode3: barcode3.map(str::to_string),
        is_control: false,
        is_counter: false,
    }
}

fn base_config(dir: &TempDir) -> AptaForgeConfig {
    let mut config = AptaForgeConfig::default();
    config.general.project_path = dir.path().join("project");
    config.bloom.capacity = 10_000;
    config.parser.min_randomized = 1;
    config.parser.min_mean_quality = 10.0;
    config.parser.max_leading = 10;
    config.parser.max_trailing = 10;
    config
}

#[test]
fn test_paired_end_stitch_and_register() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    // Mate pairs overlap completely: rc("TTACGTACGT") == "ACGTACGTAA".
    let forward = write_fastq(&dir, "fwd.fastq", &["ACGTACGTAA"]);
    let reverse = write_fastq(&dir, "rev.fastq", &["TTACGTACGT"]);
    config.parser.forward_files = vec![forward];
    config.parser.reverse_files = vec![reverse];
    config.parser.min_overlap = 6;
    config.parser.max_mismatch_rate = 0.0;
    config.parser.primer5 = String::new();
    config.parser.primer3 = String::new();
    config.cycles.push(cycle("R1", 1, None, None));

    let experiment = Experiment::from_config(&config).unwrap();
    let parser = AptaPlexParser::new(config.parser.clone(), 4);
    let stats = parser.parse(&experiment).unwrap();

    assert_eq!(stats.reads_accepted, 1);
    let pool = experiment.pool();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.identifier_of(b"ACGTACGTAA").unwrap(), Some(0));
    assert_eq!(pool.bounds_of(0).unwrap(), Some((0, 10)));
}

#[test]
fn test_non_overlapping_pairs_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    let forward = write_fastq(&dir, "fwd.fastq", &["AAAAAAAAAA"]);
    let reverse = write_fastq(&dir, "rev.fastq", &["AAAAAAAAAA"]); // rc is all T
    config.parser.forward_files = vec![forward];
    config.parser.reverse_files = vec![reverse];
    config.parser.min_overlap = 6;
    config.parser.max_mismatch_rate = 0.0;
    config.parser.primer5 = String::new();
    config.parser.primer3 = String::new();
    config.cycles.push(cycle("R1", 1, None, None));

    let experiment = Experiment::from_config(&config).unwrap();
    let parser = AptaPlexParser::new(config.parser.clone(), 2);
    let stats = parser.parse(&experiment).unwrap();

    assert_eq!(stats.reads_accepted, 0);
    assert_eq!(stats.rejected_for(RejectionReason::NoOverlap), 1);
    assert_eq!(experiment.pool().len(), 0);
}

#[test]
fn test_primer_trim_records_randomized_region_bounds() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    let fastq = write_fastq(&dir, "reads.fastq", &["AAACGTCGTTT"]);
    config.parser.forward_files = vec![fastq];
    config.parser.primer5 = "AAA".to_string();
    config.parser.primer3 = "TTT".to_string();
    config.cycles.push(cycle("R1", 1, None, None));

    let experiment = Experiment::from_config(&config).unwrap();
    let parser = AptaPlexParser::new(config.parser.clone(), 2);
    let stats = parser.parse(&experiment).unwrap();

    assert_eq!(stats.reads_accepted, 1);
    let pool = experiment.pool();
    let id = pool.identifier_of(b"AAACGTCGTTT").unwrap().unwrap();
    let (start, end) = pool.bounds_of(id).unwrap().unwrap();
    assert_eq!((start, end), (3, 8));

    let sequence = pool.sequence_of(id).unwrap().unwrap();
    assert_eq!(&sequence[start as usize..end as usize], b"CGTCG");
}

#[test]
fn test_barcode_demultiplexing_routes_to_the_matching_cycle() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    // AT + AAA + CGTCG + TTT + GC -> cycle "R1" with barcodes (AT, GC)
    let fastq = write_fastq(&dir, "reads.fastq", &["ATAAACGTCGTTTGC"]);
    config.parser.forward_files = vec![fastq];
    config.parser.primer5 = "AAA".to_string();
    config.parser.primer3 = "TTT".to_string();
    config.parser.barcode_tolerance = 0;
    config.cycles.push(cycle("R1", 1, Some("AT"), Some("GC")));
    config.cycles.push(cycle("R2", 2, Some("CG"), Some("TA")));

    let experiment = Experiment::from_config(&config).unwrap();
    let parser = AptaPlexParser::new(config.parser.clone(), 4);
    let stats = parser.parse(&experiment).unwrap();

    assert_eq!(stats.reads_accepted, 1);

    let first = experiment.selection_cycle(1).unwrap();
    let second = experiment.selection_cycle(2).unwrap();
    assert_eq!(first.size(), 1);
    assert_eq!(second.size(), 0);

    // Barcodes are trimmed before registration.
    let pool = experiment.pool();
    assert_eq!(first.count_of(pool, b"AAACGTCGTTT").unwrap(), 1);
}

#[test]
fn test_per_file_mode_assigns_reads_by_file_index() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    let first = write_fastq(&dir, "r0.fastq", &["AAACGTCGTTT", "AAACGTCGTTT"]);
    let second = write_fastq(&dir, "r1.fastq", &["AAAGGGGGTTT"]);
    config.parser.forward_files = vec![first, second];
    config.parser.is_per_file = true;
    config.parser.primer5 = "AAA".to_string();
    config.parser.primer3 = "TTT".to_string();
    config.cycles.push(cycle("R0", 0, None, None));
    config.cycles.push(cycle("R1", 1, None, None));

    let experiment = Experiment::from_config(&config).unwrap();
    let parser = AptaPlexParser::new(config.parser.clone(), 4);
    let stats = parser.parse(&experiment).unwrap();

    assert_eq!(stats.reads_accepted, 3);
    assert_eq!(stats.files_processed, 2);
    assert_eq!(experiment.selection_cycle(0).unwrap().size(), 2);
    assert_eq!(experiment.selection_cycle(1).unwrap().size(), 1);
}

#[test]
fn test_experiment_survives_reopen_after_parse() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    let fastq = write_fastq(
        &dir,
        "reads.fastq",
        &["AAACGTCGTTT", "AAACGTCGTTT", "AAAGGGGGTTT"],
    );
    config.parser.forward_files = vec![fastq];
    config.parser.primer5 = "AAA".to_string();
    config.parser.primer3 = "TTT".to_string();
    config.cycles.push(cycle("R1", 1, None, None));

    let expected_id;
    {
        let experiment = Experiment::from_config(&config).unwrap();
        let parser = AptaPlexParser::new(config.parser.clone(), 2);
        parser.parse(&experiment).unwrap();
        expected_id = experiment
            .pool()
            .identifier_of(b"AAACGTCGTTT")
            .unwrap()
            .unwrap();
        experiment.close().unwrap();
    }

    let experiment = Experiment::from_config(&config).unwrap();
    let pool = experiment.pool();
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.identifier_of(b"AAACGTCGTTT").unwrap(), Some(expected_id));

    let cycle = experiment.selection_cycle(1).unwrap();
    assert_eq!(cycle.size(), 3);
    assert_eq!(cycle.unique_size(), 2);
}
