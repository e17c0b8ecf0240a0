//! AptaPlex: the demultiplexing and registration pipeline.
//!
//! One producer thread walks the input files in order and feeds raw
//! reads into a bounded queue; N-1 consumer threads stitch mate pairs,
//! anchor primers and barcodes, and register the surviving sequences
//! into the pool and their selection cycle. Termination is signalled by
//! a poison pill that every consumer re-enqueues before exiting.

pub mod matcher;
pub mod reader;
pub mod stats;
pub mod stitcher;

pub use matcher::{CycleBarcodes, DemuxResult, MatcherConfig, PrimerMatcher};
pub use reader::{create_reader, FastaReader, FastqReader, Reader};
pub use stats::ParserStats;
pub use stitcher::{stitch, StitchConfig, StitchedRead};

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::data_structures::{is_valid_nucleotides, RejectionReason, SequencingRead};
use crate::core::experiment::Experiment;
use crate::utils::configuration::ParserConfig;

/// How long blocked queue operations wait before re-checking the
/// shutdown flag.
const QUEUE_POLL: Duration = Duration::from_millis(100);

enum QueueItem {
    Read(SequencingRead),
    PoisonPill,
}

/// The demultiplexing driver.
pub struct AptaPlexParser {
    config: ParserConfig,
    max_threads: usize,
    shutdown: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
}

impl AptaPlexParser {
    pub fn new(config: ParserConfig, max_threads: usize) -> Self {
        Self {
            config,
            max_threads: max_threads.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ask the driver to stop. The producer stops between reads and
    /// consumers drain what is already queued.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Reads processed by the consumers so far.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Run the full parse into the experiment's pool and cycles.
    pub fn parse(&self, experiment: &Experiment) -> Result<ParserStats> {
        let config = &self.config;

        if config.forward_files.is_empty() {
            bail!("no forward read files were specified, check your configuration");
        }
        if !config.reverse_files.is_empty()
            && config.reverse_files.len() != config.forward_files.len()
        {
            bail!("the number of forward and reverse read files must be identical");
        }

        // In per-file mode the file index decides the cycle, so barcode
        // matching is disabled entirely.
        let cycle_barcodes = if config.is_per_file {
            Vec::new()
        } else {
            experiment
                .cycles()
                .iter()
                .enumerate()
                .filter(|(_, c)| c.barcode5().is_some() || c.barcode3().is_some())
                .map(|(index, c)| CycleBarcodes {
                    cycle_index: index,
                    barcode5: c.barcode5().map(<[u8]>::to_vec),
                    barcode3: c.barcode3().map(<[u8]>::to_vec),
                })
                .collect()
        };

        let matcher = PrimerMatcher::new(
            MatcherConfig {
                primer5: config.primer5.as_bytes().to_vec(),
                primer3: config.primer3.as_bytes().to_vec(),
                tolerance: config.tolerance,
                barcode_tolerance: config.barcode_tolerance,
                max_leading: config.max_leading,
                max_trailing: config.max_trailing,
                min_randomized: config.min_randomized,
                max_randomized: config.max_randomized,
                min_mean_quality: config.min_mean_quality,
            },
            cycle_barcodes,
        );
        let stitch_config = StitchConfig {
            min_overlap: config.min_overlap,
            max_mismatch_rate: config.max_mismatch_rate,
        };

        let num_threads = num_cpus::get().min(self.max_threads).max(2);
        let num_consumers = num_threads - 1;
        let (tx, rx) = bounded::<QueueItem>(config.queue_capacity.max(1));

        info!(
            "starting demultiplexing: {} file(s), 1 producer + {num_consumers} consumer(s)",
            config.forward_files.len()
        );

        std::thread::scope(|scope| -> Result<ParserStats> {
            let producer = {
                let tx = tx.clone();
                let shutdown = Arc::clone(&self.shutdown);
                scope.spawn(move || -> Result<(u64, u64)> {
                    let result = Self::produce(config, &tx, &shutdown);
                    // Let the consumers terminate even when production
                    // failed part-way through.
                    let _ = Self::send_with_shutdown(&tx, QueueItem::PoisonPill, &shutdown);
                    debug!("producer enqueued poison pill");
                    result
                })
            };

            let consumers: Vec<_> = (0..num_consumers)
                .map(|_| {
                    let rx = rx.clone();
                    let tx = tx.clone();
                    let shutdown = Arc::clone(&self.shutdown);
                    let progress = Arc::clone(&self.progress);
                    let matcher = &matcher;
                    let stitch_config = &stitch_config;
                    scope.spawn(move || -> Result<ParserStats> {
                        Self::consume(
                            rx,
                            tx,
                            matcher,
                            stitch_config,
                            experiment,
                            &shutdown,
                            &progress,
                        )
                    })
                })
                .collect();
            drop(tx);
            drop(rx);

            let mut stats = ParserStats::new();
            let (reads_input, files_processed) = producer
                .join()
                .map_err(|_| anyhow!("producer thread panicked"))??;
            stats.reads_input = reads_input;
            stats.files_processed = files_processed;

            for consumer in consumers {
                let worker_stats = consumer
                    .join()
                    .map_err(|_| anyhow!("consumer thread panicked"))??;
                stats.merge(&worker_stats);
            }

            info!(
                "demultiplexing finished: {}/{} reads accepted",
                stats.reads_accepted, stats.reads_input
            );
            Ok(stats)
        })
    }

    fn produce(
        config: &ParserConfig,
        tx: &Sender<QueueItem>,
        shutdown: &AtomicBool,
    ) -> Result<(u64, u64)> {
        let mut produced = 0u64;
        let mut files = 0u64;

        'files: for (index, forward) in config.forward_files.iter().enumerate() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let reverse = config.reverse_files.get(index).map(|p| p.as_path());
            let mut reader = create_reader(&config.reader, forward, reverse)?;
            info!("parsing {}", forward.display());

            while let Some(mut read) = reader.next_read()? {
                if config.is_per_file {
                    read.selection_cycle = Some(index);
                }
                if !Self::send_with_shutdown(tx, QueueItem::Read(read), shutdown)? {
                    reader.close()?;
                    break 'files;
                }
                produced += 1;
            }
            reader.close()?;
            files += 1;
        }

        Ok((produced, files))
    }

    /// Blocking send that keeps re-checking the shutdown flag. Returns
    /// `false` when the send was abandoned.
    fn send_with_shutdown(
        tx: &Sender<QueueItem>,
        item: QueueItem,
        shutdown: &AtomicBool,
    ) -> Result<bool> {
        let mut item = item;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(false);
            }
            match tx.send_timeout(item, QUEUE_POLL) {
                Ok(()) => return Ok(true),
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Ok(false),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn consume(
        rx: Receiver<QueueItem>,
        tx: Sender<QueueItem>,
        matcher: &PrimerMatcher,
        stitch_config: &StitchConfig,
        experiment: &Experiment,
        shutdown: &AtomicBool,
        progress: &AtomicU64,
    ) -> Result<ParserStats> {
        let mut stats = ParserStats::new();
        // With a single configured cycle and no barcodes, every read
        // belongs to it.
        let single_cycle_index = (experiment.cycles().len() == 1).then_some(0);

        loop {
            match rx.recv_timeout(QUEUE_POLL) {
                Ok(QueueItem::PoisonPill) => {
                    // Pass it on for the other consumers.
                    let _ = tx.send(QueueItem::PoisonPill);
                    break;
                }
                Ok(QueueItem::Read(read)) => {
                    let outcome = Self::process_read(
                        &read,
                        matcher,
                        stitch_config,
                        experiment,
                        single_cycle_index,
                    );
                    match outcome {
                        Ok(Ok(())) => stats.record_accepted(),
                        Ok(Err(reason)) => stats.record_rejection(reason),
                        Err(e) => {
                            // Fatal: stop the producer too.
                            shutdown.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                    progress.fetch_add(1, Ordering::Relaxed);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(stats)
    }

    /// Process one read. The outer `Result` is fatal; the inner one is
    /// the per-read accept/reject outcome.
    fn process_read(
        read: &SequencingRead,
        matcher: &PrimerMatcher,
        stitch_config: &StitchConfig,
        experiment: &Experiment,
        single_cycle_index: Option<usize>,
    ) -> Result<Result<(), RejectionReason>> {
        let (sequence, quality) = match (&read.reverse, &read.reverse_quality) {
            (Some(reverse), Some(reverse_quality)) => {
                match stitch(
                    &read.forward,
                    &read.forward_quality,
                    reverse,
                    reverse_quality,
                    stitch_config,
                ) {
                    Some(stitched) => (stitched.sequence, stitched.quality),
                    None => return Ok(Err(RejectionReason::NoOverlap)),
                }
            }
            _ => (read.forward.clone(), read.forward_quality.clone()),
        };

        let demux = match matcher.demultiplex(&sequence, &quality) {
            Ok(demux) => demux,
            Err(reason) => return Ok(Err(reason)),
        };

        if !is_valid_nucleotides(&demux.sequence) {
            return Ok(Err(RejectionReason::Malformed));
        }

        let cycle_index = read
            .selection_cycle
            .or(demux.cycle_index)
            .or(single_cycle_index);
        let Some(cycle_index) = cycle_index else {
            return Ok(Err(RejectionReason::BarcodeUnmatched));
        };
        let cycle = experiment
            .cycle_at(cycle_index)
            .ok_or_else(|| anyhow!("cycle index {cycle_index} out of range"))?;

        cycle.add_with_bounds(
            experiment.pool(),
            &demux.sequence,
            demux.primer5_trim,
            demux.primer3_trim,
        )?;
        Ok(Ok(()))
    }
}
