//! Parallel structure-prediction driver
//!
//! One producer iterates the aptamer pool in id order into a bounded
//! queue; N-1 consumers each own a [`CapREngine`] (the engine reuses its
//! work arrays across sequences) and hand finished profiles to a shared
//! sink. Progress is an atomic counter; termination uses the same
//! poison-pill protocol as the demultiplexing driver.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::database::profile_store::ProfileStore;
use crate::pool::AptamerPool;
use crate::structure::capr::{CapREngine, StructuralProfile};

const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Receives finished profiles. Implementations must tolerate concurrent
/// calls from all consumer threads.
pub trait ProfileSink: Send + Sync {
    fn accept(&self, id: u32, profile: StructuralProfile) -> Result<()>;
}

impl ProfileSink for ProfileStore {
    fn accept(&self, id: u32, profile: StructuralProfile) -> Result<()> {
        self.put(id, &profile)
    }
}

/// In-memory sink, mainly for callers that post-process profiles
/// directly (and for tests).
#[derive(Default)]
pub struct ProfileCollector {
    profiles: Mutex<BTreeMap<u32, StructuralProfile>>,
}

impl ProfileCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_profiles(self) -> BTreeMap<u32, StructuralProfile> {
        self.profiles.into_inner()
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.lock().is_empty()
    }
}

impl ProfileSink for ProfileCollector {
    fn accept(&self, id: u32, profile: StructuralProfile) -> Result<()> {
        self.profiles.lock().insert(id, profile);
        Ok(())
    }
}

enum PredictionJob {
    Aptamer { id: u32, sequence: Vec<u8> },
    PoisonPill,
}

/// The structure-prediction driver.
pub struct StructurePredictor {
    max_span: usize,
    temperature: f64,
    queue_capacity: usize,
    max_threads: usize,
    shutdown: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
}

impl StructurePredictor {
    pub fn new(max_span: usize, temperature: f64, queue_capacity: usize, max_threads: usize) -> Self {
        Self {
            max_span,
            temperature,
            queue_capacity: queue_capacity.max(1),
            max_threads: max_threads.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ask the driver to stop after the in-flight aptamers finish.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Aptamers profiled so far.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Profile every aptamer in the pool, feeding results to `sink`.
    /// Returns the number of aptamers processed.
    pub fn predict(&self, pool: &AptamerPool, sink: &dyn ProfileSink) -> Result<u64> {
        let num_threads = num_cpus::get().min(self.max_threads).max(2);
        let num_consumers = num_threads - 1;
        let (tx, rx) = bounded::<PredictionJob>(self.queue_capacity);

        info!(
            "starting structure prediction over {} aptamers, 1 producer + {num_consumers} consumer(s)",
            pool.len()
        );

        std::thread::scope(|scope| -> Result<u64> {
            let producer = {
                let tx = tx.clone();
                let shutdown = Arc::clone(&self.shutdown);
                scope.spawn(move || -> Result<()> {
                    let result = Self::produce(pool, &tx, &shutdown);
                    let _ = Self::send_with_shutdown(&tx, PredictionJob::PoisonPill, &shutdown);
                    result
                })
            };

            let consumers: Vec<_> = (0..num_consumers)
                .map(|_| {
                    let rx = rx.clone();
                    let tx = tx.clone();
                    let shutdown = Arc::clone(&self.shutdown);
                    let progress = Arc::clone(&self.progress);
                    let mut engine = CapREngine::new(self.max_span, self.temperature);
                    scope.spawn(move || -> Result<()> {
                        Self::consume(rx, tx, &mut engine, sink, &shutdown, &progress)
                    })
                })
                .collect();
            drop(tx);
            drop(rx);

            producer
                .join()
                .map_err(|_| anyhow!("prediction producer thread panicked"))??;
            for consumer in consumers {
                consumer
                    .join()
                    .map_err(|_| anyhow!("prediction consumer thread panicked"))??;
            }

            let processed = self.progress.load(Ordering::Relaxed);
            info!("structure prediction finished ({processed} profiles)");
            Ok(processed)
        })
    }

    fn produce(
        pool: &AptamerPool,
        tx: &Sender<PredictionJob>,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        let mut stopped = false;
        let result = pool.for_each(|id, sequence| {
            if shutdown.load(Ordering::SeqCst) {
                stopped = true;
                return Err(anyhow!("prediction stopped"));
            }
            let job = PredictionJob::Aptamer {
                id,
                sequence: sequence.to_vec(),
            };
            if !Self::send_with_shutdown(tx, job, shutdown)? {
                stopped = true;
                return Err(anyhow!("prediction stopped"));
            }
            Ok(())
        });

        if stopped {
            return Ok(()); // soft cancellation, not an error
        }
        result
    }

    fn send_with_shutdown(
        tx: &Sender<PredictionJob>,
        item: PredictionJob,
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

    fn consume(
        rx: Receiver<PredictionJob>,
        tx: Sender<PredictionJob>,
        engine: &mut CapREngine,
        sink: &dyn ProfileSink,
        shutdown: &AtomicBool,
        progress: &AtomicU64,
    ) -> Result<()> {
        loop {
            match rx.recv_timeout(QUEUE_POLL) {
                Ok(PredictionJob::PoisonPill) => {
                    let _ = tx.send(PredictionJob::PoisonPill);
                    break;
                }
                Ok(PredictionJob::Aptamer { id, sequence }) => {
                    let outcome = engine
                        .profile(&sequence)
                        .and_then(|profile| sink.accept(id, profile));
                    if let Err(e) = outcome {
                        shutdown.store(true, Ordering::SeqCst);
                        return Err(e);
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_predicts_every_pool_member() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        for seq in [b"GGGAAATCCC".as_ref(), b"ACGTACGTACGT", b"TTTTGGGGAAAA"] {
            pool.register(seq, 0, 0).unwrap();
        }

        let predictor = StructurePredictor::new(50, 37.0, 16, 4);
        let collector = ProfileCollector::new();
        let processed = predictor.predict(&pool, &collector).unwrap();

        assert_eq!(processed, 3);
        let profiles = collector.into_profiles();
        assert_eq!(profiles.len(), 3);
        for (id, profile) in &profiles {
            let sequence = pool.sequence_of(*id).unwrap().unwrap();
            assert_eq!(profile.len(), sequence.len());
        }
    }

    #[test]
    fn test_persists_profiles_keyed_by_id() {
        let dir = TempDir::new().unwrap();
        let pool = AptamerPool::open(dir.path(), 10_000, 0.001).unwrap();
        let id = pool.register(b"GGGAAATCCC", 0, 0).unwrap();

        let store = ProfileStore::open(dir.path()).unwrap();
        let predictor = StructurePredictor::new(50, 37.0, 16, 2);
        predictor.predict(&pool, &store).unwrap();

        let profile = store.get(id).unwrap().unwrap();
        assert_eq!(profile.len(), 10);
    }
}
