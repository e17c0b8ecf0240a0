//! The experiment: exclusive owner of one aptamer pool and the ordered
//! set of selection cycles, indexed by round.
//!
//! Cycles never hold references to each other; neighbor navigation goes
//! through the experiment so the ownership stays strictly one-way.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::pool::{AptamerPool, SelectionCycle};
use crate::utils::configuration::AptaForgeConfig;

pub struct Experiment {
    name: String,
    project_path: PathBuf,
    pool: AptamerPool,
    /// All cycles in configuration order; per-file demultiplexing refers
    /// to cycles by their index in this list.
    cycles: Vec<Arc<SelectionCycle>>,
    selection_by_round: BTreeMap<usize, usize>,
    control_by_round: BTreeMap<usize, Vec<usize>>,
    counter_by_round: BTreeMap<usize, Vec<usize>>,
    bloom_capacity: usize,
    bloom_fp_rate: f64,
}

impl Experiment {
    /// Open an experiment rooted at `project_path`, creating the pool
    /// directory structure when absent.
    pub fn open<P: AsRef<Path>>(
        name: &str,
        project_path: P,
        bloom_capacity: usize,
        bloom_fp_rate: f64,
    ) -> Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let pool = AptamerPool::open(&project_path, bloom_capacity, bloom_fp_rate)?;

        info!("opened experiment '{name}' at {}", project_path.display());

        Ok(Self {
            name: name.to_string(),
            project_path,
            pool,
            cycles: Vec::new(),
            selection_by_round: BTreeMap::new(),
            control_by_round: BTreeMap::new(),
            counter_by_round: BTreeMap::new(),
            bloom_capacity,
            bloom_fp_rate,
        })
    }

    /// Open an experiment and instantiate every cycle named in the
    /// configuration, in configuration order.
    pub fn from_config(config: &AptaForgeConfig) -> Result<Self> {
        let mut experiment = Self::open(
            &config.general.name,
            &config.general.project_path,
            config.bloom.capacity,
            config.bloom.fp_rate,
        )?;

        for cycle in &config.cycles {
            experiment.register_cycle(
                &cycle.name,
                cycle.round,
                cycle.barcode5.as_ref().map(|b| b.as_bytes().to_vec()),
                cycle.barcode3.as_ref().map(|b| b.as_bytes().to_vec()),
                cycle.is_control,
                cycle.is_counter,
            )?;
        }

        Ok(experiment)
    }

    /// Create (or reopen) a cycle and add it to the registry. Each round
    /// admits at most one selection cycle; control and counter cycles
    /// are unlimited.
    pub fn register_cycle(
        &mut self,
        name: &str,
        round: usize,
        barcode5: Option<Vec<u8>>,
        barcode3: Option<Vec<u8>>,
        is_control: bool,
        is_counter: bool,
    ) -> Result<Arc<SelectionCycle>> {
        if !is_control && !is_counter && self.selection_by_round.contains_key(&round) {
            bail!("round {round} already has a selection cycle");
        }

        let cycle = Arc::new(SelectionCycle::open(
            &self.project_path,
            name,
            round,
            barcode5,
            barcode3,
            is_control,
            is_counter,
            self.bloom_capacity,
            self.bloom_fp_rate,
        )?);

        let index = self.cycles.len();
        self.cycles.push(Arc::clone(&cycle));
        if is_control {
            self.control_by_round.entry(round).or_default().push(index);
        } else if is_counter {
            self.counter_by_round.entry(round).or_default().push(index);
        } else {
            self.selection_by_round.insert(round, index);
        }

        Ok(cycle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn pool(&self) -> &AptamerPool {
        &self.pool
    }

    /// All cycles in configuration order.
    pub fn cycles(&self) -> &[Arc<SelectionCycle>] {
        &self.cycles
    }

    /// Cycle by its position in the configuration order.
    pub fn cycle_at(&self, index: usize) -> Option<&Arc<SelectionCycle>> {
        self.cycles.get(index)
    }

    /// The selection cycle of a round, if one was registered.
    pub fn selection_cycle(&self, round: usize) -> Option<&Arc<SelectionCycle>> {
        self.selection_by_round
            .get(&round)
            .map(|&idx| &self.cycles[idx])
    }

    /// The selection cycle of the smallest round strictly after `round`.
    pub fn next_selection_cycle(&self, round: usize) -> Option<&Arc<SelectionCycle>> {
        self.selection_by_round
            .range(round + 1..)
            .next()
            .map(|(_, &idx)| &self.cycles[idx])
    }

    /// The selection cycle of the largest round strictly before `round`.
    pub fn previous_selection_cycle(&self, round: usize) -> Option<&Arc<SelectionCycle>> {
        self.selection_by_round
            .range(..round)
            .next_back()
            .map(|(_, &idx)| &self.cycles[idx])
    }

    /// Control cycles registered for a round (empty when none).
    pub fn control_cycles(&self, round: usize) -> Vec<&Arc<SelectionCycle>> {
        self.control_by_round
            .get(&round)
            .map(|idxs| idxs.iter().map(|&i| &self.cycles[i]).collect())
            .unwrap_or_default()
    }

    /// Counter-selection cycles registered for a round (empty when none).
    pub fn counter_cycles(&self, round: usize) -> Vec<&Arc<SelectionCycle>> {
        self.counter_by_round
            .get(&round)
            .map(|idxs| idxs.iter().map(|&i| &self.cycles[i]).collect())
            .unwrap_or_default()
    }

    /// Flush everything and release store handles, cycles first (reverse
    /// order of creation), the pool last.
    pub fn close(self) -> Result<()> {
        for cycle in self.cycles.iter().rev() {
            cycle.flush()?;
        }
        self.pool.close()?;
        info!("closed experiment '{}'", self.name);
        Ok(())
    }
}
