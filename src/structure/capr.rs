//! Structural-profile engine
//!
//! Computes, for every base of an aptamer, the probability of occupying
//! each of six structural contexts (bulge, exterior, hairpin, interior,
//! multiloop, stem) under the Boltzmann ensemble of secondary
//! structures. The implementation is a banded McCaskill inside-outside
//! partition function over the nearest-neighbor model in
//! [`crate::structure::energy`], with base pairs restricted to a maximum
//! span. All sums are raw Boltzmann factors under a per-position scaling
//! factor that cancels in the probability ratios; iteration order is
//! fixed, so identical inputs reproduce identical outputs bit for bit.

use anyhow::{bail, Result};

use crate::structure::energy::{pair_type, EnergyModel, MAX_LOOP, MIN_HAIRPIN};

pub const NUM_CONTEXTS: usize = 6;

/// Per-base scaling factor applied to all partition sums.
const SCALE_BASE: f64 = 1.07;

/// Values below this are treated as exact zeros in the output.
const PROB_FLOOR: f64 = 1e-300;

/// The six structural contexts, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralContext {
    Bulge = 0,
    Exterior = 1,
    Hairpin = 2,
    Interior = 3,
    Multi = 4,
    Stem = 5,
}

impl StructuralContext {
    pub const ALL: [StructuralContext; NUM_CONTEXTS] = [
        StructuralContext::Bulge,
        StructuralContext::Exterior,
        StructuralContext::Hairpin,
        StructuralContext::Interior,
        StructuralContext::Multi,
        StructuralContext::Stem,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            StructuralContext::Bulge => "bulge",
            StructuralContext::Exterior => "exterior",
            StructuralContext::Hairpin => "hairpin",
            StructuralContext::Interior => "interior",
            StructuralContext::Multi => "multiloop",
            StructuralContext::Stem => "stem",
        }
    }
}

/// The 6-per-base probability matrix of one aptamer.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralProfile {
    columns: Vec<[f64; NUM_CONTEXTS]>,
}

impl StructuralProfile {
    pub fn from_columns(columns: Vec<[f64; NUM_CONTEXTS]>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, position: usize) -> &[f64; NUM_CONTEXTS] {
        &self.columns[position]
    }

    pub fn probability(&self, position: usize, context: StructuralContext) -> f64 {
        self.columns[position][context.index()]
    }

    /// The most likely context of a position and its probability.
    pub fn dominant(&self, position: usize) -> (StructuralContext, f64) {
        let column = &self.columns[position];
        let mut best = StructuralContext::Bulge;
        for context in StructuralContext::ALL {
            if column[context.index()] > column[best.index()] {
                best = context;
            }
        }
        (best, column[best.index()])
    }
}

/// Banded upper-triangular matrix: cells `(i, j)` with `i <= j <= i + width`.
struct Band {
    width: usize,
    stride: usize,
    data: Vec<f64>,
}

impl Band {
    fn new() -> Self {
        Self {
            width: 0,
            stride: 1,
            data: Vec::new(),
        }
    }

    fn reset(&mut self, n: usize, width: usize) {
        self.width = width;
        self.stride = width + 1;
        self.data.clear();
        self.data.resize(n * self.stride, 0.0);
    }

    #[inline]
    fn get(&self, i: usize, j: usize) -> f64 {
        if j < i || j - i > self.width {
            return 0.0;
        }
        self.data[i * self.stride + (j - i)]
    }

    #[inline]
    fn set(&mut self, i: usize, j: usize, value: f64) {
        debug_assert!(j >= i && j - i <= self.width);
        self.data[i * self.stride + (j - i)] = value;
    }
}

/// A reusable structural-profile predictor. The work matrices are kept
/// between calls, so a worker thread can run one engine over many
/// sequences without reallocating.
pub struct CapREngine {
    max_span: usize,
    model: EnergyModel,
    // Inside matrices
    qb: Band,
    qm: Band,
    qm1: Band,
    qm2: Band,
    // Outside matrix
    ob: Band,
    // Exterior prefix/suffix partition sums
    fwd: Vec<f64>,
    bwd: Vec<f64>,
    // Scaling powers
    inv_pow: Vec<f64>,
    mpow: Vec<f64>,
    enc: Vec<u8>,
}

impl CapREngine {
    pub fn new(max_span: usize, temperature_celsius: f64) -> Self {
        Self {
            max_span: max_span.max(MIN_HAIRPIN + 1),
            model: EnergyModel::new(temperature_celsius),
            qb: Band::new(),
            qm: Band::new(),
            qm1: Band::new(),
            qm2: Band::new(),
            ob: Band::new(),
            fwd: Vec::new(),
            bwd: Vec::new(),
            inv_pow: Vec::new(),
            mpow: Vec::new(),
            enc: Vec::new(),
        }
    }

    pub fn max_span(&self) -> usize {
        self.max_span
    }

    /// Predict the structural profile of a DNA/RNA sequence (T and U are
    /// equivalent). Fails on empty input or bases outside A/C/G/T/U.
    pub fn profile(&mut self, sequence: &[u8]) -> Result<StructuralProfile> {
        let n = sequence.len();
        if n == 0 {
            bail!("cannot profile an empty sequence");
        }

        self.enc.clear();
        for &base in sequence {
            let code = crate::structure::energy::encode_base(base);
            if code == 0 {
                bail!(
                    "sequence contains a base outside A/C/G/T/U: '{}'",
                    base as char
                );
            }
            self.enc.push(code);
        }

        let width = self.max_span.min(n.saturating_sub(1));
        self.qb.reset(n, width);
        self.qm.reset(n, width);
        self.qm1.reset(n, width);
        self.qm2.reset(n, width);
        self.ob.reset(n, width);

        let inv_s = 1.0 / SCALE_BASE;
        self.inv_pow.clear();
        self.inv_pow.push(1.0);
        for k in 1..=n + 2 {
            let prev = self.inv_pow[k - 1];
            self.inv_pow.push(prev * inv_s);
        }
        // Weight of one unpaired multiloop base (scaled).
        let mb = self.model.boltz(crate::structure::energy::ML_BASE) * inv_s;
        self.mpow.clear();
        self.mpow.push(1.0);
        for k in 1..=width + 1 {
            let prev = self.mpow[k - 1];
            self.mpow.push(prev * mb);
        }

        self.inside(n, width, mb);
        let q_total = self.exterior(n, width, inv_s)?;
        self.outside(n, width);
        Ok(self.aggregate(n, width, inv_s, mb, q_total))
    }

    fn inside(&mut self, n: usize, width: usize, mb: f64) {
        for i in (0..n).rev() {
            let j_hi = (i + width).min(n - 1);
            for j in i..=j_hi {
                // Inside sum with (i, j) paired.
                let mut paired = 0.0;
                if pair_type(self.enc[i], self.enc[j]) != 0 && j - i > MIN_HAIRPIN {
                    let hairpin_energy = self.model.hairpin(&self.enc, i, j);
                    if hairpin_energy.is_finite() {
                        paired += self.model.boltz(hairpin_energy) * self.inv_pow[j - i + 1];
                    }

                    // Stacks, bulges and interior loops.
                    let p_hi = (i + MAX_LOOP + 1).min(j.saturating_sub(2));
                    for p in i + 1..=p_hi {
                        let left = p - i - 1;
                        let q_lo = (j - 1).saturating_sub(MAX_LOOP - left).max(p + 1);
                        for q in q_lo..=j - 1 {
                            let inner = self.qb.get(p, q);
                            if inner == 0.0 {
                                continue;
                            }
                            let energy = self.model.two_loop(&self.enc, i, j, p, q);
                            paired += self.model.boltz(energy)
                                * inner
                                * self.inv_pow[(p - i) + (j - q)];
                        }
                    }

                    // Multiloop closure.
                    let content = self.qm2.get(i + 1, j - 1);
                    if content > 0.0 {
                        paired += self.model.boltz(self.model.multi_closing(&self.enc, i, j))
                            * content
                            * self.inv_pow[2];
                    }
                }
                self.qb.set(i, j, paired);

                // Multiloop segment with exactly one branch starting at i.
                let mut one_branch = if j > i { self.qm1.get(i, j - 1) * mb } else { 0.0 };
                if paired > 0.0 {
                    one_branch +=
                        paired * self.model.boltz(self.model.multi_branch(&self.enc, i, j));
                }
                self.qm1.set(i, j, one_branch);

                // Multiloop segments with >=1 and >=2 branches,
                // decomposed at the start of the last branch.
                let mut at_least_one = 0.0;
                let mut at_least_two = 0.0;
                for u in i..=j {
                    let last = self.qm1.get(u, j);
                    if last == 0.0 {
                        continue;
                    }
                    at_least_one += self.mpow[u - i] * last;
                    if u > i {
                        let before = self.qm.get(i, u - 1);
                        if before > 0.0 {
                            at_least_one += before * last;
                            at_least_two += before * last;
                        }
                    }
                }
                self.qm.set(i, j, at_least_one);
                self.qm2.set(i, j, at_least_two);
            }
        }
    }

    /// Exterior-loop prefix and suffix sums; returns the total partition
    /// function.
    fn exterior(&mut self, n: usize, width: usize, inv_s: f64) -> Result<f64> {
        self.fwd.clear();
        self.fwd.resize(n + 1, 0.0);
        self.bwd.clear();
        self.bwd.resize(n + 1, 0.0);

        self.fwd[0] = 1.0;
        for k in 1..=n {
            let j = k - 1;
            let mut value = self.fwd[k - 1] * inv_s;
            for i in j.saturating_sub(width)..=j {
                let qbv = self.qb.get(i, j);
                if qbv == 0.0 {
                    continue;
                }
                value += self.fwd[i]
                    * qbv
                    * self
                        .model
                        .boltz(self.model.exterior_branch(&self.enc, i, j));
            }
            self.fwd[k] = value;
        }

        self.bwd[n] = 1.0;
        for k in (0..n).rev() {
            let mut value = self.bwd[k + 1] * inv_s;
            let j_hi = (k + width).min(n - 1);
            for j in k..=j_hi {
                let qbv = self.qb.get(k, j);
                if qbv == 0.0 {
                    continue;
                }
                value += qbv
                    * self
                        .model
                        .boltz(self.model.exterior_branch(&self.enc, k, j))
                    * self.bwd[j + 1];
            }
            self.bwd[k] = value;
        }

        let q_total = self.fwd[n];
        if !q_total.is_finite() || q_total <= 0.0 {
            bail!("partition function is degenerate ({q_total})");
        }
        Ok(q_total)
    }

    fn outside(&mut self, n: usize, width: usize) {
        if n < MIN_HAIRPIN + 2 {
            return;
        }
        for span in (MIN_HAIRPIN + 1..=width).rev() {
            for i in 0..n - span {
                let j = i + span;
                if self.qb.get(i, j) == 0.0 {
                    continue;
                }

                // (i, j) closes a helix in the exterior loop.
                let mut value = self.fwd[i]
                    * self
                        .model
                        .boltz(self.model.exterior_branch(&self.enc, i, j))
                    * self.bwd[j + 1];

                // (i, j) is the inner pair of a stack/bulge/interior loop.
                for p in i.saturating_sub(MAX_LOOP + 1)..i {
                    let left = i - p - 1;
                    let q_hi = (j + 1 + (MAX_LOOP - left)).min(p + width).min(n - 1);
                    for q in j + 1..=q_hi {
                        let outer = self.ob.get(p, q);
                        if outer == 0.0 {
                            continue;
                        }
                        let energy = self.model.two_loop(&self.enc, p, q, i, j);
                        value += outer
                            * self.model.boltz(energy)
                            * self.inv_pow[(i - p) + (q - j)];
                    }
                }

                // (i, j) branches into a multiloop closed by (p, q).
                let branch = self
                    .model
                    .boltz(self.model.multi_branch(&self.enc, i, j));
                for p in (j + 1).saturating_sub(width)..i {
                    let left_empty = self.mpow[i - 1 - p];
                    let left_branched = self.qm.get(p + 1, i - 1);
                    let q_hi = (p + width).min(n - 1);
                    for q in j + 1..=q_hi {
                        let outer = self.ob.get(p, q);
                        if outer == 0.0 {
                            continue;
                        }
                        let right_empty = self.mpow[q - 1 - j];
                        let right_branched = self.qm.get(j + 1, q - 1);
                        // The multiloop needs at least one branch besides (i, j).
                        let split = left_branched * right_branched
                            + left_branched * right_empty
                            + left_empty * right_branched;
                        if split == 0.0 {
                            continue;
                        }
                        value += outer
                            * self
                                .model
                                .boltz(self.model.multi_closing(&self.enc, p, q))
                            * self.inv_pow[2]
                            * branch
                            * split;
                    }
                }

                self.ob.set(i, j, value);
            }
        }
    }

    fn aggregate(
        &mut self,
        n: usize,
        width: usize,
        inv_s: f64,
        mb: f64,
        q_total: f64,
    ) -> StructuralProfile {
        let inv_q = 1.0 / q_total;
        let mut columns = vec![[0.0f64; NUM_CONTEXTS]; n];

        // Range-additive accumulators for loop-interior contexts.
        let mut hairpin_diff = vec![0.0f64; n + 1];
        let mut bulge_diff = vec![0.0f64; n + 1];
        let mut interior_diff = vec![0.0f64; n + 1];

        for i in 0..n {
            let j_hi = (i + width).min(n - 1);
            if i + MIN_HAIRPIN + 1 > j_hi {
                continue;
            }
            for j in i + MIN_HAIRPIN + 1..=j_hi {
                let qbv = self.qb.get(i, j);
                if qbv == 0.0 {
                    continue;
                }
                let obv = self.ob.get(i, j);
                if obv == 0.0 {
                    continue;
                }

                // Both pair partners sit in a stem.
                let pair_probability = qbv * obv * inv_q;
                columns[i][StructuralContext::Stem.index()] += pair_probability;
                columns[j][StructuralContext::Stem.index()] += pair_probability;

                // Hairpin mass under (i, j).
                let hairpin_energy = self.model.hairpin(&self.enc, i, j);
                if hairpin_energy.is_finite() {
                    let weight = obv
                        * self.model.boltz(hairpin_energy)
                        * self.inv_pow[j - i + 1]
                        * inv_q;
                    if weight > 0.0 {
                        hairpin_diff[i + 1] += weight;
                        hairpin_diff[j] -= weight;
                    }
                }

                // Bulge/interior mass between (i, j) and each inner pair;
                // the enumeration mirrors the inside recursion exactly.
                let p_hi = (i + MAX_LOOP + 1).min(j.saturating_sub(2));
                for p in i + 1..=p_hi {
                    let left = p - i - 1;
                    let q_lo = (j - 1).saturating_sub(MAX_LOOP - left).max(p + 1);
                    for q in q_lo..=j - 1 {
                        let right = j - q - 1;
                        if left == 0 && right == 0 {
                            continue; // stacks leave no base unpaired
                        }
                        let inner = self.qb.get(p, q);
                        if inner == 0.0 {
                            continue;
                        }
                        let energy = self.model.two_loop(&self.enc, i, j, p, q);
                        let weight = obv
                            * self.model.boltz(energy)
                            * inner
                            * self.inv_pow[(p - i) + (j - q)]
                            * inv_q;
                        if weight <= 0.0 {
                            continue;
                        }
                        if left == 0 || right == 0 {
                            if left > 0 {
                                bulge_diff[i + 1] += weight;
                                bulge_diff[p] -= weight;
                            }
                            if right > 0 {
                                bulge_diff[q + 1] += weight;
                                bulge_diff[j] -= weight;
                            }
                        } else {
                            interior_diff[i + 1] += weight;
                            interior_diff[p] -= weight;
                            interior_diff[q + 1] += weight;
                            interior_diff[j] -= weight;
                        }
                    }
                }
            }
        }

        let mut hairpin_acc = 0.0;
        let mut bulge_acc = 0.0;
        let mut interior_acc = 0.0;
        for k in 0..n {
            hairpin_acc += hairpin_diff[k];
            bulge_acc += bulge_diff[k];
            interior_acc += interior_diff[k];
            columns[k][StructuralContext::Hairpin.index()] = hairpin_acc;
            columns[k][StructuralContext::Bulge.index()] = bulge_acc;
            columns[k][StructuralContext::Interior.index()] = interior_acc;

            // Unpaired in the exterior loop.
            columns[k][StructuralContext::Exterior.index()] =
                self.fwd[k] * inv_s * self.bwd[k + 1] * inv_q;

            // Unpaired inside a multiloop closed by (p, q).
            let mut multi = 0.0;
            for p in (k + 1).saturating_sub(width)..k {
                let left_empty = self.mpow[k - 1 - p];
                let left_one = self.qm.get(p + 1, k - 1);
                let left_two = self.qm2.get(p + 1, k - 1);
                let q_hi = (p + width).min(n - 1);
                for q in k + 1..=q_hi {
                    let outer = self.ob.get(p, q);
                    if outer == 0.0 {
                        continue;
                    }
                    let right_empty = self.mpow[q - 1 - k];
                    let right_one = self.qm.get(k + 1, q - 1);
                    let right_two = self.qm2.get(k + 1, q - 1);
                    let split = left_two * right_empty
                        + left_empty * right_two
                        + left_one * right_one;
                    if split == 0.0 {
                        continue;
                    }
                    multi += outer
                        * self
                            .model
                            .boltz(self.model.multi_closing(&self.enc, p, q))
                        * self.inv_pow[2]
                        * mb
                        * split;
                }
            }
            columns[k][StructuralContext::Multi.index()] = multi * inv_q;
        }

        for column in &mut columns {
            for value in column.iter_mut() {
                if *value < PROB_FLOOR {
                    *value = 0.0;
                }
            }
            debug_assert!((column.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        }

        StructuralProfile::from_columns(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_sum(profile: &StructuralProfile, k: usize) -> f64 {
        profile.column(k).iter().sum()
    }

    #[test]
    fn test_columns_sum_to_one() {
        let mut engine = CapREngine::new(50, 37.0);
        for seq in [
            b"GGGAAAUCCC".as_ref(),
            b"ACGUACGUACGUACGU",
            b"GGGGCCCCAAAAGGGGCCCC",
            b"AUAUAUAUAU",
        ] {
            let profile = engine.profile(seq).unwrap();
            assert_eq!(profile.len(), seq.len());
            for k in 0..profile.len() {
                let sum = column_sum(&profile, k);
                assert!(
                    (sum - 1.0).abs() < 1e-6,
                    "column {k} sums to {sum} for {:?}",
                    std::str::from_utf8(seq)
                );
            }
        }
    }

    #[test]
    fn test_hairpin_loop_dominates_classic_hairpin() {
        let mut engine = CapREngine::new(50, 37.0);
        let profile = engine.profile(b"GGGAAAUCCC").unwrap();

        for k in 3..=5 {
            let (context, probability) = profile.dominant(k);
            assert_eq!(
                context,
                StructuralContext::Hairpin,
                "position {k} dominated by {context:?} ({probability})"
            );
            assert!(probability > 0.5, "position {k} hairpin p = {probability}");
        }
        // The stems flanking the loop should be mostly paired.
        assert!(profile.probability(0, StructuralContext::Stem) > 0.5);
        assert!(profile.probability(9, StructuralContext::Stem) > 0.5);
    }

    #[test]
    fn test_unstructured_sequence_is_exterior() {
        let mut engine = CapREngine::new(50, 37.0);
        // No canonical pairs at all.
        let profile = engine.profile(b"AAAAAAAAAA").unwrap();
        for k in 0..profile.len() {
            assert!(
                profile.probability(k, StructuralContext::Exterior) > 0.99,
                "position {k}"
            );
        }
    }

    #[test]
    fn test_dna_input_is_folded_as_rna() {
        let mut engine = CapREngine::new(50, 37.0);
        let dna = engine.profile(b"GGGAAATCCC").unwrap();
        let rna = engine.profile(b"GGGAAAUCCC").unwrap();
        for k in 0..dna.len() {
            for c in StructuralContext::ALL {
                assert_eq!(dna.probability(k, c), rna.probability(k, c));
            }
        }
    }

    #[test]
    fn test_deterministic_across_calls() {
        let mut engine = CapREngine::new(60, 37.0);
        let first = engine.profile(b"GCGCAAAAGCGCAAAAGCGC").unwrap();
        let second = engine.profile(b"GCGCAAAAGCGCAAAAGCGC").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_band_limits_pair_span() {
        // With a tiny span the GGG...CCC helix cannot form.
        let mut engine = CapREngine::new(5, 37.0);
        let profile = engine.profile(b"GGGAAAAAAAAAAAAAAACCC").unwrap();
        // The would-be stem partners are far apart, so they stay exterior.
        assert!(profile.probability(0, StructuralContext::Stem) < 0.05);
        for k in 0..profile.len() {
            let sum: f64 = profile.column(k).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_bases_are_rejected() {
        let mut engine = CapREngine::new(50, 37.0);
        assert!(engine.profile(b"ACGN").is_err());
        assert!(engine.profile(b"").is_err());
    }

    #[test]
    fn test_short_sequences_have_no_pairs() {
        let mut engine = CapREngine::new(50, 37.0);
        let profile = engine.profile(b"GC").unwrap();
        for k in 0..2 {
            assert!(profile.probability(k, StructuralContext::Exterior) > 0.999);
            assert_eq!(profile.probability(k, StructuralContext::Stem), 0.0);
        }
    }
}
