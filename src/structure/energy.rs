//! Nearest-neighbor thermodynamic parameters for RNA secondary structure.
//!
//! Free energies in kcal/mol at 37 °C, Turner-style. Bases are encoded
//! A=1, C=2, G=3, U=4 (0 = invalid); pair types are 0 = no pair,
//! 1 = CG, 2 = GC, 3 = GU, 4 = UG, 5 = AU, 6 = UA. Stacking and
//! mismatch tables index the inner pair in reversed (3'→5') orientation.

pub const GAS_CONSTANT: f64 = 1.987_2e-3; // kcal/(mol·K)
pub const ZERO_CELSIUS: f64 = 273.15;

/// Minimum number of unpaired bases inside a hairpin loop.
pub const MIN_HAIRPIN: usize = 3;
/// Largest bulge/interior loop considered.
pub const MAX_LOOP: usize = 30;

const INF: f64 = f64::INFINITY;

pub fn rt_at(temperature_celsius: f64) -> f64 {
    GAS_CONSTANT * (temperature_celsius + ZERO_CELSIUS)
}

/// Encode a nucleotide, mapping T to U. 0 marks anything non-ACGTU.
pub fn encode_base(base: u8) -> u8 {
    match base {
        b'A' | b'a' => 1,
        b'C' | b'c' => 2,
        b'G' | b'g' => 3,
        b'T' | b't' | b'U' | b'u' => 4,
        _ => 0,
    }
}

/// Pair type of two encoded bases (5' base first).
pub fn pair_type(a: u8, b: u8) -> usize {
    match (a, b) {
        (2, 3) => 1, // CG
        (3, 2) => 2, // GC
        (3, 4) => 3, // GU
        (4, 3) => 4, // UG
        (1, 4) => 5, // AU
        (4, 1) => 6, // UA
        _ => 0,
    }
}

/// Penalty for helices ending on a non-CG pair.
pub const TERMINAL_AU: f64 = 0.5;

fn terminal_penalty(pair: usize) -> f64 {
    if pair >= 3 {
        TERMINAL_AU
    } else {
        0.0
    }
}

/// Multiloop linear model: closing penalty, per-branch penalty and
/// per-unpaired-base penalty.
pub const ML_CLOSING: f64 = 3.4;
pub const ML_INTERN: f64 = 0.4;
pub const ML_BASE: f64 = 0.0;

/// Interior-loop asymmetry (Ninio) parameters.
pub const NINIO_SLOPE: f64 = 0.6;
pub const NINIO_MAX: f64 = 3.0;

/// Stacking free energies, `STACK[outer][inner]` with the inner pair in
/// reversed orientation.
#[rustfmt::skip]
pub const STACK: [[f64; 7]; 7] = [
    [INF, INF,   INF,   INF,   INF,   INF,   INF  ],
    //     CG     GC     GU     UG     AU     UA
    [INF, -2.40, -3.30, -2.10, -1.40, -2.10, -2.10], // CG
    [INF, -3.30, -3.40, -2.50, -1.50, -2.20, -2.40], // GC
    [INF, -2.10, -2.50,  1.30, -0.50, -1.40, -1.30], // GU
    [INF, -1.40, -1.50, -0.50,  0.30, -0.60, -1.00], // UG
    [INF, -2.10, -2.20, -1.40, -0.60, -1.10, -0.90], // AU
    [INF, -2.10, -2.40, -1.30, -1.00, -0.90, -1.30], // UA
];

/// Hairpin-loop initiation by loop size; loops below `MIN_HAIRPIN` are
/// forbidden, sizes beyond `MAX_LOOP` are extrapolated logarithmically.
#[rustfmt::skip]
pub const HAIRPIN_INIT: [f64; 31] = [
    INF, INF, INF,
    5.4, 5.6, 5.7, 5.4, 6.0, 5.5, 6.4,
    6.5, 6.6, 6.7, 6.8, 6.9, 6.9, 7.0,
    7.1, 7.1, 7.2, 7.2, 7.3, 7.3, 7.4,
    7.4, 7.5, 7.5, 7.5, 7.6, 7.6, 7.7,
];

/// Bulge-loop initiation by loop size.
#[rustfmt::skip]
pub const BULGE_INIT: [f64; 31] = [
    INF,
    3.8, 2.8, 3.2, 3.6, 4.0, 4.4, 4.6,
    4.7, 4.8, 4.9, 5.0, 5.1, 5.2, 5.3,
    5.4, 5.4, 5.5, 5.5, 5.6, 5.7, 5.7,
    5.8, 5.8, 5.8, 5.9, 5.9, 6.0, 6.0,
    6.0, 6.1,
];

/// Interior-loop initiation by total loop size (both sides).
#[rustfmt::skip]
pub const INTERIOR_INIT: [f64; 31] = [
    INF, INF,
    1.5, 1.6, 1.7, 1.8, 2.0, 2.2, 2.3,
    2.4, 2.5, 2.6, 2.7, 2.8, 2.9, 2.9,
    3.0, 3.1, 3.1, 3.2, 3.3, 3.3, 3.4,
    3.4, 3.5, 3.5, 3.5, 3.6, 3.6, 3.7,
    3.7,
];

/// Terminal mismatch contributions inside hairpin loops,
/// `MISMATCH_HAIRPIN[pair][base5][base3]` for the first and last
/// unpaired loop bases.
#[rustfmt::skip]
pub const MISMATCH_HAIRPIN: [[[f64; 5]; 5]; 7] = [
    [[0.0; 5]; 5],
    [ // CG
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -1.5, -1.5, -1.4, -1.8],
        [0.0, -1.0, -1.1, -1.0, -0.8],
        [0.0, -2.2, -1.2, -1.4, -1.4],
        [0.0, -0.9, -1.1, -1.0, -1.2],
    ],
    [ // GC
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -1.1, -1.5, -1.3, -2.1],
        [0.0, -1.1, -0.7, -1.1, -0.5],
        [0.0, -2.4, -1.3, -1.4, -1.2],
        [0.0, -1.0, -0.8, -1.1, -0.7],
    ],
    [ // GU
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -0.8, -1.0, -0.8, -1.0],
        [0.0, -0.6, -0.7, -0.6, -0.7],
        [0.0, -0.8, -0.6, -0.8, -0.6],
        [0.0, -0.6, -0.8, -0.6, -0.6],
    ],
    [ // UG
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -1.0, -0.8, -1.1, -0.9],
        [0.0, -0.7, -0.6, -0.7, -0.7],
        [0.0, -0.5, -0.6, -0.8, -0.6],
        [0.0, -0.5, -0.8, -0.6, -0.5],
    ],
    [ // AU
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -0.8, -1.0, -0.8, -1.0],
        [0.0, -0.7, -0.7, -0.7, -0.7],
        [0.0, -1.5, -0.8, -0.8, -0.8],
        [0.0, -0.8, -0.8, -0.8, -0.8],
    ],
    [ // UA
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -1.0, -0.8, -1.1, -0.9],
        [0.0, -0.7, -0.6, -0.7, -0.7],
        [0.0, -1.8, -0.9, -1.2, -0.9],
        [0.0, -0.3, -0.6, -0.3, -0.5],
    ],
];

/// Terminal mismatch contributions inside bulge-free interior loops,
/// same indexing as `MISMATCH_HAIRPIN`.
#[rustfmt::skip]
pub const MISMATCH_INTERIOR: [[[f64; 5]; 5]; 7] = [
    [[0.0; 5]; 5],
    [ // CG
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0,  0.0,  0.0, -1.1,  0.0],
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -1.1,  0.0,  0.0,  0.0],
        [0.0,  0.0,  0.0,  0.0, -0.7],
    ],
    [ // GC
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0,  0.0,  0.0, -1.1,  0.0],
        [0.0,  0.0,  0.0,  0.0,  0.0],
        [0.0, -1.1,  0.0,  0.0,  0.0],
        [0.0,  0.0,  0.0,  0.0, -0.7],
    ],
    [ // GU
        [0.0,  0.7,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7, -0.4,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.7],
        [0.7, -0.4,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.0],
    ],
    [ // UG
        [0.0,  0.7,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7, -0.4,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.7],
        [0.7, -0.4,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.0],
    ],
    [ // AU
        [0.0,  0.7,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7, -0.4,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.7],
        [0.7, -0.4,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.0],
    ],
    [ // UA
        [0.0,  0.7,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7, -0.4,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.7],
        [0.7, -0.4,  0.7,  0.7,  0.7],
        [0.7,  0.7,  0.7,  0.7,  0.0],
    ],
];

/// 5' dangling-end contributions, `DANGLE5[pair][dangling base]`.
#[rustfmt::skip]
pub const DANGLE5: [[f64; 5]; 7] = [
    [0.0,  0.0,  0.0,  0.0,  0.0],
    [0.0, -0.5, -0.3, -0.2, -0.1], // CG
    [0.0, -0.2, -0.3, -0.0, -0.0], // GC
    [0.0, -0.3, -0.1, -0.2, -0.2], // GU
    [0.0, -0.2, -0.1, -0.2, -0.2], // UG
    [0.0, -0.3, -0.1, -0.2, -0.2], // AU
    [0.0, -0.3, -0.3, -0.4, -0.2], // UA
];

/// 3' dangling-end contributions, `DANGLE3[pair][dangling base]`.
#[rustfmt::skip]
pub const DANGLE3: [[f64; 5]; 7] = [
    [0.0,  0.0,  0.0,  0.0,  0.0],
    [0.0, -1.1, -0.4, -1.3, -0.6], // CG
    [0.0, -1.7, -0.8, -1.7, -1.2], // GC
    [0.0, -1.2, -0.5, -1.2, -0.7], // GU
    [0.0, -0.8, -0.5, -0.8, -0.6], // UG
    [0.0, -0.7, -0.1, -0.7, -0.1], // AU
    [0.0, -0.8, -0.5, -0.8, -0.6], // UA
];

/// Free-energy evaluation over the constant tables at a fixed
/// temperature.
#[derive(Debug, Clone)]
pub struct EnergyModel {
    rt: f64,
}

impl EnergyModel {
    pub fn new(temperature_celsius: f64) -> Self {
        Self {
            rt: rt_at(temperature_celsius),
        }
    }

    pub fn rt(&self) -> f64 {
        self.rt
    }

    /// Boltzmann factor of a free energy.
    pub fn boltz(&self, energy: f64) -> f64 {
        (-energy / self.rt).exp()
    }

    fn loop_init(&self, table: &[f64; 31], size: usize) -> f64 {
        if size <= MAX_LOOP {
            table[size]
        } else {
            table[MAX_LOOP] + 1.75 * self.rt * (size as f64 / MAX_LOOP as f64).ln()
        }
    }

    /// Energy of a hairpin loop closed by `(i, j)`.
    pub fn hairpin(&self, enc: &[u8], i: usize, j: usize) -> f64 {
        let size = j - i - 1;
        if size < MIN_HAIRPIN {
            return INF;
        }
        let pair = pair_type(enc[i], enc[j]);
        if pair == 0 {
            return INF;
        }
        self.loop_init(&HAIRPIN_INIT, size)
            + terminal_penalty(pair)
            + MISMATCH_HAIRPIN[pair][enc[i + 1] as usize][enc[j - 1] as usize]
    }

    /// Energy of the two-pair loop between outer `(i, j)` and inner
    /// `(p, q)`: a stack, a bulge, or an interior loop.
    pub fn two_loop(&self, enc: &[u8], i: usize, j: usize, p: usize, q: usize) -> f64 {
        let outer = pair_type(enc[i], enc[j]);
        let inner_rev = pair_type(enc[q], enc[p]);
        if outer == 0 || inner_rev == 0 {
            return INF;
        }
        let left = p - i - 1;
        let right = j - q - 1;

        if left == 0 && right == 0 {
            return STACK[outer][inner_rev];
        }

        if left == 0 || right == 0 {
            let size = left.max(right);
            let mut energy = self.loop_init(&BULGE_INIT, size);
            if size == 1 {
                // Single-base bulges keep the flanking stack.
                energy += STACK[outer][inner_rev];
            } else {
                energy += terminal_penalty(outer) + terminal_penalty(inner_rev);
            }
            return energy;
        }

        self.loop_init(&INTERIOR_INIT, left + right)
            + (NINIO_SLOPE * left.abs_diff(right) as f64).min(NINIO_MAX)
            + MISMATCH_INTERIOR[outer][enc[i + 1] as usize][enc[j - 1] as usize]
            + MISMATCH_INTERIOR[inner_rev][enc[q + 1] as usize][enc[p - 1] as usize]
    }

    /// Energy of a helix `(i, j)` branching off the exterior loop:
    /// terminal penalty plus dangling-end contributions of the
    /// neighboring unpaired bases, when present.
    pub fn exterior_branch(&self, enc: &[u8], i: usize, j: usize) -> f64 {
        let pair = pair_type(enc[i], enc[j]);
        if pair == 0 {
            return INF;
        }
        let mut energy = terminal_penalty(pair);
        if i > 0 {
            energy += DANGLE5[pair][enc[i - 1] as usize];
        }
        if j + 1 < enc.len() {
            energy += DANGLE3[pair][enc[j + 1] as usize];
        }
        energy
    }

    /// Energy of a helix branching into a multiloop.
    pub fn multi_branch(&self, enc: &[u8], i: usize, j: usize) -> f64 {
        ML_INTERN + terminal_penalty(pair_type(enc[i], enc[j]))
    }

    /// Energy of the pair closing a multiloop.
    pub fn multi_closing(&self, enc: &[u8], i: usize, j: usize) -> f64 {
        ML_CLOSING + ML_INTERN + terminal_penalty(pair_type(enc[i], enc[j]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(seq: &[u8]) -> Vec<u8> {
        seq.iter().map(|&b| encode_base(b)).collect()
    }

    #[test]
    fn test_base_encoding_maps_t_to_u() {
        assert_eq!(encode_base(b'T'), encode_base(b'U'));
        assert_eq!(encode_base(b'A'), 1);
        assert_eq!(encode_base(b'N'), 0);
    }

    #[test]
    fn test_canonical_pairs() {
        assert_eq!(pair_type(encode_base(b'C'), encode_base(b'G')), 1);
        assert_eq!(pair_type(encode_base(b'G'), encode_base(b'C')), 2);
        assert_eq!(pair_type(encode_base(b'G'), encode_base(b'U')), 3);
        assert_eq!(pair_type(encode_base(b'A'), encode_base(b'U')), 5);
        assert_eq!(pair_type(encode_base(b'A'), encode_base(b'C')), 0);
    }

    #[test]
    fn test_gc_stack_is_stabilizing() {
        let model = EnergyModel::new(37.0);
        // GG / CC helix: outer GC over inner GC (reversed).
        let enc = encode(b"GGCC");
        let energy = model.two_loop(&enc, 0, 3, 1, 2);
        assert!(energy < -2.0, "stack energy {energy}");
        assert!(model.boltz(energy) > 1.0);
    }

    #[test]
    fn test_hairpin_requires_minimum_loop() {
        let model = EnergyModel::new(37.0);
        let enc = encode(b"GAAAC");
        // Loop of 3 closed by G-C
        assert!(model.hairpin(&enc, 0, 4).is_finite());
        let enc_short = encode(b"GAAC");
        assert!(model.hairpin(&enc_short, 0, 3).is_infinite());
    }

    #[test]
    fn test_loop_extrapolation_is_monotone() {
        let model = EnergyModel::new(37.0);
        let e30 = model.loop_init(&HAIRPIN_INIT, 30);
        let e60 = model.loop_init(&HAIRPIN_INIT, 60);
        let e90 = model.loop_init(&HAIRPIN_INIT, 90);
        assert!(e30 < e60 && e60 < e90);
    }

    #[test]
    fn test_terminal_au_applies_to_weak_pairs() {
        let model = EnergyModel::new(37.0);
        let enc = encode(b"AAAAAU");
        // A-U closing pair carries the terminal penalty.
        let au = model.exterior_branch(&enc, 0, 5);
        let enc_gc = encode(b"GAAAAC");
        let gc = model.exterior_branch(&enc_gc, 0, 5);
        assert!(au > gc);
    }
}
