//! Capability tables for the RSP models
//!
//! Each model has its own antenna inputs, tuner count, optional front-end
//! features and per-band RF gain reduction table (one entry per LNA state).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use sdrplay_api::HwVersion;

use crate::error::{Error, Result};

/// Lowest tunable frequency in Hz.
pub const MIN_FREQUENCY: f64 = 1e3;
/// Highest tunable frequency in Hz.
pub const MAX_FREQUENCY: f64 = 2000e6;

/// IF gain reduction limits in dB.
pub const MIN_IF_GAIN_REDUCTION: u32 = 20;
pub const MAX_IF_GAIN_REDUCTION: u32 = 59;

/// Output sample rates in Hz, common to all models.
pub const SAMPLE_RATES: [f64; 16] = [
    62.5e3, 125e3, 250e3, 500e3, 1000e3, 1920e3, 2000e3, 2048e3, 3000e3, 4000e3, 5000e3, 6000e3,
    7000e3, 8000e3, 9000e3, 10000e3,
];

/// Output sample rates in RSPduo dual tuner and master/slave modes.
pub const RSPDUO_SHARED_SAMPLE_RATES: [f64; 6] = [62.5e3, 125e3, 250e3, 500e3, 1000e3, 2000e3];

/// Antenna input selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Antenna {
    /// The only input, or the model's default one.
    #[default]
    Default,
    /// "Antenna A" (RSP2, RSPdx)
    A,
    /// "Antenna B" (RSP2, RSPdx)
    B,
    /// "Antenna C" (RSPdx)
    C,
    /// High impedance AM port ("Hi-Z" on RSP2, "High Z" on RSPduo tuner 1)
    HiZ,
    /// "Tuner 1 50 ohm" (RSPduo)
    Tuner1,
    /// "Tuner 2 50 ohm" (RSPduo)
    Tuner2,
    /// "Both Tuners" (RSPduo dual tuner mode)
    BothTuners,
}

impl Antenna {
    pub fn label(self) -> &'static str {
        match self {
            Antenna::Default => "Default",
            Antenna::A => "Antenna A",
            Antenna::B => "Antenna B",
            Antenna::C => "Antenna C",
            Antenna::HiZ => "Hi-Z",
            Antenna::Tuner1 => "Tuner 1 50 ohm",
            Antenna::Tuner2 => "Tuner 2 50 ohm",
            Antenna::BothTuners => "Both Tuners",
        }
    }
}

impl fmt::Display for Antenna {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Antenna {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(Antenna::Default),
            "a" | "antenna a" => Ok(Antenna::A),
            "b" | "antenna b" => Ok(Antenna::B),
            "c" | "antenna c" => Ok(Antenna::C),
            "hiz" | "hi-z" | "high z" => Ok(Antenna::HiZ),
            "tuner1" | "tuner 1 50 ohm" => Ok(Antenna::Tuner1),
            "tuner2" | "tuner 2 50 ohm" => Ok(Antenna::Tuner2),
            "both" | "both tuners" => Ok(Antenna::BothTuners),
            _ => Err(Error::invalid(format!("unknown antenna: {}", s))),
        }
    }
}

/**
 * Capability descriptor of an RSP model
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    pub model: HwVersion,
    /// Number of independent tuners
    pub tuners: usize,
    pub antennas: &'static [Antenna],
    pub frequency_range: (f64, f64),
    pub if_gain_reduction_range: (u32, u32),
    pub bias_tee: bool,
    pub rf_notch: bool,
    pub dab_notch: bool,
    pub hdr_mode: bool,
}

impl Capabilities {
    pub fn for_model(model: HwVersion) -> Self {
        let base = Capabilities {
            model,
            tuners: 1,
            antennas: &[Antenna::Default],
            frequency_range: (MIN_FREQUENCY, MAX_FREQUENCY),
            if_gain_reduction_range: (MIN_IF_GAIN_REDUCTION, MAX_IF_GAIN_REDUCTION),
            bias_tee: true,
            rf_notch: true,
            dab_notch: true,
            hdr_mode: false,
        };
        match model {
            HwVersion::Rsp1 => Capabilities {
                bias_tee: false,
                rf_notch: false,
                dab_notch: false,
                ..base
            },
            HwVersion::Rsp1a | HwVersion::Rsp1b => base,
            HwVersion::Rsp2 => Capabilities {
                antennas: &[Antenna::Default, Antenna::A, Antenna::B, Antenna::HiZ],
                dab_notch: false,
                ..base
            },
            HwVersion::RspDuo => Capabilities {
                tuners: 2,
                antennas: &[
                    Antenna::Default,
                    Antenna::Tuner1,
                    Antenna::Tuner2,
                    Antenna::HiZ,
                    Antenna::BothTuners,
                ],
                ..base
            },
            HwVersion::RspDx | HwVersion::RspDxR2 => Capabilities {
                antennas: &[Antenna::Default, Antenna::A, Antenna::B, Antenna::C],
                hdr_mode: true,
                ..base
            },
        }
    }

    pub fn supports_antenna(&self, antenna: Antenna) -> bool {
        self.antennas.contains(&antenna)
    }

    pub fn supports_frequency(&self, freq: f64) -> bool {
        freq >= self.frequency_range.0 && freq <= self.frequency_range.1
    }

    pub fn supports_if_gain_reduction(&self, gain_reduction: u32) -> bool {
        gain_reduction >= self.if_gain_reduction_range.0
            && gain_reduction <= self.if_gain_reduction_range.1
    }

    /// RF gain reduction in dB for each LNA state at `freq`.
    ///
    /// The table depends on the band and, for some models, on the selected
    /// input or HDR mode. Entries are not monotonic on every model.
    pub fn rf_gain_reductions(&self, freq: f64, antenna: Antenna, hdr: bool) -> &'static [u32] {
        rf_gr_table(self.model, freq, antenna, hdr)
    }

    /// Number of LNA states available at `freq`.
    pub fn lna_states(&self, freq: f64, antenna: Antenna, hdr: bool) -> usize {
        self.rf_gain_reductions(freq, antenna, hdr).len()
    }
}

const RSP1_420M: &[u32] = &[0, 24, 19, 43];
const RSP1_1G: &[u32] = &[0, 7, 19, 26];
const RSP1_2G: &[u32] = &[0, 5, 19, 24];

const RSP1A_60M: &[u32] = &[0, 6, 12, 18, 37, 42, 61];
const RSP1A_420M: &[u32] = &[0, 6, 12, 18, 20, 26, 32, 38, 57, 62];
const RSP1A_1G: &[u32] = &[0, 7, 13, 19, 20, 27, 33, 39, 45, 64];
const RSP1A_2G: &[u32] = &[0, 6, 12, 20, 26, 32, 38, 43, 62];

const HIZ_60M: &[u32] = &[0, 6, 12, 18, 37];
const RSP2_420M: &[u32] = &[0, 10, 15, 21, 24, 34, 39, 45, 64];
const RSP2_1G: &[u32] = &[0, 7, 10, 17, 22, 41];
const RSP2_2G: &[u32] = &[0, 5, 21, 15, 15, 34];

const RSPDX_2M_HDR: &[u32] = &[
    0, 3, 6, 9, 12, 15, 18, 21, 24, 25, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60,
];
const RSPDX_12M: &[u32] = &[
    0, 3, 6, 9, 12, 15, 24, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60,
];
const RSPDX_60M: &[u32] = &[
    0, 3, 6, 9, 12, 15, 18, 24, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60,
];
const RSPDX_250M: &[u32] = &[
    0, 3, 6, 9, 12, 15, 24, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60, 63, 66, 69, 72, 75,
    78, 81, 84,
];
const RSPDX_420M: &[u32] = &[
    0, 3, 6, 9, 12, 15, 18, 24, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60, 63, 66, 69, 72,
    75, 78, 81, 84,
];
const RSPDX_1G: &[u32] = &[
    0, 7, 10, 13, 16, 19, 22, 25, 31, 34, 37, 40, 43, 46, 49, 52, 55, 58, 61, 64, 67,
];
const RSPDX_2G: &[u32] = &[
    0, 5, 8, 11, 14, 17, 20, 32, 35, 38, 41, 44, 47, 50, 53, 56, 59, 62, 65,
];

fn rf_gr_table(model: HwVersion, freq: f64, antenna: Antenna, hdr: bool) -> &'static [u32] {
    if freq > MAX_FREQUENCY {
        return &[];
    }
    match model {
        HwVersion::Rsp1 => match freq {
            f if f <= 420e6 => RSP1_420M,
            f if f <= 1000e6 => RSP1_1G,
            _ => RSP1_2G,
        },
        HwVersion::Rsp1a => match freq {
            f if f <= 60e6 => RSP1A_60M,
            f if f <= 420e6 => RSP1A_420M,
            f if f <= 1000e6 => RSP1A_1G,
            _ => RSP1A_2G,
        },
        HwVersion::Rsp1b => match freq {
            f if f <= 50e6 => RSP1A_60M,
            f if f <= 420e6 => RSP1A_420M,
            f if f <= 1000e6 => RSP1A_1G,
            _ => RSP1A_2G,
        },
        HwVersion::Rsp2 => match freq {
            f if f <= 60e6 && antenna == Antenna::HiZ => HIZ_60M,
            f if f <= 420e6 => RSP2_420M,
            f if f <= 1000e6 => RSP2_1G,
            _ => RSP2_2G,
        },
        HwVersion::RspDuo => match freq {
            f if f <= 60e6 && antenna == Antenna::HiZ => HIZ_60M,
            f if f <= 60e6 => RSP1A_60M,
            f if f <= 420e6 => RSP1A_420M,
            f if f <= 1000e6 => RSP1A_1G,
            _ => RSP1A_2G,
        },
        HwVersion::RspDx | HwVersion::RspDxR2 => match freq {
            f if f <= 2e6 && hdr => RSPDX_2M_HDR,
            f if f <= 12e6 => RSPDX_12M,
            f if f <= 60e6 => RSPDX_60M,
            f if f <= 250e6 => RSPDX_250M,
            f if f <= 420e6 => RSPDX_420M,
            f if f <= 1000e6 => RSPDX_1G,
            _ => RSPDX_2G,
        },
    }
}

/// LNA state whose RF gain reduction is closest to `gain_reduction` dB.
///
/// The whole table is scanned since it is not sorted on every model; on a
/// tie the lowest state wins.
pub fn closest_lna_state(gain_reduction: f64, table: &[u32]) -> u8 {
    let target = gain_reduction.round() as i64;
    table
        .iter()
        .enumerate()
        .min_by_key(|(i, gr)| ((i64::from(**gr) - target).abs(), *i))
        .map(|(i, _)| i as u8)
        .unwrap_or(0)
}

/// Range of RF gain in dB (negated reductions) offered by `table`.
pub fn rf_gain_range(table: &[u32]) -> (f64, f64) {
    let max = table.iter().copied().max().unwrap_or(0);
    let min = table.iter().copied().min().unwrap_or(0);
    (-f64::from(max), -f64::from(min))
}
