//! Stream configuration
//!
//! A [`StreamConfig`] describes one streaming epoch. Frequency, gains and the
//! front-end switches can be changed while streaming; the sample rate,
//! decimation, tuner selection and RSPduo mode are fixed for the epoch and
//! changing them requires a stop/reconfigure/start cycle.
//!
//! # Example
//!
//! ```
//! use sdrplay3::config::StreamConfig;
//!
//! let config: StreamConfig = serde_json::from_str(
//!     r#"{ "center_freq": 1090e6, "sample_rate": 2e6, "gain_reduction": 40 }"#,
//! )?;
//! assert_eq!(config.lna_state, 0);
//! # Ok::<(), serde_json::Error>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use sdrplay_api::{Bandwidth, IfType};

use crate::error::{Error, Result};
use crate::model::{Antenna, Capabilities, HwVersion, RSPDUO_SHARED_SAMPLE_RATES, SAMPLE_RATES};
use crate::ring_buffer::DEFAULT_CAPACITY;

/**
 * Device selector for RSP devices
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Select device by index among the enumerated devices
    Index(usize),
    /// Select device by serial number
    Serial(String),
}

impl Default for DeviceSelector {
    fn default() -> Self {
        DeviceSelector::Index(0)
    }
}

impl DeviceSelector {
    /// Parse a selector string: up to two characters is an index, anything
    /// longer is a serial number. An empty string (or quoted empty string)
    /// selects the first device.
    pub fn parse(selector: &str) -> Result<Self> {
        let s = selector.trim();
        if s.is_empty() || s == "''" || s == "\"\"" || s == "\"\"\"\"" {
            return Ok(DeviceSelector::Index(0));
        }
        if s.len() <= 2 {
            return s
                .parse()
                .map(DeviceSelector::Index)
                .map_err(|_| Error::invalid(format!("invalid device index: {}", s)));
        }
        Ok(DeviceSelector::Serial(s.to_string()))
    }
}

impl std::str::FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DeviceSelector::parse(s)
    }
}

/// RSPduo operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DuoMode {
    /// One tuner streams, the other is idle
    #[default]
    SingleTuner,
    /// Both tuners stream with their own frequency and gain (independent RX)
    DualTuner,
    /// Both tuners stream with one shared configuration (diversity reception)
    Diversity,
    /// This process owns the sample clock; another application may attach as slave
    Master,
    /// Like `Master`, with an 8 MHz sample clock
    Master8Mhz,
    /// Attach to a master running in another application
    Slave,
}

impl DuoMode {
    /// Sample frequency imposed by the mode, if any.
    pub fn sample_freq(self) -> Option<f64> {
        match self {
            DuoMode::DualTuner | DuoMode::Diversity | DuoMode::Master => Some(6e6),
            DuoMode::Master8Mhz => Some(8e6),
            DuoMode::SingleTuner | DuoMode::Slave => None,
        }
    }

    /// Both tuners stream.
    pub fn is_dual(self) -> bool {
        matches!(self, DuoMode::DualTuner | DuoMode::Diversity)
    }

    /// The output rate is limited to the low-IF rates of the shared clock.
    pub fn shares_clock(self) -> bool {
        self != DuoMode::SingleTuner
    }

    pub fn channels(self) -> usize {
        if self.is_dual() { 2 } else { 1 }
    }
}

/// Stream configuration of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Center frequency in Hz (hot)
    pub center_freq: f64,
    /// Output sample rate in Hz (restart-only)
    pub sample_rate: f64,
    /// IF gain reduction in dB (hot)
    pub gain_reduction: u32,
    /// LNA state, index into the model's RF gain reduction table (hot)
    pub lna_state: u8,
    /// Antenna or tuner input (hot, except when it changes the RSPduo tuner)
    pub antenna: Antenna,
    /// Bias-T power on the antenna input (hot)
    pub bias_tee: bool,
    /// Decimation factor, `None` to derive it from the sample rate (restart-only)
    pub decimation: Option<u8>,
    /// IF bandwidth in Hz, `None` for the largest one that fits the sample rate (hot)
    pub bandwidth: Option<f64>,
    /// Hardware AGC (hot)
    pub agc: bool,
    /// AGC set point in dBFS (hot)
    pub agc_set_point: i32,
    /// Frequency correction in ppm (hot)
    pub ppm: f64,
    pub dc_offset_mode: bool,
    pub iq_balance_mode: bool,
    pub rf_notch: bool,
    pub dab_notch: bool,
    /// RSPdx HDR mode (hot)
    pub hdr_mode: bool,
    /// RSPduo operating mode (restart-only)
    pub duo_mode: DuoMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            center_freq: 100e6,
            sample_rate: 2e6,
            gain_reduction: 40,
            lna_state: 0,
            antenna: Antenna::Default,
            bias_tee: false,
            decimation: None,
            bandwidth: None,
            agc: false,
            agc_set_point: -30,
            ppm: 0.0,
            dc_offset_mode: true,
            iq_balance_mode: true,
            rf_notch: false,
            dab_notch: false,
            hdr_mode: false,
            duo_mode: DuoMode::SingleTuner,
        }
    }
}

impl StreamConfig {
    /// Create a new configuration, other settings at their defaults
    pub fn new(center_freq: f64, sample_rate: f64, gain_reduction: u32, lna_state: u8) -> Self {
        Self {
            center_freq,
            sample_rate,
            gain_reduction,
            lna_state,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// True if going from `self` to `other` needs a new streaming epoch.
    pub fn requires_restart(&self, other: &StreamConfig) -> bool {
        self.sample_rate != other.sample_rate
            || self.decimation != other.decimation
            || self.duo_mode != other.duo_mode
            || self.tuner() != other.tuner()
    }

    /// RSPduo tuner driven by the antenna selection.
    pub(crate) fn tuner(&self) -> sdrplay_api::TunerSelect {
        use sdrplay_api::TunerSelect;
        match (self.duo_mode, self.antenna) {
            (DuoMode::DualTuner | DuoMode::Diversity, _) => TunerSelect::Both,
            (_, Antenna::Tuner2) => TunerSelect::B,
            _ => TunerSelect::A,
        }
    }

    /// Check the configuration against a model and plan its sample rate.
    ///
    /// Sample rate, decimation and antenna combinations the model cannot do
    /// are `UnsupportedConfig`; out of range tuning values are `InvalidParameter`.
    pub fn validate(&self, caps: &Capabilities) -> Result<SampleRatePlan> {
        if !caps.supports_antenna(self.antenna) {
            return Err(Error::unsupported(format!(
                "{} has no input \"{}\"",
                caps.model, self.antenna
            )));
        }
        if caps.model == HwVersion::RspDuo {
            match (self.duo_mode.is_dual(), self.antenna) {
                (true, Antenna::Default | Antenna::BothTuners | Antenna::HiZ) => {}
                (true, a) => {
                    return Err(Error::unsupported(format!(
                        "input \"{}\" is not available in dual tuner mode",
                        a
                    )));
                }
                (_, Antenna::BothTuners) => {
                    return Err(Error::unsupported(
                        "\"Both Tuners\" requires dual tuner mode",
                    ));
                }
                _ => {}
            }
        } else if self.duo_mode != DuoMode::SingleTuner {
            return Err(Error::unsupported(format!(
                "{} has no RSPduo modes",
                caps.model
            )));
        }
        if self.hdr_mode && !caps.hdr_mode {
            return Err(Error::unsupported(format!("{} has no HDR mode", caps.model)));
        }
        if self.bias_tee && !caps.bias_tee {
            return Err(Error::unsupported(format!("{} has no bias-T", caps.model)));
        }
        if self.rf_notch && !caps.rf_notch {
            return Err(Error::unsupported(format!("{} has no RF notch", caps.model)));
        }
        if self.dab_notch && !caps.dab_notch {
            return Err(Error::unsupported(format!("{} has no DAB notch", caps.model)));
        }

        let plan = SampleRatePlan::new(self.sample_rate, self.decimation, self.duo_mode)?;

        if !caps.supports_frequency(self.center_freq) {
            return Err(Error::invalid(format!(
                "center frequency {} Hz outside {}..={} Hz",
                self.center_freq, caps.frequency_range.0, caps.frequency_range.1
            )));
        }
        if !caps.supports_if_gain_reduction(self.gain_reduction) {
            return Err(Error::invalid(format!(
                "gain reduction {} dB outside {}..={} dB",
                self.gain_reduction, caps.if_gain_reduction_range.0, caps.if_gain_reduction_range.1
            )));
        }
        let states = caps.lna_states(self.center_freq, self.antenna, self.hdr_mode);
        if usize::from(self.lna_state) >= states {
            return Err(Error::invalid(format!(
                "LNA state {} not available at {} Hz ({} states)",
                self.lna_state, self.center_freq, states
            )));
        }
        if let Some(bw) = self.bandwidth {
            bandwidth_for(bw, plan.output_rate)?;
        }
        Ok(plan)
    }

    /// IF bandwidth to program for `plan`.
    pub fn bandwidth_type(&self, plan: &SampleRatePlan) -> Result<Bandwidth> {
        match self.bandwidth {
            Some(bw) => bandwidth_for(bw, plan.output_rate),
            None => Ok(auto_bandwidth(plan.output_rate)),
        }
    }
}

/// How the device produces a given output rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRatePlan {
    /// ADC sample frequency
    pub fs_hz: f64,
    pub decimation: u8,
    pub if_type: IfType,
    /// Rate of the delivered samples
    pub output_rate: f64,
}

const LOW_IF_RATES: [f64; 6] = [62.5e3, 125e3, 250e3, 500e3, 1000e3, 2000e3];
const DECIMATIONS: [u8; 6] = [1, 2, 4, 8, 16, 32];

impl SampleRatePlan {
    pub fn new(rate: f64, decimation: Option<u8>, duo_mode: DuoMode) -> Result<Self> {
        if duo_mode.shares_clock() {
            if !RSPDUO_SHARED_SAMPLE_RATES.contains(&rate) {
                return Err(Error::unsupported(format!(
                    "sample rate {} Hz not available in RSPduo {:?} mode",
                    rate, duo_mode
                )));
            }
            // A slave runs on the master's clock, nominally 6 MHz.
            let fs = duo_mode.sample_freq().unwrap_or(6e6);
            let if_type = if fs == 8e6 {
                IfType::If2_048
            } else {
                IfType::If1_620
            };
            return Ok(SampleRatePlan {
                fs_hz: fs,
                decimation: (2000e3 / rate) as u8,
                if_type,
                output_rate: rate,
            });
        }

        if let Some(d) = decimation {
            if !DECIMATIONS.contains(&d) {
                return Err(Error::unsupported(format!("invalid decimation: {}", d)));
            }
            let fs = rate * f64::from(d);
            if !(2000e3..=10000e3).contains(&fs) {
                return Err(Error::unsupported(format!(
                    "sample rate {} Hz with decimation {} needs fs = {} Hz",
                    rate, d, fs
                )));
            }
            return Ok(SampleRatePlan {
                fs_hz: fs,
                decimation: d,
                if_type: IfType::Zero,
                output_rate: rate,
            });
        }

        if !SAMPLE_RATES.contains(&rate) {
            return Err(Error::unsupported(format!("invalid sample rate: {} Hz", rate)));
        }
        if LOW_IF_RATES.contains(&rate) {
            let decimation = (2000e3 / rate) as u8;
            return Ok(SampleRatePlan {
                fs_hz: 6000e3,
                decimation,
                if_type: IfType::If1_620,
                output_rate: 2000e3 / f64::from(decimation),
            });
        }
        DECIMATIONS
            .iter()
            .map(|&d| (d, rate * f64::from(d)))
            .find(|(_, fs)| *fs > 2000e3)
            .map(|(decimation, fs_hz)| SampleRatePlan {
                fs_hz,
                decimation,
                if_type: IfType::Zero,
                output_rate: rate,
            })
            .ok_or_else(|| Error::unsupported(format!("invalid sample rate: {} Hz", rate)))
    }
}

/// Largest IF bandwidth not above `sample_rate` (with 1 kHz of margin).
pub fn auto_bandwidth(sample_rate: f64) -> Bandwidth {
    Bandwidth::ALL
        .iter()
        .copied()
        .take_while(|bw| bw.hz() <= sample_rate + 1e3)
        .last()
        .unwrap_or(Bandwidth::Bw0_200)
}

/// IF bandwidth for an explicit request, which may not exceed the sample rate.
pub fn bandwidth_for(bandwidth: f64, sample_rate: f64) -> Result<Bandwidth> {
    if bandwidth > sample_rate {
        return Err(Error::invalid(format!(
            "bandwidth {} Hz cannot be greater than sample rate {} Hz",
            bandwidth, sample_rate
        )));
    }
    // 1 kHz of margin
    let bw = bandwidth + 1e3;
    Ok(Bandwidth::ALL
        .windows(2)
        .find(|w| bw < w[1].hz())
        .map(|w| w[0])
        .unwrap_or(Bandwidth::Bw8_000))
}

/// Runtime policy of a device controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    /// Slots in each channel's ring buffer
    pub ring_capacity: usize,
    /// Bound on `stop()` waiting for the stream to quiesce
    pub shutdown_timeout: Duration,
    /// Bound on waiting for the device to acknowledge a live update
    pub update_timeout: Duration,
    /// Log every sample sequence gap
    pub sample_sequence_gaps_check: bool,
    /// Log gain change events
    pub show_gain_changes: bool,
    /// Enable the service's debug output
    pub debug_mode: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_CAPACITY,
            shutdown_timeout: Duration::from_secs(2),
            update_timeout: Duration::from_millis(500),
            sample_sequence_gaps_check: false,
            show_gain_changes: false,
            debug_mode: false,
        }
    }
}
