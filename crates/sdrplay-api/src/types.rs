//! Typed mirror of the SDRplay API v3 records.
//!
//! The vendor API hands out pointers into parameter structures that callers
//! mutate before calling `sdrplay_api_Update()`. Here the parameters are plain
//! owned values: callers keep their own [`DeviceParams`], change what they
//! need and pass it back together with the [`UpdateReason`] flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Opaque handle returned when a device is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

/// Hardware version identifiers (`SDRPLAY_RSP*_ID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwVersion {
    Rsp1,
    Rsp1a,
    Rsp1b,
    Rsp2,
    RspDuo,
    RspDx,
    RspDxR2,
}

impl HwVersion {
    pub fn from_raw(hw_ver: u8) -> Option<Self> {
        match hw_ver {
            1 => Some(HwVersion::Rsp1),
            255 => Some(HwVersion::Rsp1a),
            6 => Some(HwVersion::Rsp1b),
            2 => Some(HwVersion::Rsp2),
            3 => Some(HwVersion::RspDuo),
            4 => Some(HwVersion::RspDx),
            7 => Some(HwVersion::RspDxR2),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            HwVersion::Rsp1 => 1,
            HwVersion::Rsp1a => 255,
            HwVersion::Rsp1b => 6,
            HwVersion::Rsp2 => 2,
            HwVersion::RspDuo => 3,
            HwVersion::RspDx => 4,
            HwVersion::RspDxR2 => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HwVersion::Rsp1 => "RSP1",
            HwVersion::Rsp1a => "RSP1A",
            HwVersion::Rsp1b => "RSP1B",
            HwVersion::Rsp2 => "RSP2",
            HwVersion::RspDuo => "RSPduo",
            HwVersion::RspDx => "RSPdx",
            HwVersion::RspDxR2 => "RSPdx-R2",
        }
    }
}

impl std::fmt::Display for HwVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunerSelect {
    #[default]
    Neither,
    A,
    B,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RspDuoMode {
    #[default]
    Unknown,
    SingleTuner,
    DualTuner,
    Master,
    Slave,
}

/// One entry of `sdrplay_api_GetDevices()`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDesc {
    pub serial: String,
    pub hw_ver: HwVersion,
    pub tuner: TunerSelect,
    pub rspduo_mode: RspDuoMode,
    pub rspduo_sample_freq: f64,
    /// False when the device is already in use by another application.
    pub valid: bool,
}

impl DeviceDesc {
    pub fn new(serial: impl Into<String>, hw_ver: HwVersion) -> Self {
        let (tuner, rspduo_mode) = match hw_ver {
            HwVersion::RspDuo => (TunerSelect::Both, RspDuoMode::SingleTuner),
            _ => (TunerSelect::A, RspDuoMode::Unknown),
        };
        Self {
            serial: serial.into(),
            hw_ver,
            tuner,
            rspduo_mode,
            rspduo_sample_freq: 0.0,
            valid: true,
        }
    }
}

/// IF bandwidth (`sdrplay_api_Bw_MHzT`), values in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Bandwidth {
    #[default]
    Bw0_200,
    Bw0_300,
    Bw0_600,
    Bw1_536,
    Bw5_000,
    Bw6_000,
    Bw7_000,
    Bw8_000,
}

impl Bandwidth {
    pub const ALL: [Bandwidth; 8] = [
        Bandwidth::Bw0_200,
        Bandwidth::Bw0_300,
        Bandwidth::Bw0_600,
        Bandwidth::Bw1_536,
        Bandwidth::Bw5_000,
        Bandwidth::Bw6_000,
        Bandwidth::Bw7_000,
        Bandwidth::Bw8_000,
    ];

    pub fn hz(self) -> f64 {
        match self {
            Bandwidth::Bw0_200 => 200e3,
            Bandwidth::Bw0_300 => 300e3,
            Bandwidth::Bw0_600 => 600e3,
            Bandwidth::Bw1_536 => 1536e3,
            Bandwidth::Bw5_000 => 5000e3,
            Bandwidth::Bw6_000 => 6000e3,
            Bandwidth::Bw7_000 => 7000e3,
            Bandwidth::Bw8_000 => 8000e3,
        }
    }
}

/// Low IF frequency (`sdrplay_api_If_kHzT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IfType {
    #[default]
    Zero,
    If0_450,
    If1_620,
    If2_048,
}

impl IfType {
    pub fn hz(self) -> f64 {
        match self {
            IfType::Zero => 0.0,
            IfType::If0_450 => 450e3,
            IfType::If1_620 => 1620e3,
            IfType::If2_048 => 2048e3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgcControl {
    #[default]
    Disable,
    Agc100Hz,
    Agc50Hz,
    Agc5Hz,
    Enable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rsp2Antenna {
    #[default]
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AmPort {
    #[default]
    Port2,
    Port1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RspDxAntenna {
    #[default]
    A,
    B,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rsp1aParams {
    pub rf_notch_enable: bool,
    pub rf_dab_notch_enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RspDxParams {
    pub hdr_enable: bool,
    pub bias_t_enable: bool,
    pub antenna: RspDxAntenna,
    pub rf_notch_enable: bool,
    pub rf_dab_notch_enable: bool,
}

/// Device-wide parameters (`sdrplay_api_DevParamsT`).
///
/// Absent for the RSPduo slave, which follows the master's sample clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DevParams {
    pub ppm: f64,
    pub fs_hz: f64,
    pub samples_per_packet: u32,
    pub rsp1a: Rsp1aParams,
    pub rsp2_ext_ref_output: bool,
    pub rspduo_ext_ref_output: bool,
    pub rspdx: RspDxParams,
}

impl Default for DevParams {
    fn default() -> Self {
        Self {
            ppm: 0.0,
            fs_hz: 2_000_000.0,
            samples_per_packet: 0,
            rsp1a: Rsp1aParams::default(),
            rsp2_ext_ref_output: false,
            rspduo_ext_ref_output: false,
            rspdx: RspDxParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainParams {
    /// IF gain reduction in dB.
    pub gr_db: u32,
    pub lna_state: u8,
    pub curr: f32,
}

impl Default for GainParams {
    fn default() -> Self {
        Self {
            gr_db: 50,
            lna_state: 0,
            curr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DcOffsetTuner {
    pub dc_cal: u8,
    pub speed_up: u8,
    pub track_time: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerParams {
    pub bandwidth: Bandwidth,
    pub if_type: IfType,
    pub gain: GainParams,
    pub rf_hz: f64,
    pub dc_offset_tuner: DcOffsetTuner,
}

impl Default for TunerParams {
    fn default() -> Self {
        Self {
            bandwidth: Bandwidth::Bw0_200,
            if_type: IfType::Zero,
            gain: GainParams::default(),
            rf_hz: 200_000_000.0,
            dc_offset_tuner: DcOffsetTuner {
                dc_cal: 3,
                speed_up: 0,
                track_time: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DecimationParams {
    pub enable: bool,
    pub factor: u8,
    pub wide_band_signal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgcParams {
    pub enable: AgcControl,
    pub set_point_dbfs: i32,
}

impl Default for AgcParams {
    fn default() -> Self {
        Self {
            enable: AgcControl::Agc50Hz,
            set_point_dbfs: -60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlParams {
    pub dc_enable: bool,
    pub iq_enable: bool,
    pub decimation: DecimationParams,
    pub agc: AgcParams,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            dc_enable: true,
            iq_enable: true,
            decimation: DecimationParams {
                enable: false,
                factor: 1,
                wide_band_signal: false,
            },
            agc: AgcParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rsp2TunerParams {
    pub bias_t_enable: bool,
    pub am_port: AmPort,
    pub antenna: Rsp2Antenna,
    pub rf_notch_enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RspDuoTunerParams {
    pub bias_t_enable: bool,
    pub tuner1_am_port: AmPort,
    pub tuner1_am_notch_enable: bool,
    pub rf_notch_enable: bool,
    pub rf_dab_notch_enable: bool,
}

/// Per-tuner parameters (`sdrplay_api_RxChannelParamsT`).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RxChannelParams {
    pub tuner: TunerParams,
    pub ctrl: ControlParams,
    pub rsp1a_bias_t_enable: bool,
    pub rsp2: Rsp2TunerParams,
    pub rspduo: RspDuoTunerParams,
}

/// Everything `sdrplay_api_GetDeviceParams()` exposes for a selected device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceParams {
    pub dev: Option<DevParams>,
    pub rx_a: RxChannelParams,
    pub rx_b: Option<RxChannelParams>,
}

impl DeviceParams {
    pub fn channel(&self, tuner: TunerSelect) -> Option<&RxChannelParams> {
        match tuner {
            TunerSelect::B => self.rx_b.as_ref(),
            TunerSelect::Neither => None,
            _ => Some(&self.rx_a),
        }
    }

    pub fn channel_mut(&mut self, tuner: TunerSelect) -> Option<&mut RxChannelParams> {
        match tuner {
            TunerSelect::B => self.rx_b.as_mut(),
            TunerSelect::Neither => None,
            _ => Some(&mut self.rx_a),
        }
    }
}

bitflags! {
    /// Parameter groups to apply (`sdrplay_api_ReasonForUpdateT`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateReason: u32 {
        const DEV_FS = 0x0000_0001;
        const DEV_PPM = 0x0000_0002;
        const DEV_SYNC_UPDATE = 0x0000_0004;
        const DEV_RESET_FLAGS = 0x0000_0008;
        const RSP1A_BIAS_T_CONTROL = 0x0000_0010;
        const RSP1A_RF_NOTCH_CONTROL = 0x0000_0020;
        const RSP1A_RF_DAB_NOTCH_CONTROL = 0x0000_0040;
        const RSP2_BIAS_T_CONTROL = 0x0000_0080;
        const RSP2_AM_PORT_SELECT = 0x0000_0100;
        const RSP2_ANTENNA_CONTROL = 0x0000_0200;
        const RSP2_RF_NOTCH_CONTROL = 0x0000_0400;
        const RSP2_EXT_REF_CONTROL = 0x0000_0800;
        const RSPDUO_EXT_REF_CONTROL = 0x0000_1000;
        const TUNER_GR = 0x0000_8000;
        const TUNER_GR_LIMITS = 0x0001_0000;
        const TUNER_FRF = 0x0002_0000;
        const TUNER_BW_TYPE = 0x0004_0000;
        const TUNER_IF_TYPE = 0x0008_0000;
        const TUNER_DC_OFFSET = 0x0010_0000;
        const TUNER_LO_MODE = 0x0020_0000;
        const CTRL_DC_OFFSET_IQ_IMBALANCE = 0x0040_0000;
        const CTRL_DECIMATION = 0x0080_0000;
        const CTRL_AGC = 0x0100_0000;
        const CTRL_ADSB_MODE = 0x0200_0000;
        const CTRL_OVERLOAD_MSG_ACK = 0x0400_0000;
        const RSPDUO_BIAS_T_CONTROL = 0x0800_0000;
        const RSPDUO_AM_PORT_SELECT = 0x1000_0000;
        const RSPDUO_TUNER1_AM_NOTCH_CONTROL = 0x2000_0000;
        const RSPDUO_RF_NOTCH_CONTROL = 0x4000_0000;
        const RSPDUO_RF_DAB_NOTCH_CONTROL = 0x8000_0000;
    }
}

bitflags! {
    /// Extension flags (`sdrplay_api_ReasonForUpdateExtension1T`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateReasonExt1: u32 {
        const RSPDX_HDR_ENABLE = 0x0000_0001;
        const RSPDX_BIAS_T_CONTROL = 0x0000_0002;
        const RSPDX_ANTENNA_CONTROL = 0x0000_0004;
        const RSPDX_RF_NOTCH_CONTROL = 0x0000_0008;
        const RSPDX_RF_DAB_NOTCH_CONTROL = 0x0000_0010;
        const RSPDX_HDR_BW = 0x0000_0020;
    }
}

/// Metadata passed with every block of samples (`sdrplay_api_StreamCbParamsT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamCbParams {
    pub first_sample_num: u32,
    pub gr_changed: bool,
    pub rf_changed: bool,
    pub fs_changed: bool,
    pub num_samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOverload {
    Detected,
    Corrected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RspDuoModeChange {
    MasterInitialised,
    SlaveAttached,
    SlaveDetached,
    SlaveInitialised,
    SlaveUninitialised,
    MasterDllDisappeared,
    SlaveDllDisappeared,
}

/// Asynchronous notifications (`sdrplay_api_EventT` with its parameters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    GainChange {
        gr_db: u32,
        lna_gr_db: u32,
        curr_gain: f64,
    },
    PowerOverloadChange(PowerOverload),
    DeviceRemoved,
    RspDuoModeChange(RspDuoModeChange),
    DeviceFailure,
}
