//! Device controller
//!
//! A [`DeviceController`] owns one selected RSP device: it applies the
//! [`StreamConfig`] to the service's parameter record, registers the stream
//! callbacks on `start()`, and unregisters them on `stop()` with a bounded
//! wait. Every control call is serialized by one mutex, which the callback
//! thread never takes. Health and state queries read a separate list of the
//! current sessions and never wait on a control call.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use num_complex::Complex;
//! use sdrplay3::{
//!     ControllerOptions, DeviceController, DeviceRegistry, DeviceSelector, Produced, StreamConfig,
//! };
//! use sdrplay3::api::{HwVersion, sim::SimulatedApi};
//!
//! let api = Arc::new(SimulatedApi::with_device("2305001234", HwVersion::Rsp1a));
//! let controller = DeviceController::open(
//!     api,
//!     DeviceRegistry::global(),
//!     &DeviceSelector::default(),
//!     StreamConfig::new(1090e6, 2e6, 40, 3),
//!     ControllerOptions::default(),
//! )?;
//! let mut port = controller.output_port(0)?;
//! controller.start()?;
//! let mut buf = vec![Complex::<f32>::default(); 4096];
//! while let Produced::Items(n) = port.pull(&mut buf, 4096) {
//!     // process buf[..n]
//! #   break;
//! }
//! controller.close()?;
//! # Ok::<(), sdrplay3::Error>(())
//! ```

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use sdrplay_api::{
    API_VERSION, AgcControl, AmPort, Api, DcOffsetTuner, DeviceDesc, DeviceId, DeviceParams,
    Rsp2Antenna, RspDuoMode, RspDxAntenna, RxChannelParams, TunerSelect, UpdateReason,
    UpdateReasonExt1,
};

use crate::adapter::{CallbackSink, StreamAdapter, UpdateFlags};
use crate::config::{ControllerOptions, DeviceSelector, DuoMode, SampleRatePlan, StreamConfig};
use crate::error::{Error, Result};
use crate::model::{Antenna, Capabilities, HwVersion, closest_lna_state, rf_gain_range};
use crate::port::{Health, OutputPort};
use crate::registry::{Claim, DeviceRegistry};
use crate::ring_buffer::{RingMonitor, ring_buffer};
use crate::session::{Session, SessionState};

/**
 * A selected device: service handle, descriptor and capabilities
 *
 * Owned by exactly one controller; the registry claim is released when the
 * handle is dropped.
 */
#[derive(Debug)]
pub struct DeviceHandle {
    id: DeviceId,
    desc: DeviceDesc,
    capabilities: Capabilities,
    _claim: Claim,
}

impl DeviceHandle {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn serial(&self) -> &str {
        &self.desc.serial
    }

    pub fn model(&self) -> HwVersion {
        self.desc.hw_ver
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Tuner(s) parameter updates are addressed to.
    pub fn tuner(&self) -> TunerSelect {
        self.desc.tuner
    }
}

struct Channel {
    session: Arc<Session>,
    adapter: Arc<StreamAdapter>,
    monitor: RingMonitor<num_complex::Complex<i16>>,
    port: Option<OutputPort>,
}

impl Channel {
    fn new(index: usize, capacity: usize) -> Self {
        let session = Session::new(index);
        session.configure();
        let (producer, consumer) = ring_buffer(capacity);
        Channel {
            adapter: Arc::new(StreamAdapter::new(session.clone(), producer)),
            monitor: consumer.monitor(),
            port: Some(OutputPort::new(session.clone(), consumer)),
            session,
        }
    }

    fn view(&self) -> ChannelView {
        ChannelView {
            session: self.session.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

/// Read-only side of a channel for health queries
#[derive(Clone)]
struct ChannelView {
    session: Arc<Session>,
    monitor: RingMonitor<num_complex::Complex<i16>>,
}

/// Per-tuner settings of an RSPduo in independent RX mode
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct TunerOverride {
    /// Overrides `center_freq`
    pub rf_hz: Option<f64>,
    /// Overrides `gain_reduction` and `lna_state`
    pub gain: Option<(u32, u8)>,
}

struct Inner {
    handle: Option<DeviceHandle>,
    config: StreamConfig,
    plan: SampleRatePlan,
    params: DeviceParams,
    /// Per-tuner settings for channels 0 and 1
    tuners: [TunerOverride; 2],
    channels: Vec<Channel>,
    /// Registered with the service between `start()` and `stop()`
    sink: Option<Arc<CallbackSink>>,
    fault: Option<String>,
}

impl Inner {
    fn is_started(&self) -> bool {
        self.sink.is_some()
    }
}

/// Controller of one RSP device
pub struct DeviceController {
    api: Arc<dyn Api>,
    options: ControllerOptions,
    flags: Arc<UpdateFlags>,
    inner: Mutex<Inner>,
    /// Sessions of the current channels, replaced along with them
    views: RwLock<Vec<ChannelView>>,
}

fn duo_mode(mode: DuoMode) -> RspDuoMode {
    match mode {
        DuoMode::SingleTuner => RspDuoMode::SingleTuner,
        DuoMode::DualTuner | DuoMode::Diversity => RspDuoMode::DualTuner,
        DuoMode::Master | DuoMode::Master8Mhz => RspDuoMode::Master,
        DuoMode::Slave => RspDuoMode::Slave,
    }
}

/// Fill in the RSPduo fields the service reads on selection.
fn prepare_selection(desc: &mut DeviceDesc, config: &StreamConfig) {
    if desc.hw_ver != HwVersion::RspDuo {
        return;
    }
    desc.tuner = config.tuner();
    desc.rspduo_mode = duo_mode(config.duo_mode);
    if let Some(fs) = config.duo_mode.sample_freq() {
        desc.rspduo_sample_freq = fs;
    }
}

fn set<T: PartialEq, F: std::ops::BitOrAssign>(field: &mut T, value: T, acc: &mut F, flag: F) {
    if *field != value {
        *field = value;
        *acc |= flag;
    }
}

/// Write `config` into the service's parameter record.
///
/// Returns the update reasons for the fields that changed.
pub(crate) fn write_params(
    params: &mut DeviceParams,
    config: &StreamConfig,
    plan: &SampleRatePlan,
    model: HwVersion,
    tuners: [TunerOverride; 2],
) -> Result<(UpdateReason, UpdateReasonExt1)> {
    let mut reason = UpdateReason::empty();
    let mut ext1 = UpdateReasonExt1::empty();
    let bandwidth = config.bandwidth_type(plan)?;

    if let Some(dev) = params.dev.as_mut() {
        set(&mut dev.fs_hz, plan.fs_hz, &mut reason, UpdateReason::DEV_FS);
        set(&mut dev.ppm, config.ppm, &mut reason, UpdateReason::DEV_PPM);
        match model {
            HwVersion::Rsp1a | HwVersion::Rsp1b => {
                let rsp1a = &mut dev.rsp1a;
                set(
                    &mut rsp1a.rf_notch_enable,
                    config.rf_notch,
                    &mut reason,
                    UpdateReason::RSP1A_RF_NOTCH_CONTROL,
                );
                set(
                    &mut rsp1a.rf_dab_notch_enable,
                    config.dab_notch,
                    &mut reason,
                    UpdateReason::RSP1A_RF_DAB_NOTCH_CONTROL,
                );
            }
            HwVersion::RspDx | HwVersion::RspDxR2 => {
                let dx = &mut dev.rspdx;
                let antenna = match config.antenna {
                    Antenna::B => RspDxAntenna::B,
                    Antenna::C => RspDxAntenna::C,
                    _ => RspDxAntenna::A,
                };
                set(&mut dx.hdr_enable, config.hdr_mode, &mut ext1, UpdateReasonExt1::RSPDX_HDR_ENABLE);
                set(&mut dx.bias_t_enable, config.bias_tee, &mut ext1, UpdateReasonExt1::RSPDX_BIAS_T_CONTROL);
                set(&mut dx.antenna, antenna, &mut ext1, UpdateReasonExt1::RSPDX_ANTENNA_CONTROL);
                set(&mut dx.rf_notch_enable, config.rf_notch, &mut ext1, UpdateReasonExt1::RSPDX_RF_NOTCH_CONTROL);
                set(
                    &mut dx.rf_dab_notch_enable,
                    config.dab_notch,
                    &mut ext1,
                    UpdateReasonExt1::RSPDX_RF_DAB_NOTCH_CONTROL,
                );
            }
            _ => {}
        }
    }

    let mut write_channel = |ch: &mut RxChannelParams, o: TunerOverride| {
        let (gain_reduction, lna_state) = o.gain.unwrap_or((config.gain_reduction, config.lna_state));
        let tuner = &mut ch.tuner;
        set(
            &mut tuner.rf_hz,
            o.rf_hz.unwrap_or(config.center_freq),
            &mut reason,
            UpdateReason::TUNER_FRF,
        );
        set(&mut tuner.gain.gr_db, gain_reduction, &mut reason, UpdateReason::TUNER_GR);
        set(&mut tuner.gain.lna_state, lna_state, &mut reason, UpdateReason::TUNER_GR);
        set(&mut tuner.bandwidth, bandwidth, &mut reason, UpdateReason::TUNER_BW_TYPE);
        set(&mut tuner.if_type, plan.if_type, &mut reason, UpdateReason::TUNER_IF_TYPE);

        let decimation = &mut ch.ctrl.decimation;
        set(&mut decimation.factor, plan.decimation, &mut reason, UpdateReason::CTRL_DECIMATION);
        set(&mut decimation.enable, plan.decimation > 1, &mut reason, UpdateReason::CTRL_DECIMATION);

        let agc = if config.agc {
            AgcControl::Enable
        } else {
            AgcControl::Disable
        };
        set(&mut ch.ctrl.agc.enable, agc, &mut reason, UpdateReason::CTRL_AGC);
        set(&mut ch.ctrl.agc.set_point_dbfs, config.agc_set_point, &mut reason, UpdateReason::CTRL_AGC);

        let dc_before = ch.ctrl.dc_enable;
        set(
            &mut ch.ctrl.dc_enable,
            config.dc_offset_mode,
            &mut reason,
            UpdateReason::CTRL_DC_OFFSET_IQ_IMBALANCE,
        );
        set(
            &mut ch.ctrl.iq_enable,
            config.iq_balance_mode,
            &mut reason,
            UpdateReason::CTRL_DC_OFFSET_IQ_IMBALANCE,
        );
        if ch.ctrl.dc_enable && !dc_before {
            ch.tuner.dc_offset_tuner = DcOffsetTuner {
                dc_cal: 4,
                speed_up: 0,
                track_time: 63,
            };
        }

        match model {
            HwVersion::Rsp1a | HwVersion::Rsp1b => {
                set(
                    &mut ch.rsp1a_bias_t_enable,
                    config.bias_tee,
                    &mut reason,
                    UpdateReason::RSP1A_BIAS_T_CONTROL,
                );
            }
            HwVersion::Rsp2 => {
                let (antenna, am_port) = match config.antenna {
                    Antenna::B => (Rsp2Antenna::B, AmPort::Port2),
                    Antenna::HiZ => (Rsp2Antenna::A, AmPort::Port1),
                    _ => (Rsp2Antenna::A, AmPort::Port2),
                };
                let rsp2 = &mut ch.rsp2;
                set(&mut rsp2.bias_t_enable, config.bias_tee, &mut reason, UpdateReason::RSP2_BIAS_T_CONTROL);
                set(&mut rsp2.antenna, antenna, &mut reason, UpdateReason::RSP2_ANTENNA_CONTROL);
                set(&mut rsp2.am_port, am_port, &mut reason, UpdateReason::RSP2_AM_PORT_SELECT);
                set(&mut rsp2.rf_notch_enable, config.rf_notch, &mut reason, UpdateReason::RSP2_RF_NOTCH_CONTROL);
            }
            HwVersion::RspDuo => {
                let am_port = if config.antenna == Antenna::HiZ {
                    AmPort::Port1
                } else {
                    AmPort::Port2
                };
                let duo = &mut ch.rspduo;
                set(&mut duo.bias_t_enable, config.bias_tee, &mut reason, UpdateReason::RSPDUO_BIAS_T_CONTROL);
                set(&mut duo.tuner1_am_port, am_port, &mut reason, UpdateReason::RSPDUO_AM_PORT_SELECT);
                set(&mut duo.rf_notch_enable, config.rf_notch, &mut reason, UpdateReason::RSPDUO_RF_NOTCH_CONTROL);
                set(
                    &mut duo.rf_dab_notch_enable,
                    config.dab_notch,
                    &mut reason,
                    UpdateReason::RSPDUO_RF_DAB_NOTCH_CONTROL,
                );
            }
            _ => {}
        }
    };

    match config.tuner() {
        TunerSelect::Both => {
            write_channel(&mut params.rx_a, tuners[0]);
            if let Some(rx_b) = params.rx_b.as_mut() {
                write_channel(rx_b, tuners[1]);
            }
        }
        TunerSelect::B if params.rx_b.is_some() => {
            if let Some(rx_b) = params.rx_b.as_mut() {
                write_channel(rx_b, tuners[0]);
            }
        }
        _ => write_channel(&mut params.rx_a, tuners[0]),
    }
    Ok((reason, ext1))
}

impl DeviceController {
    /// Select a device and prepare it with `config`.
    ///
    /// The returned controller is in the `Configuring` state: its output
    /// ports can be taken and its parameters changed before `start()`.
    pub fn open(
        api: Arc<dyn Api>,
        registry: Arc<DeviceRegistry>,
        selector: &DeviceSelector,
        config: StreamConfig,
        options: ControllerOptions,
    ) -> Result<Self> {
        let version = api.api_version()?;
        if (version - API_VERSION).abs() > 1e-3 {
            return Err(sdrplay_api::Error::VersionMismatch {
                expected: API_VERSION,
                found: version,
            }
            .into());
        }

        api.lock_device_api()?;
        let selected = Self::select(&*api, &registry, selector, &config);
        if let Err(e) = api.unlock_device_api() {
            error!("{}", e);
        }
        let (handle, plan) = selected?;

        let prepared = api
            .get_device_params(handle.id)
            .map_err(Error::from)
            .and_then(|mut params| {
                write_params(&mut params, &config, &plan, handle.model(), Default::default())?;
                Ok(params)
            });
        let params = match prepared {
            Ok(params) => params,
            Err(e) => {
                if let Err(release) = api.release_device(handle.id) {
                    error!("{}", release);
                }
                return Err(e);
            }
        };

        info!(
            "opened {} {} - freq={} rate={} fs={} decimation={} if={:?}",
            handle.model(),
            handle.serial(),
            config.center_freq,
            plan.output_rate,
            plan.fs_hz,
            plan.decimation,
            plan.if_type
        );

        let flags = Arc::new(UpdateFlags::default());
        flags
            .gaps_check
            .store(options.sample_sequence_gaps_check, std::sync::atomic::Ordering::Relaxed);
        flags
            .show_gain_changes
            .store(options.show_gain_changes, std::sync::atomic::Ordering::Relaxed);
        if options.debug_mode {
            if let Err(e) = api.debug_enable(handle.id, true) {
                warn!("{}", e);
            }
        }

        let channels: Vec<Channel> = (0..config.duo_mode.channels())
            .map(|i| Channel::new(i, options.ring_capacity))
            .collect();
        Ok(Self {
            api,
            flags,
            views: RwLock::new(channels.iter().map(Channel::view).collect()),
            inner: Mutex::new(Inner {
                handle: Some(handle),
                config,
                plan,
                params,
                tuners: Default::default(),
                channels,
                sink: None,
                fault: None,
            }),
            options,
        })
    }

    fn select(
        api: &dyn Api,
        registry: &Arc<DeviceRegistry>,
        selector: &DeviceSelector,
        config: &StreamConfig,
    ) -> Result<(DeviceHandle, SampleRatePlan)> {
        let devices = registry.refresh(api)?;
        let found = match selector {
            DeviceSelector::Index(index) => devices.get(*index),
            DeviceSelector::Serial(serial) => devices.iter().find(|d| &d.serial == serial),
        };
        let mut desc = found
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(format!("{:?}", selector)))?;

        let claim = registry.claim(&desc.serial)?;
        if !desc.valid {
            return Err(Error::DeviceBusy(format!(
                "{} is in use by another application",
                desc.serial
            )));
        }
        let capabilities = Capabilities::for_model(desc.hw_ver);
        let plan = config.validate(&capabilities)?;

        prepare_selection(&mut desc, config);
        let id = api.select_device(&desc)?;
        debug!("selected {} {} as {:?}", desc.hw_ver, desc.serial, id);
        Ok((
            DeviceHandle {
                id,
                desc,
                capabilities,
                _claim: claim,
            },
            plan,
        ))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn views(&self) -> Vec<ChannelView> {
        self.views.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Start a new epoch of `count` channels. The sessions being replaced
    /// are closed so their ports finish with what they buffered.
    fn renew_channels(&self, inner: &mut Inner, count: usize) {
        for channel in &inner.channels {
            channel.session.close();
        }
        inner.channels = (0..count)
            .map(|i| Channel::new(i, self.options.ring_capacity))
            .collect();
        *self.views.write().unwrap_or_else(|e| e.into_inner()) =
            inner.channels.iter().map(Channel::view).collect();
    }

    /// The handle, if the device can take control calls.
    fn usable<'a>(&self, inner: &'a Inner) -> Result<&'a DeviceHandle> {
        let handle = inner
            .handle
            .as_ref()
            .ok_or_else(|| Error::fault("device is closed"))?;
        if self.flags.is_removed() {
            return Err(Error::fault(format!("{} was removed", handle.serial())));
        }
        if let Some(fault) = &inner.fault {
            return Err(Error::fault(fault.clone()));
        }
        Ok(handle)
    }

    /// Apply a complete configuration, live when started.
    fn apply(&self, inner: &mut Inner, config: StreamConfig) -> Result<()> {
        let caps = *self.usable(inner)?.capabilities();
        let plan = config.validate(&caps)?;
        if inner.is_started() && inner.config.requires_restart(&config) {
            return Err(Error::unsupported(
                "sample rate, decimation, tuner and RSPduo mode can only change while stopped",
            ));
        }
        if config.tuner() != inner.config.tuner() || config.duo_mode != inner.config.duo_mode {
            self.reselect(inner, &config)?;
        }

        let mut params = inner.params;
        let (reason, ext1) = write_params(&mut params, &config, &plan, caps.model, inner.tuners)?;
        let previous = std::mem::replace(&mut inner.params, params);
        let tuner = self.usable(inner)?.tuner();
        if let Err(e) = self.send_update(inner, tuner, reason, ext1) {
            inner.params = previous;
            return Err(e);
        }
        inner.config = config;
        inner.plan = plan;
        Ok(())
    }

    /// Change some fields of the current configuration.
    fn change(&self, f: impl FnOnce(&mut StreamConfig)) -> Result<()> {
        let mut inner = self.lock();
        self.change_locked(&mut inner, f)
    }

    fn change_locked(&self, inner: &mut Inner, f: impl FnOnce(&mut StreamConfig)) -> Result<()> {
        let caps = *self.usable(inner)?.capabilities();
        let mut config = inner.config.clone();
        f(&mut config);
        if config.lna_state == inner.config.lna_state {
            // A new band or input may have fewer LNA states.
            let states = caps.lna_states(config.center_freq, config.antenna, config.hdr_mode);
            if states > 0 && usize::from(config.lna_state) >= states {
                warn!(
                    "LNA state {} not available at {} Hz - using {}",
                    config.lna_state,
                    config.center_freq,
                    states - 1
                );
                config.lna_state = (states - 1) as u8;
            }
        }
        self.apply(inner, config)
    }

    /// Select the device again with another RSPduo tuner or mode.
    fn reselect(&self, inner: &mut Inner, config: &StreamConfig) -> Result<()> {
        let Some(handle) = inner.handle.as_mut() else {
            return Err(Error::fault("device is closed"));
        };
        self.api.release_device(handle.id)?;
        let mut desc = handle.desc.clone();
        prepare_selection(&mut desc, config);

        self.api.lock_device_api()?;
        let selected = self.api.select_device(&desc);
        if let Err(e) = self.api.unlock_device_api() {
            error!("{}", e);
        }
        let selected = selected.and_then(|id| Ok((id, self.api.get_device_params(id)?)));
        match selected {
            Ok((id, params)) => {
                debug!("reselected {} with {:?} {:?}", desc.serial, desc.tuner, desc.rspduo_mode);
                handle.id = id;
                handle.desc = desc;
                inner.params = params;
                inner.tuners = Default::default();
                self.renew_channels(inner, config.duo_mode.channels());
                Ok(())
            }
            Err(e) => {
                inner.fault = Some(format!("{} could not be selected again: {}", desc.serial, e));
                Err(e.into())
            }
        }
    }

    /// Send an update to the service while streaming and wait for the
    /// stream to confirm it.
    fn send_update(
        &self,
        inner: &Inner,
        tuner: TunerSelect,
        reason: UpdateReason,
        ext1: UpdateReasonExt1,
    ) -> Result<()> {
        let Some(sink) = inner.sink.as_ref() else {
            return Ok(());
        };
        sink.set_params(inner.params);
        if reason.is_empty() && ext1.is_empty() {
            return Ok(());
        }
        let id = self.usable(inner)?.id();
        self.flags.arm(reason);
        self.api.update(id, tuner, &inner.params, reason, ext1)?;
        trace!("update {:?} {:?} {:?}", tuner, reason, ext1);
        for change in self.flags.wait_confirmed(reason, self.options.update_timeout) {
            warn!("{} update timeout", change);
        }
        Ok(())
    }

    /// Apply a change to every tuner, dropping the per-tuner settings
    /// `clear` resets.
    fn change_all(
        &self,
        clear: fn(&mut TunerOverride),
        f: impl FnOnce(&mut StreamConfig),
    ) -> Result<()> {
        let mut inner = self.lock();
        let saved = inner.tuners;
        inner.tuners.iter_mut().for_each(clear);
        let changed = self.change_locked(&mut inner, f);
        if changed.is_err() {
            inner.tuners = saved;
        }
        changed
    }

    /// Tune all channels to `frequency` Hz.
    pub fn retune(&self, frequency: f64) -> Result<()> {
        self.change_all(|t| t.rf_hz = None, |config| config.center_freq = frequency)
    }

    /// Set IF gain reduction (dB) and LNA state of all channels.
    pub fn set_gain(&self, gain_reduction: u32, lna_state: u8) -> Result<()> {
        self.change_all(
            |t| t.gain = None,
            |config| {
                config.gain_reduction = gain_reduction;
                config.lna_state = lna_state;
            },
        )
    }

    /// Tuner addressed by `channel` in RSPduo independent RX mode.
    fn independent_tuner(inner: &Inner, channel: usize) -> Result<TunerSelect> {
        if inner.config.duo_mode != DuoMode::DualTuner {
            return Err(Error::unsupported(format!(
                "per-tuner settings need RSPduo independent RX mode, not {:?}",
                inner.config.duo_mode
            )));
        }
        match channel {
            0 => Ok(TunerSelect::A),
            1 => Ok(TunerSelect::B),
            _ => Err(Error::invalid(format!("no channel {}", channel))),
        }
    }

    /// Frequency, IF gain reduction and LNA state of one tuner.
    fn tuner_settings(config: &StreamConfig, o: TunerOverride) -> (f64, u32, u8) {
        let (gain_reduction, lna_state) = o.gain.unwrap_or((config.gain_reduction, config.lna_state));
        (o.rf_hz.unwrap_or(config.center_freq), gain_reduction, lna_state)
    }

    /// Input of `channel` for the RF gain tables; only tuner 1 has Hi-Z.
    fn tuner_antenna(config: &StreamConfig, channel: usize) -> Antenna {
        if channel == 1 {
            Antenna::Tuner2
        } else {
            config.antenna
        }
    }

    /// Change the settings of one tuner in RSPduo independent RX mode.
    fn change_tuner(&self, channel: usize, f: impl FnOnce(&mut TunerOverride)) -> Result<()> {
        let mut inner = self.lock();
        let caps = *self.usable(&inner)?.capabilities();
        let tuner = Self::independent_tuner(&inner, channel)?;
        let config = inner.config.clone();
        let mut tuners = inner.tuners;
        f(&mut tuners[channel]);

        let (frequency, gain_reduction, lna_state) = Self::tuner_settings(&config, tuners[channel]);
        if !caps.supports_frequency(frequency) {
            return Err(Error::invalid(format!(
                "center frequency {} Hz outside {}..={} Hz",
                frequency, caps.frequency_range.0, caps.frequency_range.1
            )));
        }
        if !caps.supports_if_gain_reduction(gain_reduction) {
            return Err(Error::invalid(format!(
                "gain reduction {} dB outside {}..={} dB",
                gain_reduction, caps.if_gain_reduction_range.0, caps.if_gain_reduction_range.1
            )));
        }
        let antenna = Self::tuner_antenna(&config, channel);
        let states = caps.lna_states(frequency, antenna, config.hdr_mode);
        if usize::from(lna_state) >= states {
            return Err(Error::invalid(format!(
                "LNA state {} not available at {} Hz",
                lna_state, frequency
            )));
        }

        let mut params = inner.params;
        let (reason, ext1) = write_params(&mut params, &config, &inner.plan, caps.model, tuners)?;
        let previous = std::mem::replace(&mut inner.params, params);
        if let Err(e) = self.send_update(&inner, tuner, reason, ext1) {
            inner.params = previous;
            return Err(e);
        }
        inner.tuners = tuners;
        Ok(())
    }

    /// Tune one channel of an RSPduo in independent RX mode.
    pub fn retune_tuner(&self, channel: usize, frequency: f64) -> Result<()> {
        self.change_tuner(channel, |t| t.rf_hz = Some(frequency))
    }

    /// Set IF gain reduction and LNA state of one channel of an RSPduo in
    /// independent RX mode.
    pub fn set_gain_tuner(&self, channel: usize, gain_reduction: u32, lna_state: u8) -> Result<()> {
        self.change_tuner(channel, |t| t.gain = Some((gain_reduction, lna_state)))
    }

    /// `set_gain_db` for one channel of an RSPduo in independent RX mode.
    pub fn set_gain_db_tuner(&self, channel: usize, name: &str, gain: f64) -> Result<()> {
        let (config, frequency, gain_reduction, lna_state) = self.tuner_state(channel)?;
        match name {
            "IF" => {
                if gain > 0.0 {
                    return Err(Error::invalid(format!("IF gain {} dB must be negative", gain)));
                }
                self.set_gain_tuner(channel, (-gain).round() as u32, lna_state)
            }
            "RF" => {
                let table = self.capabilities()?.rf_gain_reductions(
                    frequency,
                    Self::tuner_antenna(&config, channel),
                    config.hdr_mode,
                );
                self.set_gain_tuner(channel, gain_reduction, closest_lna_state(-gain, table))
            }
            _ => Err(Error::invalid(format!("invalid gain name: {}", name))),
        }
    }

    /// `gain_db` for one channel of an RSPduo in independent RX mode.
    pub fn gain_db_tuner(&self, channel: usize, name: &str) -> Result<f64> {
        let (config, frequency, gain_reduction, lna_state) = self.tuner_state(channel)?;
        match name {
            "IF" => Ok(-f64::from(gain_reduction)),
            "RF" => {
                let table = self.capabilities()?.rf_gain_reductions(
                    frequency,
                    Self::tuner_antenna(&config, channel),
                    config.hdr_mode,
                );
                Ok(table
                    .get(usize::from(lna_state))
                    .map(|gr| -f64::from(*gr))
                    .unwrap_or(0.0))
            }
            _ => Err(Error::invalid(format!("invalid gain name: {}", name))),
        }
    }

    /// Center frequency of one channel of an RSPduo in independent RX mode.
    pub fn center_freq_tuner(&self, channel: usize) -> Result<f64> {
        Ok(self.tuner_state(channel)?.1)
    }

    fn tuner_state(&self, channel: usize) -> Result<(StreamConfig, f64, u32, u8)> {
        let inner = self.lock();
        self.usable(&inner)?;
        Self::independent_tuner(&inner, channel)?;
        let (frequency, gain_reduction, lna_state) =
            Self::tuner_settings(&inner.config, inner.tuners[channel]);
        Ok((inner.config.clone(), frequency, gain_reduction, lna_state))
    }

    /// Set a gain by name: "IF" is minus the IF gain reduction, "RF" picks
    /// the LNA state whose RF gain is closest to `gain` dB.
    pub fn set_gain_db(&self, name: &str, gain: f64) -> Result<()> {
        match name {
            "IF" => {
                if gain > 0.0 {
                    return Err(Error::invalid(format!("IF gain {} dB must be negative", gain)));
                }
                let lna_state = self.config()?.lna_state;
                self.set_gain((-gain).round() as u32, lna_state)
            }
            "RF" => {
                let config = self.config()?;
                let table = self.capabilities()?.rf_gain_reductions(
                    config.center_freq,
                    config.antenna,
                    config.hdr_mode,
                );
                self.set_gain(config.gain_reduction, closest_lna_state(-gain, table))
            }
            _ => Err(Error::invalid(format!("invalid gain name: {}", name))),
        }
    }

    /// Current gain by name, in dB.
    pub fn gain_db(&self, name: &str) -> Result<f64> {
        let config = self.config()?;
        match name {
            "IF" => Ok(-f64::from(config.gain_reduction)),
            "RF" => {
                let table = self.capabilities()?.rf_gain_reductions(
                    config.center_freq,
                    config.antenna,
                    config.hdr_mode,
                );
                Ok(table
                    .get(usize::from(config.lna_state))
                    .map(|gr| -f64::from(*gr))
                    .unwrap_or(0.0))
            }
            _ => Err(Error::invalid(format!("invalid gain name: {}", name))),
        }
    }

    /// Range of a gain by name, in dB, at the current frequency.
    pub fn gain_range(&self, name: &str) -> Result<(f64, f64)> {
        let config = self.config()?;
        let caps = self.capabilities()?;
        match name {
            "IF" => {
                let (min, max) = caps.if_gain_reduction_range;
                Ok((-f64::from(max), -f64::from(min)))
            }
            "RF" => Ok(rf_gain_range(caps.rf_gain_reductions(
                config.center_freq,
                config.antenna,
                config.hdr_mode,
            ))),
            _ => Err(Error::invalid(format!("invalid gain name: {}", name))),
        }
    }

    /// Change the output sample rate. Only allowed while stopped.
    pub fn set_sample_rate(&self, sample_rate: f64) -> Result<()> {
        self.change(|config| config.sample_rate = sample_rate)
    }

    /// Set the IF bandwidth in Hz, or `None` for automatic.
    pub fn set_bandwidth(&self, bandwidth: Option<f64>) -> Result<()> {
        self.change(|config| config.bandwidth = bandwidth)
    }

    /// Select the antenna input. Switching RSPduo tuners needs a restart.
    pub fn set_antenna(&self, antenna: Antenna) -> Result<()> {
        self.change(|config| config.antenna = antenna)
    }

    pub fn set_agc(&self, enable: bool) -> Result<()> {
        self.change(|config| config.agc = enable)
    }

    pub fn set_agc_set_point(&self, set_point_dbfs: i32) -> Result<()> {
        self.change(|config| config.agc_set_point = set_point_dbfs)
    }

    /// Frequency correction in ppm.
    pub fn set_ppm(&self, ppm: f64) -> Result<()> {
        self.change(|config| config.ppm = ppm)
    }

    pub fn set_dc_offset_mode(&self, enable: bool) -> Result<()> {
        self.change(|config| config.dc_offset_mode = enable)
    }

    pub fn set_iq_balance_mode(&self, enable: bool) -> Result<()> {
        self.change(|config| config.iq_balance_mode = enable)
    }

    pub fn set_bias_tee(&self, enable: bool) -> Result<()> {
        self.change(|config| config.bias_tee = enable)
    }

    pub fn set_rf_notch(&self, enable: bool) -> Result<()> {
        self.change(|config| config.rf_notch = enable)
    }

    pub fn set_dab_notch(&self, enable: bool) -> Result<()> {
        self.change(|config| config.dab_notch = enable)
    }

    pub fn set_hdr_mode(&self, enable: bool) -> Result<()> {
        self.change(|config| config.hdr_mode = enable)
    }

    /// Replace the whole configuration.
    ///
    /// Hot fields are applied live. If a restart-only field changed while
    /// streaming, the stream is stopped, the new configuration applied and a
    /// new session started; ports taken before are then finished.
    pub fn reconfigure(&self, config: StreamConfig) -> Result<()> {
        let mut inner = self.lock();
        let caps = *self.usable(&inner)?.capabilities();
        if !(inner.is_started() && inner.config.requires_restart(&config)) {
            return self.apply(&mut inner, config);
        }
        config.validate(&caps)?;
        info!("restarting stream for the new configuration");
        self.stop_locked(&mut inner)?;
        self.apply(&mut inner, config)?;
        self.start_locked(&mut inner)
    }

    /// Register the stream callbacks: Configuring -> Streaming.
    ///
    /// If the service fails to start, the sessions return to Configuring.
    /// Starting after a stop begins a new session with fresh ring buffers.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        self.start_locked(&mut inner)
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        let handle = self.usable(inner)?;
        if inner.is_started() {
            return Ok(());
        }
        let (id, tuner, model) = (handle.id(), handle.tuner(), handle.model());
        if inner
            .channels
            .iter()
            .any(|c| c.session.state() != SessionState::Configuring)
        {
            let count = inner.config.duo_mode.channels();
            self.renew_channels(inner, count);
        }

        let sink = Arc::new(CallbackSink::new(
            inner.channels.iter().map(|c| c.adapter.clone()).collect(),
            self.flags.clone(),
            self.api.clone(),
            id,
            tuner,
            inner.params,
        ));
        debug!("{} device parameters: {:?}", model, inner.params);
        for channel in &inner.channels {
            channel.session.begin_streaming();
        }
        if let Err(e) = self.api.init(id, &inner.params, sink.clone()) {
            for channel in &inner.channels {
                channel.session.abort_start();
            }
            error!("{}", e);
            return Err(e.into());
        }
        inner.sink = Some(sink);
        info!("streaming started");
        Ok(())
    }

    /// Unregister the stream callbacks: Streaming -> Draining.
    ///
    /// On return no callback can write to the ring buffers any more; the
    /// ports deliver what is left and then report `Done`. Fails with
    /// `ShutdownTimeout` if the service does not confirm in time, after
    /// which the device must be closed. A no-op when not streaming.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        self.stop_locked(&mut inner)
    }

    fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        let Some(sink) = inner.sink.take() else {
            return Ok(());
        };
        let Some(id) = inner.handle.as_ref().map(|h| h.id()) else {
            return Ok(());
        };
        for channel in &inner.channels {
            channel.session.drain();
        }

        let timeout = self.options.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        let (tx, rx) = crossbeam::channel::bounded(1);
        let api = self.api.clone();
        thread::Builder::new()
            .name("sdrplay-uninit".to_string())
            .spawn(move || {
                let _ = tx.send(api.uninit(id));
            })?;

        let result = match rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if self.flags.is_removed() => {
                debug!("uninit after removal: {}", e);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("{}", e);
                Err(Error::from(e))
            }
            Err(_) => {
                error!("stream did not stop within {:?}", timeout);
                inner.fault = Some("stream did not stop, close and reopen the device".into());
                for channel in &inner.channels {
                    channel.session.fail();
                }
                Err(Error::ShutdownTimeout(timeout))
            }
        };

        // Blocks are discarded from now on; wait for the ones in flight.
        let idle = inner
            .channels
            .iter()
            .all(|c| c.session.wait_idle(deadline));
        drop(sink);
        if !idle && result.is_ok() {
            error!("stream callback did not return within {:?}", timeout);
            inner.fault = Some("stream callback did not return".into());
            return Err(Error::ShutdownTimeout(timeout));
        }
        info!("streaming stopped");
        result
    }

    /// Release the device. Stops the stream first; idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.handle.is_none() {
            return Ok(());
        }
        let stopped = self.stop_locked(&mut inner);
        for channel in &inner.channels {
            channel.session.close();
        }
        if let Some(handle) = inner.handle.take() {
            if let Err(e) = self.api.release_device(handle.id()) {
                error!("{}", e);
            }
            info!("closed {} {}", handle.model(), handle.serial());
        }
        stopped
    }

    /// Take the output port of `channel` for the current session.
    pub fn output_port(&self, channel: usize) -> Result<OutputPort> {
        let mut inner = self.lock();
        inner
            .channels
            .get_mut(channel)
            .ok_or_else(|| Error::invalid(format!("no channel {}", channel)))?
            .port
            .take()
            .ok_or(Error::PortTaken(channel))
    }

    /// Health snapshot of `channel`.
    pub fn health(&self, channel: usize) -> Result<Health> {
        let views = self.views();
        let c = views
            .get(channel)
            .ok_or_else(|| Error::invalid(format!("no channel {}", channel)))?;
        Ok(Health::snapshot(&c.session, c.monitor.state()))
    }

    /// Number of output channels (2 for RSPduo dual tuner modes).
    pub fn channels(&self) -> usize {
        self.views().len()
    }

    /// Session state of `channel`.
    pub fn state(&self, channel: usize) -> Option<SessionState> {
        self.views().get(channel).map(|c| c.session.state())
    }

    pub fn is_streaming(&self) -> bool {
        self.views().iter().any(|c| c.session.is_streaming())
    }

    pub fn config(&self) -> Result<StreamConfig> {
        let inner = self.lock();
        self.usable(&inner)?;
        Ok(inner.config.clone())
    }

    pub fn sample_rate_plan(&self) -> Result<SampleRatePlan> {
        let inner = self.lock();
        self.usable(&inner)?;
        Ok(inner.plan)
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        let inner = self.lock();
        Ok(*self.usable(&inner)?.capabilities())
    }

    pub fn serial(&self) -> Option<String> {
        self.lock().handle.as_ref().map(|h| h.serial().to_string())
    }

    /// Turn the service's verbose debug output on or off.
    pub fn set_debug_mode(&self, enable: bool) -> Result<()> {
        let inner = self.lock();
        let id = self.usable(&inner)?.id();
        Ok(self.api.debug_enable(id, enable)?)
    }

    /// Log every gap in the service's sample numbering.
    pub fn set_sample_sequence_gaps_check(&self, enable: bool) {
        self.flags
            .gaps_check
            .store(enable, std::sync::atomic::Ordering::Relaxed);
    }

    /// Log gain change events.
    pub fn set_show_gain_changes(&self, enable: bool) {
        self.flags
            .show_gain_changes
            .store(enable, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(config: &StreamConfig) -> SampleRatePlan {
        SampleRatePlan::new(config.sample_rate, config.decimation, config.duo_mode).unwrap()
    }

    #[test]
    fn test_write_params_full() {
        let config = StreamConfig::new(433.92e6, 250e3, 35, 4);
        let mut params = DeviceParams {
            dev: Some(Default::default()),
            ..Default::default()
        };
        write_params(&mut params, &config, &plan(&config), HwVersion::Rsp1a, Default::default()).unwrap();
        let dev = params.dev.unwrap();
        assert_eq!(dev.fs_hz, 6e6);
        let rx = params.rx_a;
        assert_eq!(rx.tuner.rf_hz, 433.92e6);
        assert_eq!(rx.tuner.gain.gr_db, 35);
        assert_eq!(rx.tuner.gain.lna_state, 4);
        assert_eq!(rx.tuner.if_type, sdrplay_api::IfType::If1_620);
        assert_eq!(rx.tuner.bandwidth, sdrplay_api::Bandwidth::Bw0_200);
        assert!(rx.ctrl.decimation.enable);
        assert_eq!(rx.ctrl.decimation.factor, 8);
        assert_eq!(rx.ctrl.agc.enable, AgcControl::Disable);
    }

    #[test]
    fn test_write_params_reasons() {
        let config = StreamConfig::default();
        let mut params = DeviceParams {
            dev: Some(Default::default()),
            ..Default::default()
        };
        write_params(&mut params, &config, &plan(&config), HwVersion::Rsp2, Default::default()).unwrap();

        let retuned = StreamConfig {
            center_freq: 144.8e6,
            ..config.clone()
        };
        let (reason, ext1) =
            write_params(&mut params, &retuned, &plan(&retuned), HwVersion::Rsp2, Default::default()).unwrap();
        assert_eq!(reason, UpdateReason::TUNER_FRF);
        assert!(ext1.is_empty());

        let hiz = StreamConfig {
            antenna: Antenna::HiZ,
            ..retuned.clone()
        };
        let (reason, _) =
            write_params(&mut params, &hiz, &plan(&hiz), HwVersion::Rsp2, Default::default()).unwrap();
        assert_eq!(reason, UpdateReason::RSP2_AM_PORT_SELECT);
        assert_eq!(params.rx_a.rsp2.am_port, AmPort::Port1);

        let (reason, _) =
            write_params(&mut params, &hiz, &plan(&hiz), HwVersion::Rsp2, Default::default()).unwrap();
        assert!(reason.is_empty());
    }

    #[test]
    fn test_write_params_rspdx_extension() {
        let config = StreamConfig {
            antenna: Antenna::C,
            hdr_mode: true,
            ..StreamConfig::new(1e6, 2e6, 40, 0)
        };
        let mut params = DeviceParams {
            dev: Some(Default::default()),
            ..Default::default()
        };
        let (_, ext1) =
            write_params(&mut params, &config, &plan(&config), HwVersion::RspDx, Default::default()).unwrap();
        assert!(ext1.contains(UpdateReasonExt1::RSPDX_HDR_ENABLE));
        assert!(ext1.contains(UpdateReasonExt1::RSPDX_ANTENNA_CONTROL));
        assert_eq!(params.dev.unwrap().rspdx.antenna, RspDxAntenna::C);
    }

    #[test]
    fn test_write_params_dual_tuner() {
        let config = StreamConfig {
            duo_mode: DuoMode::DualTuner,
            ..StreamConfig::new(100e6, 500e3, 40, 0)
        };
        let mut params = DeviceParams {
            dev: Some(Default::default()),
            rx_b: Some(Default::default()),
            ..Default::default()
        };
        write_params(
            &mut params,
            &config,
            &plan(&config),
            HwVersion::RspDuo,
            [
                TunerOverride::default(),
                TunerOverride {
                    rf_hz: Some(145e6),
                    gain: Some((30, 2)),
                },
            ],
        )
        .unwrap();
        assert_eq!(params.rx_a.tuner.rf_hz, 100e6);
        assert_eq!(params.rx_a.tuner.gain.gr_db, 40);
        let rx_b = params.rx_b.unwrap();
        assert_eq!(rx_b.tuner.rf_hz, 145e6);
        assert_eq!(rx_b.tuner.gain.gr_db, 30);
        assert_eq!(rx_b.tuner.gain.lna_state, 2);
        assert_eq!(params.dev.unwrap().fs_hz, 6e6);
    }
}
