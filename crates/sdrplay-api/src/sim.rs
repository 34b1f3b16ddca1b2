//! Simulated SDRplay API service.
//!
//! [`SimulatedApi`] keeps a list of virtual RSP devices and behaves like the
//! service does from a client's point of view: `init()` starts a thread that
//! pushes blocks of a complex tone through [`StreamCallbacks::stream_a`] (and
//! `stream_b` in RSPduo dual tuner mode), `update()` raises the
//! `fs/rf/grChanged` flags on the next block, and `uninit()` blocks until the
//! streaming thread has exited.
//!
//! Streaming can be disabled with [`SimOptions::generate`], in which case the
//! callbacks registered by `init()` are available through
//! [`SimulatedApi::callbacks`] and blocks can be injected by hand.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{
    API_VERSION, Api, DevParams, DeviceDesc, DeviceId, DeviceParams, ErrorCode, Event, HwVersion,
    PowerOverload, Result, RspDuoMode, RxChannelParams, StreamCallbacks, StreamCbParams,
    TunerSelect, UpdateReason, UpdateReasonExt1, error::Error,
};

/// Number of samples per callback, as delivered by the service at low rates.
pub const DEFAULT_BLOCK_SIZE: usize = 1008;

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Run a streaming thread between `init()` and `uninit()`.
    pub generate: bool,
    /// Samples per callback block.
    pub block_size: usize,
    /// Pace blocks at the output sample rate instead of as fast as possible.
    pub realtime: bool,
    /// Offset of the generated tone from the centre frequency, in Hz.
    pub tone_offset_hz: f64,
    /// Skip one block worth of sample numbers every N blocks.
    pub gap_every: Option<u64>,
    /// Raise a power overload event every N blocks.
    pub overload_every: Option<u64>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            generate: true,
            block_size: DEFAULT_BLOCK_SIZE,
            realtime: true,
            tone_offset_hz: 10_000.0,
            gap_every: None,
            overload_every: None,
        }
    }
}

impl SimOptions {
    /// Options for tests which drive the callbacks themselves.
    pub fn manual() -> Self {
        Self {
            generate: false,
            ..Self::default()
        }
    }
}

/// One `update()` call as seen by the service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateRecord {
    pub tuner: TunerSelect,
    pub reason: UpdateReason,
    pub reason_ext1: UpdateReasonExt1,
}

struct SimDevice {
    desc: DeviceDesc,
    external_in_use: bool,
}

#[derive(Default)]
struct Changed {
    fs: AtomicBool,
    rf: AtomicBool,
    gr: AtomicBool,
    output_rate: AtomicU64,
}

impl Changed {
    fn set_rate(&self, rate: f64) {
        self.output_rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    fn rate(&self) -> f64 {
        f64::from_bits(self.output_rate.load(Ordering::Relaxed))
    }
}

struct Streamer {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Selected {
    desc: DeviceDesc,
    params: DeviceParams,
    callbacks: Option<Arc<dyn StreamCallbacks>>,
    streaming: bool,
    streamer: Option<Streamer>,
    changed: Arc<Changed>,
    updates: Vec<UpdateRecord>,
    debug: bool,
}

#[derive(Default)]
struct SimState {
    devices: Vec<SimDevice>,
    selected: HashMap<DeviceId, Selected>,
    next_handle: u64,
    fail_init: Option<ErrorCode>,
    uninit_delay: Duration,
    init_count: usize,
}

/// A software SDRplay API service with virtual devices.
pub struct SimulatedApi {
    options: SimOptions,
    state: Mutex<SimState>,
    api_locked: Mutex<bool>,
    api_unlocked: Condvar,
}

impl SimulatedApi {
    pub fn new(options: SimOptions) -> Self {
        Self {
            options,
            state: Mutex::new(SimState {
                next_handle: 1,
                ..SimState::default()
            }),
            api_locked: Mutex::new(false),
            api_unlocked: Condvar::new(),
        }
    }

    /// A service with a single streaming device.
    pub fn with_device(serial: &str, hw_ver: HwVersion) -> Self {
        let api = Self::new(SimOptions::default());
        api.add_device(serial, hw_ver);
        api
    }

    pub fn options(&self) -> &SimOptions {
        &self.options
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_device(&self, serial: &str, hw_ver: HwVersion) {
        let mut desc = DeviceDesc::new(serial, hw_ver);
        if hw_ver == HwVersion::RspDuo {
            desc.rspduo_sample_freq = 6_000_000.0;
        }
        self.state().devices.push(SimDevice {
            desc,
            external_in_use: false,
        });
    }

    /// Mark a device as claimed by another application.
    pub fn set_in_use_elsewhere(&self, serial: &str, in_use: bool) {
        let mut state = self.state();
        if let Some(device) = state.devices.iter_mut().find(|d| d.desc.serial == serial) {
            device.external_in_use = in_use;
        }
    }

    /// Make the next `init()` calls fail with `code`.
    pub fn set_fail_init(&self, code: Option<ErrorCode>) {
        self.state().fail_init = code;
    }

    /// Delay `uninit()` by `delay`, as a stalled service would.
    pub fn set_uninit_delay(&self, delay: Duration) {
        self.state().uninit_delay = delay;
    }

    /// Unplug a device. A streaming client receives `DeviceRemoved`.
    pub fn remove_device(&self, serial: &str) {
        let (callbacks, streamer) = {
            let mut state = self.state();
            state.devices.retain(|d| d.desc.serial != serial);
            match state
                .selected
                .values_mut()
                .find(|s| s.desc.serial == serial)
            {
                Some(selected) => {
                    selected.streaming = false;
                    (selected.callbacks.take(), selected.streamer.take())
                }
                None => (None, None),
            }
        };
        if let Some(streamer) = streamer {
            streamer.stop.store(true, Ordering::Release);
            let _ = streamer.thread.join();
        }
        if let Some(callbacks) = callbacks {
            callbacks.event(&Event::DeviceRemoved, TunerSelect::A);
        }
    }

    fn selected_by_serial<T>(&self, serial: &str, f: impl FnOnce(&Selected) -> T) -> Option<T> {
        let state = self.state();
        state
            .selected
            .values()
            .find(|s| s.desc.serial == serial)
            .map(f)
    }

    /// Callbacks registered by the last `init()` on the device.
    pub fn callbacks(&self, serial: &str) -> Option<Arc<dyn StreamCallbacks>> {
        self.selected_by_serial(serial, |s| s.callbacks.clone())
            .flatten()
    }

    pub fn updates(&self, serial: &str) -> Vec<UpdateRecord> {
        self.selected_by_serial(serial, |s| s.updates.clone())
            .unwrap_or_default()
    }

    /// Parameters last passed to `init()` or `update()`.
    pub fn params(&self, serial: &str) -> Option<DeviceParams> {
        self.selected_by_serial(serial, |s| s.params)
    }

    pub fn is_streaming(&self, serial: &str) -> bool {
        self.selected_by_serial(serial, |s| s.streaming)
            .unwrap_or(false)
    }

    pub fn is_selected(&self, serial: &str) -> bool {
        self.selected_by_serial(serial, |_| ()).is_some()
    }

    pub fn debug_enabled(&self, serial: &str) -> bool {
        self.selected_by_serial(serial, |s| s.debug)
            .unwrap_or(false)
    }

    pub fn init_count(&self) -> usize {
        self.state().init_count
    }
}

fn output_rate(params: &DeviceParams, desc: &DeviceDesc) -> f64 {
    let fs = params
        .dev
        .map(|d| d.fs_hz)
        .unwrap_or(desc.rspduo_sample_freq);
    let channel = params.channel(desc.tuner).unwrap_or(&params.rx_a);
    let decimation = &channel.ctrl.decimation;
    let fs = if channel.tuner.if_type != crate::IfType::Zero {
        // Low IF mode: the service down-converts to 2 MHz before decimating.
        2_000_000.0
    } else {
        fs
    };
    if decimation.enable && decimation.factor > 1 {
        fs / f64::from(decimation.factor)
    } else {
        fs
    }
}

fn validate_channel(channel: &RxChannelParams, call: &'static str) -> Result<()> {
    let rf_ok = (1e3..=2e9).contains(&channel.tuner.rf_hz);
    let gr_ok = (20..=59).contains(&channel.tuner.gain.gr_db);
    if rf_ok && gr_ok {
        Ok(())
    } else {
        ErrorCode::OutOfRange.check(call)
    }
}

impl Api for SimulatedApi {
    fn api_version(&self) -> Result<f32> {
        Ok(API_VERSION)
    }

    fn lock_device_api(&self) -> Result<()> {
        let mut locked = self.api_locked.lock().unwrap_or_else(|e| e.into_inner());
        while *locked {
            locked = self
                .api_unlocked
                .wait(locked)
                .unwrap_or_else(|e| e.into_inner());
        }
        *locked = true;
        Ok(())
    }

    fn unlock_device_api(&self) -> Result<()> {
        let mut locked = self.api_locked.lock().unwrap_or_else(|e| e.into_inner());
        *locked = false;
        self.api_unlocked.notify_one();
        Ok(())
    }

    fn get_devices(&self) -> Result<Vec<DeviceDesc>> {
        let state = self.state();
        Ok(state
            .devices
            .iter()
            .take(crate::MAX_DEVICES)
            .map(|d| {
                let claimed = state
                    .selected
                    .values()
                    .any(|s| s.desc.serial == d.desc.serial);
                DeviceDesc {
                    valid: !d.external_in_use && !claimed,
                    ..d.desc.clone()
                }
            })
            .collect())
    }

    fn select_device(&self, device: &DeviceDesc) -> Result<DeviceId> {
        let mut state = self.state();
        let Some(present) = state
            .devices
            .iter()
            .find(|d| d.desc.serial == device.serial)
        else {
            return Err(Error::Call {
                call: "SelectDevice",
                code: ErrorCode::Fail,
            });
        };
        let claimed = state
            .selected
            .values()
            .any(|s| s.desc.serial == device.serial);
        if present.external_in_use || claimed {
            return Err(Error::Call {
                call: "SelectDevice",
                code: ErrorCode::Fail,
            });
        }
        let mut desc = present.desc.clone();
        if desc.hw_ver == HwVersion::RspDuo {
            desc.tuner = device.tuner;
            desc.rspduo_mode = device.rspduo_mode;
            if device.rspduo_sample_freq > 0.0 {
                desc.rspduo_sample_freq = device.rspduo_sample_freq;
            }
        }

        let mut params = DeviceParams::default();
        let dual = desc.rspduo_mode == RspDuoMode::DualTuner;
        if desc.rspduo_mode == RspDuoMode::Slave {
            params.dev = None;
        } else {
            let mut dev = DevParams::default();
            if matches!(desc.rspduo_mode, RspDuoMode::DualTuner | RspDuoMode::Master) {
                dev.fs_hz = desc.rspduo_sample_freq;
            }
            params.dev = Some(dev);
        }
        // Tuner B has its own channel record, also when it streams alone.
        if dual || (desc.hw_ver == HwVersion::RspDuo && desc.tuner == TunerSelect::B) {
            params.rx_b = Some(RxChannelParams::default());
        }

        let id = DeviceId(state.next_handle);
        state.next_handle += 1;
        debug!("sim: selected {} {} as {:?}", desc.hw_ver, desc.serial, id);
        state.selected.insert(
            id,
            Selected {
                desc,
                params,
                callbacks: None,
                streaming: false,
                streamer: None,
                changed: Arc::new(Changed::default()),
                updates: Vec::new(),
                debug: false,
            },
        );
        Ok(id)
    }

    fn release_device(&self, dev: DeviceId) -> Result<()> {
        let selected = self.state().selected.remove(&dev);
        match selected {
            Some(mut selected) => {
                if let Some(streamer) = selected.streamer.take() {
                    streamer.stop.store(true, Ordering::Release);
                    let _ = streamer.thread.join();
                }
                Ok(())
            }
            None => Err(Error::UnknownHandle(dev.0)),
        }
    }

    fn get_device_params(&self, dev: DeviceId) -> Result<DeviceParams> {
        let state = self.state();
        state
            .selected
            .get(&dev)
            .map(|s| s.params)
            .ok_or(Error::UnknownHandle(dev.0))
    }

    fn init(
        &self,
        dev: DeviceId,
        params: &DeviceParams,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<()> {
        let mut state = self.state();
        let fail_init = state.fail_init;
        state.init_count += 1;
        let options = self.options.clone();
        let selected = state
            .selected
            .get_mut(&dev)
            .ok_or(Error::UnknownHandle(dev.0))?;
        if selected.streaming {
            return ErrorCode::AlreadyInitialised.check("Init");
        }
        if let Some(code) = fail_init {
            return code.check("Init");
        }
        validate_channel(&params.rx_a, "Init")?;
        if let Some(rx_b) = &params.rx_b {
            validate_channel(rx_b, "Init")?;
        }

        selected.params = *params;
        selected.callbacks = Some(callbacks.clone());
        selected.streaming = true;
        selected
            .changed
            .set_rate(output_rate(params, &selected.desc));

        if options.generate {
            let stop = Arc::new(AtomicBool::new(false));
            let generator = Generator {
                callbacks,
                stop: stop.clone(),
                changed: selected.changed.clone(),
                dual: selected.desc.rspduo_mode == RspDuoMode::DualTuner,
                options,
            };
            let thread = thread::Builder::new()
                .name(format!("sdrplay-sim-{}", selected.desc.serial))
                .spawn(move || generator.run())
                .map_err(|_| Error::Call {
                    call: "Init",
                    code: ErrorCode::OutOfMemError,
                })?;
            selected.streamer = Some(Streamer { stop, thread });
        }
        debug!("sim: init {:?}", dev);
        Ok(())
    }

    fn uninit(&self, dev: DeviceId) -> Result<()> {
        let (streamer, delay) = {
            let mut state = self.state();
            let delay = state.uninit_delay;
            let selected = state
                .selected
                .get_mut(&dev)
                .ok_or(Error::UnknownHandle(dev.0))?;
            if !selected.streaming {
                return ErrorCode::NotInitialised.check("Uninit");
            }
            selected.streaming = false;
            selected.callbacks = None;
            (selected.streamer.take(), delay)
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(streamer) = streamer {
            streamer.stop.store(true, Ordering::Release);
            let _ = streamer.thread.join();
        }
        debug!("sim: uninit {:?}", dev);
        Ok(())
    }

    fn update(
        &self,
        dev: DeviceId,
        tuner: TunerSelect,
        params: &DeviceParams,
        reason: UpdateReason,
        reason_ext1: UpdateReasonExt1,
    ) -> Result<()> {
        let mut state = self.state();
        let selected = state
            .selected
            .get_mut(&dev)
            .ok_or(Error::UnknownHandle(dev.0))?;
        if !selected.streaming {
            return ErrorCode::NotInitialised.check("Update");
        }
        let channel = params
            .channel(tuner)
            .ok_or(Error::Call {
                call: "Update",
                code: ErrorCode::InvalidParam,
            })?;
        validate_channel(channel, "Update")?;

        selected.params = *params;
        selected.updates.push(UpdateRecord {
            tuner,
            reason,
            reason_ext1,
        });
        trace!("sim: update {:?} {:?} {:?}", dev, reason, reason_ext1);

        let changed = &selected.changed;
        if reason.intersects(UpdateReason::DEV_FS | UpdateReason::CTRL_DECIMATION) {
            changed.set_rate(output_rate(params, &selected.desc));
            changed.fs.store(true, Ordering::Release);
        }
        if reason.contains(UpdateReason::TUNER_FRF) {
            changed.rf.store(true, Ordering::Release);
        }
        if reason.contains(UpdateReason::TUNER_GR) {
            changed.gr.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn debug_enable(&self, dev: DeviceId, enable: bool) -> Result<()> {
        let mut state = self.state();
        let selected = state
            .selected
            .get_mut(&dev)
            .ok_or(Error::UnknownHandle(dev.0))?;
        selected.debug = enable;
        Ok(())
    }
}

fn every(period: Option<u64>, blocks: u64) -> bool {
    period.is_some_and(|p| p > 0 && blocks % p == 0)
}

struct Generator {
    callbacks: Arc<dyn StreamCallbacks>,
    stop: Arc<AtomicBool>,
    changed: Arc<Changed>,
    dual: bool,
    options: SimOptions,
}

impl Generator {
    fn run(self) {
        let n = self.options.block_size.max(1);
        let mut xi = vec![0i16; n];
        let mut xq = vec![0i16; n];
        let mut sample_num: u32 = 0;
        let mut phase = 0.0f64;
        let mut blocks: u64 = 0;
        let mut emitted: u64 = 0;
        let mut rate = self.changed.rate();
        let mut epoch = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            let step = 2.0 * PI * self.options.tone_offset_hz / rate.max(1.0);
            for (i, q) in xi.iter_mut().zip(xq.iter_mut()) {
                *i = (phase.cos() * 8192.0) as i16;
                *q = (phase.sin() * 8192.0) as i16;
                phase = (phase + step) % (2.0 * PI);
            }

            let params = StreamCbParams {
                first_sample_num: sample_num,
                gr_changed: self.changed.gr.swap(false, Ordering::AcqRel),
                rf_changed: self.changed.rf.swap(false, Ordering::AcqRel),
                fs_changed: self.changed.fs.swap(false, Ordering::AcqRel),
                num_samples: n as u32,
            };
            let reset = blocks == 0;
            self.callbacks.stream_a(&xi, &xq, &params, reset);
            if self.dual {
                self.callbacks.stream_b(&xi, &xq, &params, reset);
            }

            blocks += 1;
            sample_num = sample_num.wrapping_add(n as u32);
            if every(self.options.gap_every, blocks) {
                sample_num = sample_num.wrapping_add(n as u32);
            }
            if every(self.options.overload_every, blocks) {
                self.callbacks.event(
                    &Event::PowerOverloadChange(PowerOverload::Detected),
                    TunerSelect::A,
                );
            }

            if params.fs_changed {
                rate = self.changed.rate();
                epoch = Instant::now();
                emitted = 0;
            }
            emitted += n as u64;
            if self.options.realtime {
                let due = epoch + Duration::from_secs_f64(emitted as f64 / rate.max(1.0));
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
            } else {
                thread::yield_now();
            }
        }
    }
}
