//! Test helper utilities: simulated devices and hand-made sample blocks
#![allow(dead_code)]

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use sdrplay3::api::sim::{SimOptions, SimulatedApi};
use sdrplay3::api::{HwVersion, StreamCallbacks, StreamCbParams};
use sdrplay3::{ControllerOptions, DeviceController, DeviceRegistry, DeviceSelector, StreamConfig};

pub const SERIAL: &str = "2305001234";

/// A service with one device whose callbacks are driven by the test
pub fn manual_api(model: HwVersion) -> Arc<SimulatedApi> {
    let api = Arc::new(SimulatedApi::new(SimOptions::manual()));
    api.add_device(SERIAL, model);
    api
}

/// A service with one device streaming a tone as fast as possible
pub fn streaming_api(model: HwVersion) -> Arc<SimulatedApi> {
    let api = Arc::new(SimulatedApi::new(SimOptions {
        realtime: false,
        ..SimOptions::default()
    }));
    api.add_device(SERIAL, model);
    api
}

/// Options with no wait for update acknowledgements
pub fn test_options() -> ControllerOptions {
    ControllerOptions {
        ring_capacity: 4096,
        update_timeout: Duration::ZERO,
        shutdown_timeout: Duration::from_millis(500),
        ..ControllerOptions::default()
    }
}

pub fn open(api: &Arc<SimulatedApi>, config: StreamConfig) -> sdrplay3::Result<DeviceController> {
    open_with(api, config, test_options())
}

pub fn open_with(
    api: &Arc<SimulatedApi>,
    config: StreamConfig,
    options: ControllerOptions,
) -> sdrplay3::Result<DeviceController> {
    DeviceController::open(
        api.clone(),
        DeviceRegistry::new(),
        &DeviceSelector::default(),
        config,
        options,
    )
}

pub fn callbacks(api: &SimulatedApi) -> Arc<dyn StreamCallbacks> {
    api.callbacks(SERIAL)
        .expect("no callbacks registered, device not started")
}

/// A block of `n` samples numbered from `first`, I = Q = `value`
pub fn block(first: u32, n: usize, value: i16) -> (Vec<i16>, Vec<i16>, StreamCbParams) {
    let params = StreamCbParams {
        first_sample_num: first,
        gr_changed: false,
        rf_changed: false,
        fs_changed: false,
        num_samples: n as u32,
    };
    (vec![value; n], vec![value; n], params)
}

/// Deliver a block on tuner A
pub fn push_a(callbacks: &dyn StreamCallbacks, first: u32, n: usize, value: i16) {
    let (xi, xq, params) = block(first, n, value);
    callbacks.stream_a(&xi, &xq, &params, first == 0);
}

/// Deliver a block on tuner B
pub fn push_b(callbacks: &dyn StreamCallbacks, first: u32, n: usize, value: i16) {
    let (xi, xq, params) = block(first, n, value);
    callbacks.stream_b(&xi, &xq, &params, first == 0);
}

/// A complex tone as separate I and Q 16-bit buffers
pub fn tone(frequency: f32, sample_rate: f32, num_samples: usize) -> (Vec<i16>, Vec<i16>) {
    let step = 2.0 * PI * frequency / sample_rate;
    (0..num_samples)
        .map(|n| {
            let phase = step * n as f32;
            ((phase.cos() * 16384.0) as i16, (phase.sin() * 16384.0) as i16)
        })
        .unzip()
}
