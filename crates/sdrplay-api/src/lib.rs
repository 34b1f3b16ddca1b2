//! Typed interface to the SDRplay API v3 service.
//!
//! # Overview
//!
//! `sdrplay-api` describes the contract of the SDRplay API as Rust traits:
//! [`Api`] for the synchronous calls (enumeration, selection, init/uninit,
//! parameter updates) and [`StreamCallbacks`] for the asynchronous stream and
//! event callbacks, which the service invokes on its own thread.
//!
//! The [`sim`] module provides a software RSP implementing [`Api`], with its
//! own streaming thread, so that code driving the API can be exercised without
//! hardware.
//!
//! # Example
//!
//! ```no_run
//! use sdrplay_api::{Api, sim::SimulatedApi, HwVersion};
//!
//! let api = SimulatedApi::with_device("1234567890", HwVersion::Rsp1a);
//! api.lock_device_api()?;
//! for desc in api.get_devices()? {
//!     println!("{} {}", desc.hw_ver, desc.serial);
//! }
//! api.unlock_device_api()?;
//! # Ok::<(), sdrplay_api::Error>(())
//! ```

use std::sync::Arc;

pub mod error;
pub mod sim;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use types::*;

/// API version this crate mirrors (`SDRPLAY_API_VERSION`).
pub const API_VERSION: f32 = 3.15;

/// Maximum number of devices reported by `sdrplay_api_GetDevices()`.
pub const MAX_DEVICES: usize = 16;

/// Receivers of the asynchronous stream and event callbacks.
///
/// The service calls these from its own thread. Calls for one device are
/// never concurrent with each other, but implementations must not block.
pub trait StreamCallbacks: Send + Sync {
    /// Samples from tuner A (or the only tuner).
    fn stream_a(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams, reset: bool);

    /// Samples from tuner B, in RSPduo dual tuner mode.
    fn stream_b(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams, reset: bool);

    fn event(&self, event: &Event, tuner: TunerSelect);
}

/// The SDRplay API service.
pub trait Api: Send + Sync {
    fn api_version(&self) -> Result<f32>;

    fn lock_device_api(&self) -> Result<()>;

    fn unlock_device_api(&self) -> Result<()>;

    fn get_devices(&self) -> Result<Vec<DeviceDesc>>;

    /// Claim a device. `device.tuner` and `device.rspduo_mode` select the
    /// RSPduo operating mode.
    fn select_device(&self, device: &DeviceDesc) -> Result<DeviceId>;

    fn release_device(&self, dev: DeviceId) -> Result<()>;

    fn get_device_params(&self, dev: DeviceId) -> Result<DeviceParams>;

    /// Start streaming. Callbacks may fire before this returns.
    fn init(
        &self,
        dev: DeviceId,
        params: &DeviceParams,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<()>;

    /// Stop streaming. Once this returns the service makes no further
    /// callbacks for the device.
    fn uninit(&self, dev: DeviceId) -> Result<()>;

    fn update(
        &self,
        dev: DeviceId,
        tuner: TunerSelect,
        params: &DeviceParams,
        reason: UpdateReason,
        reason_ext1: UpdateReasonExt1,
    ) -> Result<()>;

    fn debug_enable(&self, dev: DeviceId, enable: bool) -> Result<()>;
}
