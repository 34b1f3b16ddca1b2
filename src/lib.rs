#![doc = include_str!("../readme.md")]

mod adapter;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod port;
pub mod reader;
pub mod registry;
pub mod ring_buffer;
pub mod session;
pub mod source;

pub use config::{ControllerOptions, DeviceSelector, DuoMode, SampleRatePlan, StreamConfig};
pub use controller::{DeviceController, DeviceHandle};
pub use error::{Error, Result};
pub use model::{Antenna, Capabilities, HwVersion};
pub use port::{Health, OutputPort, OutputSample, Produced};
pub use reader::{AsyncRspReader, RspReader};
pub use registry::{DeviceInfo, DeviceRegistry, list_devices};
pub use session::SessionState;
pub use source::RspSource;

/// The SDRplay API contract and its simulated backend.
pub use sdrplay_api as api;
