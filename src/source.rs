//! Scheduler-facing source block
//!
//! [`RspSource`] bundles a [`DeviceController`] with the output ports of its
//! channels and exposes the work-function contract of a flowgraph source:
//! `work()` fills one output buffer per channel, never blocks, and returns
//! [`Produced::Done`] once the stream has been stopped and drained.

use tracing::debug;

use crate::config::StreamConfig;
use crate::controller::DeviceController;
use crate::error::{Error, Result};
use crate::port::{Health, OutputPort, OutputSample, Produced};

/// A device controller with its output ports
pub struct RspSource {
    controller: DeviceController,
    ports: Vec<OutputPort>,
}

impl RspSource {
    /// Take the output ports of `controller`.
    pub fn new(controller: DeviceController) -> Result<Self> {
        let ports = (0..controller.channels())
            .map(|c| controller.output_port(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { controller, ports })
    }

    pub fn controller(&self) -> &DeviceController {
        &self.controller
    }

    /// Number of output streams.
    pub fn channels(&self) -> usize {
        self.ports.len()
    }

    pub fn start(&mut self) -> Result<()> {
        self.controller.start()?;
        self.refresh_ports()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.controller.stop()
    }

    /// Apply a new configuration, restarting the stream if needed.
    pub fn reconfigure(&mut self, config: StreamConfig) -> Result<()> {
        self.controller.reconfigure(config)?;
        self.refresh_ports()
    }

    /// Pick up the ports of a new session after a restart.
    fn refresh_ports(&mut self) -> Result<()> {
        let channels = self.controller.channels();
        let mut ports = Vec::with_capacity(channels);
        for channel in 0..channels {
            match self.controller.output_port(channel) {
                Ok(port) => ports.push(port),
                Err(Error::PortTaken(_)) => {
                    // Same session as before.
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        debug!("new session with {} channel(s)", channels);
        self.ports = ports;
        Ok(())
    }

    /// Fill `outputs`, one buffer per channel.
    ///
    /// Every channel gets the same number of items so multi-channel outputs
    /// stay aligned. Returns `Items(0)` when nothing is buffered, and `Done`
    /// as soon as one channel is finished.
    pub fn work<S: OutputSample>(&mut self, outputs: &mut [&mut [S]]) -> Produced {
        if self.ports.iter_mut().any(|p| p.is_done()) {
            return Produced::Done;
        }
        let n = self
            .ports
            .iter()
            .zip(outputs.iter())
            .map(|(port, out)| port.available().min(out.len()))
            .min()
            .unwrap_or(0);
        if n == 0 {
            return Produced::Items(0);
        }
        for (port, out) in self.ports.iter_mut().zip(outputs.iter_mut()) {
            port.pull(&mut **out, n);
        }
        Produced::Items(n)
    }

    /// Health of each channel.
    pub fn health(&self) -> Vec<Health> {
        self.ports.iter().map(|p| p.health()).collect()
    }
}
