//! Stream adapter: the vendor callback entry points.
//!
//! The service calls [`CallbackSink`] on its own thread. Each sample block is
//! handed to the [`StreamAdapter`] of its channel, which checks the session
//! state, tracks sample sequence continuity and copies the block into the
//! channel's ring buffer. Nothing here blocks or returns an error: failures
//! become health counters or, for a lost device, a forced close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use num_complex::Complex;
use tracing::{debug, error, info, warn};

use sdrplay_api::{
    Api, DeviceId, DeviceParams, Event, PowerOverload, RspDuoModeChange, StreamCallbacks,
    StreamCbParams, TunerSelect, UpdateReason, UpdateReasonExt1,
};

use crate::ring_buffer::Producer;
use crate::session::Session;

/// Flags shared between the controller and the callback thread for the
/// lifetime of an open device.
#[derive(Debug, Default)]
pub(crate) struct UpdateFlags {
    fs_changed: AtomicBool,
    rf_changed: AtomicBool,
    gr_changed: AtomicBool,
    removed: AtomicBool,
    pub gaps_check: AtomicBool,
    pub show_gain_changes: AtomicBool,
}

impl UpdateFlags {
    fn record(&self, params: &StreamCbParams) {
        if params.fs_changed {
            self.fs_changed.store(true, Ordering::Release);
        }
        if params.rf_changed {
            self.rf_changed.store(true, Ordering::Release);
        }
        if params.gr_changed {
            self.gr_changed.store(true, Ordering::Release);
        }
    }

    fn watched(&self, reason: UpdateReason) -> Vec<(&'static str, &AtomicBool)> {
        let mut flags = Vec::new();
        if reason.intersects(UpdateReason::DEV_FS | UpdateReason::CTRL_DECIMATION) {
            flags.push(("sample rate", &self.fs_changed));
        }
        if reason.contains(UpdateReason::TUNER_FRF) {
            flags.push(("frequency", &self.rf_changed));
        }
        if reason.contains(UpdateReason::TUNER_GR) {
            flags.push(("gain reduction", &self.gr_changed));
        }
        flags
    }

    /// Reset the flags an update with `reason` will raise.
    pub fn arm(&self, reason: UpdateReason) {
        for (_, flag) in self.watched(reason) {
            flag.store(false, Ordering::Release);
        }
    }

    /// Wait for the stream to confirm an update with `reason`.
    ///
    /// Returns the names of the changes not confirmed within `timeout`.
    pub fn wait_confirmed(&self, reason: UpdateReason, timeout: Duration) -> Vec<&'static str> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: Vec<_> = self
                .watched(reason)
                .into_iter()
                .filter(|(_, flag)| !flag.load(Ordering::Acquire))
                .map(|(name, _)| name)
                .collect();
            if pending.is_empty() || Instant::now() >= deadline {
                return pending;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

struct ChannelWriter {
    producer: Producer<Complex<i16>>,
    scratch: Vec<Complex<i16>>,
    next_sample_num: Option<u32>,
}

/// Per-channel callback handler feeding one ring buffer.
pub(crate) struct StreamAdapter {
    session: Arc<Session>,
    // Only the callback thread locks this, and callbacks are never concurrent.
    writer: Mutex<ChannelWriter>,
}

impl StreamAdapter {
    pub fn new(session: Arc<Session>, producer: Producer<Complex<i16>>) -> Self {
        Self {
            session,
            writer: Mutex::new(ChannelWriter {
                producer,
                scratch: Vec::new(),
                next_sample_num: None,
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handle one block of samples.
    pub fn on_block(
        &self,
        xi: &[i16],
        xq: &[i16],
        params: &StreamCbParams,
        reset: bool,
        gaps_check: bool,
    ) {
        let Some(_in_flight) = self.session.enter() else {
            return;
        };
        let n = xi.len().min(xq.len());
        let Ok(mut writer) = self.writer.try_lock() else {
            // Overlapping callbacks on one stream; never wait here.
            self.session
                .health
                .late_blocks
                .fetch_add(1, Ordering::Relaxed);
            return;
        };
        let writer = &mut *writer;
        let health = &self.session.health;

        if reset {
            writer.next_sample_num = None;
        }
        if let Some(expected) = writer.next_sample_num.filter(|e| *e != params.first_sample_num) {
            let skipped = params.first_sample_num.wrapping_sub(expected);
            health.discontinuities.fetch_add(1, Ordering::Relaxed);
            // A backwards jump is a discontinuity without missing samples.
            if skipped < u32::MAX / 2 {
                health
                    .missing_samples
                    .fetch_add(u64::from(skipped), Ordering::Relaxed);
            }
            if gaps_check {
                warn!(
                    "sample sequence gap on channel {} - expected={} firstSampleNum={}",
                    self.session.channel(),
                    expected,
                    params.first_sample_num
                );
            }
        }
        writer.next_sample_num = Some(params.first_sample_num.wrapping_add(n as u32));

        let sequence = health.blocks.fetch_add(1, Ordering::Relaxed);
        health.next_sequence.store(sequence + 1, Ordering::Relaxed);
        health
            .last_block_at
            .store(self.session.elapsed_ms(), Ordering::Relaxed);

        writer.scratch.clear();
        writer.scratch.extend(
            xi[..n]
                .iter()
                .zip(&xq[..n])
                .map(|(&i, &q)| Complex::new(i, q)),
        );
        writer.producer.write(&writer.scratch);
    }
}

/// The object registered with `init()` for an open device.
pub(crate) struct CallbackSink {
    channels: Vec<Arc<StreamAdapter>>,
    flags: Arc<UpdateFlags>,
    api: Arc<dyn Api>,
    dev: DeviceId,
    tuner: TunerSelect,
    ack_params: Mutex<DeviceParams>,
}

impl CallbackSink {
    pub fn new(
        channels: Vec<Arc<StreamAdapter>>,
        flags: Arc<UpdateFlags>,
        api: Arc<dyn Api>,
        dev: DeviceId,
        tuner: TunerSelect,
        params: DeviceParams,
    ) -> Self {
        Self {
            channels,
            flags,
            api,
            dev,
            tuner,
            ack_params: Mutex::new(params),
        }
    }

    /// Keep the parameters used for overload acknowledgements current.
    pub fn set_params(&self, params: DeviceParams) {
        *self.ack_params.lock().unwrap_or_else(|e| e.into_inner()) = params;
    }

    fn channel_for(&self, tuner: TunerSelect) -> Option<&Arc<StreamAdapter>> {
        match tuner {
            TunerSelect::B if self.channels.len() > 1 => self.channels.get(1),
            _ => self.channels.first(),
        }
    }

    fn fail_all(&self) {
        for channel in &self.channels {
            channel.session().fail();
        }
    }

    fn acknowledge_overload(&self, tuner: TunerSelect) {
        if !self.channels.iter().any(|c| c.session().is_streaming()) {
            return;
        }
        let params = *self.ack_params.lock().unwrap_or_else(|e| e.into_inner());
        let tuner = if tuner == TunerSelect::Neither {
            self.tuner
        } else {
            tuner
        };
        if let Err(e) = self.api.update(
            self.dev,
            tuner,
            &params,
            UpdateReason::CTRL_OVERLOAD_MSG_ACK,
            UpdateReasonExt1::empty(),
        ) {
            error!("{}", e);
        }
    }
}

impl StreamCallbacks for CallbackSink {
    fn stream_a(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams, reset: bool) {
        self.flags.record(params);
        if let Some(channel) = self.channels.first() {
            let gaps_check = self.flags.gaps_check.load(Ordering::Relaxed);
            channel.on_block(xi, xq, params, reset, gaps_check);
        }
    }

    fn stream_b(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams, reset: bool) {
        self.flags.record(params);
        if let Some(channel) = self.channels.get(1) {
            let gaps_check = self.flags.gaps_check.load(Ordering::Relaxed);
            channel.on_block(xi, xq, params, reset, gaps_check);
        }
    }

    fn event(&self, event: &Event, tuner: TunerSelect) {
        match *event {
            Event::GainChange {
                gr_db,
                lna_gr_db,
                curr_gain,
            } => {
                if self.flags.show_gain_changes.load(Ordering::Relaxed) {
                    info!(
                        "gain change - tuner={:?} gRdB={} lnaGRdB={} currGain={:.2}",
                        tuner, gr_db, lna_gr_db, curr_gain
                    );
                }
            }
            Event::PowerOverloadChange(change) => {
                match change {
                    PowerOverload::Detected => {
                        if let Some(channel) = self.channel_for(tuner) {
                            channel
                                .session()
                                .health
                                .overloads
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        warn!("overload detected - please reduce gain");
                    }
                    PowerOverload::Corrected => warn!("overload corrected"),
                }
                self.acknowledge_overload(tuner);
            }
            Event::DeviceRemoved => {
                error!("device removed");
                self.flags.removed.store(true, Ordering::Release);
                self.fail_all();
            }
            Event::DeviceFailure => {
                error!("device failure");
                self.flags.removed.store(true, Ordering::Release);
                self.fail_all();
            }
            Event::RspDuoModeChange(change) => {
                info!("RSPduo mode change - {:?}", change);
                if change == RspDuoModeChange::MasterDllDisappeared {
                    error!("RSPduo master disappeared - closing stream");
                    self.fail_all();
                } else {
                    debug!("RSPduo mode change handled");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::ring_buffer;
    use sdrplay_api::sim::{SimOptions, SimulatedApi};

    fn streaming_adapter(capacity: usize) -> (Arc<StreamAdapter>, crate::ring_buffer::Consumer<Complex<i16>>) {
        let session = Session::new(0);
        session.configure();
        session.begin_streaming();
        let (tx, rx) = ring_buffer(capacity);
        (Arc::new(StreamAdapter::new(session, tx)), rx)
    }

    fn block(first: u32, n: usize) -> (Vec<i16>, Vec<i16>, StreamCbParams) {
        let xi: Vec<i16> = (0..n).map(|k| (first as usize + k) as i16).collect();
        let xq: Vec<i16> = xi.iter().map(|v| -v).collect();
        let params = StreamCbParams {
            first_sample_num: first,
            num_samples: n as u32,
            ..Default::default()
        };
        (xi, xq, params)
    }

    #[test]
    fn test_consecutive_blocks_have_consecutive_sequence() {
        let (adapter, mut rx) = streaming_adapter(1024);
        for k in 0..10u32 {
            let (xi, xq, params) = block(k * 16, 16);
            adapter.on_block(&xi, &xq, &params, k == 0, false);
        }
        let health = &adapter.session().health;
        assert_eq!(health.blocks.load(Ordering::Relaxed), 10);
        assert_eq!(health.next_sequence.load(Ordering::Relaxed), 10);
        assert_eq!(health.discontinuities.load(Ordering::Relaxed), 0);

        let samples = rx.read(1000);
        assert_eq!(samples.len(), 160);
        assert_eq!(samples[17], Complex::new(17, -17));
    }

    #[test]
    fn test_gap_is_a_discontinuity() {
        let (adapter, _rx) = streaming_adapter(1024);
        let (xi, xq, params) = block(0, 16);
        adapter.on_block(&xi, &xq, &params, true, true);
        // One block of 16 samples missing.
        let (xi, xq, params) = block(32, 16);
        adapter.on_block(&xi, &xq, &params, false, true);
        let health = &adapter.session().health;
        assert_eq!(health.discontinuities.load(Ordering::Relaxed), 1);
        assert_eq!(health.missing_samples.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_reset_clears_expected_sample() {
        let (adapter, _rx) = streaming_adapter(1024);
        let (xi, xq, params) = block(100, 16);
        adapter.on_block(&xi, &xq, &params, true, false);
        let (xi, xq, params) = block(0, 16);
        adapter.on_block(&xi, &xq, &params, true, false);
        assert_eq!(
            adapter.session().health.discontinuities.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_sample_number_wraps() {
        let (adapter, _rx) = streaming_adapter(1024);
        let (xi, xq, params) = block(u32::MAX - 7, 16);
        adapter.on_block(&xi, &xq, &params, true, false);
        let (xi, xq, params) = block(8, 16);
        adapter.on_block(&xi, &xq, &params, false, false);
        assert_eq!(
            adapter.session().health.discontinuities.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_block_discarded_when_not_streaming() {
        let (adapter, rx) = streaming_adapter(64);
        adapter.session().drain();
        let (xi, xq, params) = block(0, 16);
        adapter.on_block(&xi, &xq, &params, true, false);
        assert!(rx.is_empty());
        assert_eq!(adapter.session().health.late_blocks.load(Ordering::Relaxed), 1);
        assert_eq!(adapter.session().health.blocks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_overflow_counts_dropped() {
        let (adapter, rx) = streaming_adapter(32);
        let (xi, xq, params) = block(0, 40);
        adapter.on_block(&xi, &xq, &params, true, false);
        assert_eq!(rx.len(), 31);
        assert_eq!(rx.dropped_count(), 9);
    }

    #[test]
    fn test_device_removed_closes_sessions() {
        let api: Arc<dyn Api> = Arc::new(SimulatedApi::new(SimOptions::manual()));
        let (adapter, _rx) = streaming_adapter(64);
        let flags = Arc::new(UpdateFlags::default());
        let sink = CallbackSink::new(
            vec![adapter.clone()],
            flags.clone(),
            api,
            DeviceId(1),
            TunerSelect::A,
            DeviceParams::default(),
        );
        sink.event(&Event::DeviceRemoved, TunerSelect::A);
        assert!(flags.is_removed());
        assert!(adapter.session().is_faulted());
        assert_eq!(adapter.session().state(), crate::session::SessionState::Closed);
    }

    #[test]
    fn test_flags_confirm_updates() {
        let flags = UpdateFlags::default();
        let reason = UpdateReason::TUNER_FRF | UpdateReason::TUNER_GR;
        flags.arm(reason);
        assert_eq!(
            flags.wait_confirmed(reason, Duration::ZERO),
            vec!["frequency", "gain reduction"]
        );
        flags.record(&StreamCbParams {
            rf_changed: true,
            gr_changed: true,
            ..Default::default()
        });
        assert!(flags.wait_confirmed(reason, Duration::ZERO).is_empty());
    }
}
