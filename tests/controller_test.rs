//! Integration tests for the device controller against the simulated service

mod helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use helpers::*;
use num_complex::Complex;
use sdrplay3::api::sim::SimulatedApi;
use sdrplay3::api::{ErrorCode, Event, HwVersion, PowerOverload, TunerSelect, UpdateReason};
use sdrplay3::{
    Antenna, DeviceRegistry, DeviceSelector, DuoMode, Error, Produced, SessionState, StreamConfig,
};

fn config() -> StreamConfig {
    StreamConfig::new(100e6, 2e6, 40, 3)
}

#[test]
fn test_open_unknown_device() {
    let api = manual_api(HwVersion::Rsp1a);
    let result = sdrplay3::DeviceController::open(
        api.clone(),
        DeviceRegistry::new(),
        &DeviceSelector::Serial("9999999999".into()),
        config(),
        test_options(),
    );
    assert!(matches!(result, Err(Error::DeviceNotFound(_))));

    let result = sdrplay3::DeviceController::open(
        api,
        DeviceRegistry::new(),
        &DeviceSelector::Index(3),
        config(),
        test_options(),
    );
    assert!(matches!(result, Err(Error::DeviceNotFound(_))));
}

#[test]
fn test_open_busy_device() {
    let api = manual_api(HwVersion::Rsp1a);
    api.set_in_use_elsewhere(SERIAL, true);
    assert!(matches!(open(&api, config()), Err(Error::DeviceBusy(_))));

    api.set_in_use_elsewhere(SERIAL, false);
    let registry = DeviceRegistry::new();
    let open_shared = || {
        sdrplay3::DeviceController::open(
            api.clone(),
            registry.clone(),
            &DeviceSelector::Serial(SERIAL.into()),
            config(),
            test_options(),
        )
    };
    let first = open_shared().expect("first open");
    assert!(matches!(open_shared(), Err(Error::DeviceBusy(_))));
    first.close().expect("close");
    assert!(!registry.is_claimed(SERIAL));
    assert!(open_shared().is_ok());
}

#[test]
fn test_open_rejects_unsupported_config() {
    let api = manual_api(HwVersion::Rsp1a);
    let bad_rate = StreamConfig {
        sample_rate: 3.3e6,
        ..config()
    };
    assert!(matches!(open(&api, bad_rate), Err(Error::UnsupportedConfig(_))));
    let bad_antenna = StreamConfig {
        antenna: Antenna::C,
        ..config()
    };
    assert!(matches!(open(&api, bad_antenna), Err(Error::UnsupportedConfig(_))));
    // Nothing is left selected or claimed.
    assert!(!api.is_selected(SERIAL));
    assert!(open(&api, config()).is_ok());
}

#[test]
fn test_parameters_reach_the_service() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, StreamConfig::new(433.92e6, 250e3, 35, 4)).expect("open");
    controller.start().expect("start");
    let params = api.params(SERIAL).expect("params");
    assert_eq!(params.rx_a.tuner.rf_hz, 433.92e6);
    assert_eq!(params.rx_a.tuner.gain.gr_db, 35);
    assert_eq!(params.rx_a.tuner.gain.lna_state, 4);
    assert_eq!(params.rx_a.ctrl.decimation.factor, 8);
    assert_eq!(params.dev.expect("device params").fs_hz, 6e6);
}

#[test]
fn test_retune_while_streaming() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");

    controller.retune(433.92e6).expect("retune");
    controller.set_gain(30, 2).expect("gain");

    let updates = api.updates(SERIAL);
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].reason, UpdateReason::TUNER_FRF);
    assert_eq!(updates[0].tuner, TunerSelect::A);
    assert_eq!(updates[1].reason, UpdateReason::TUNER_GR);
    assert_eq!(api.params(SERIAL).expect("params").rx_a.tuner.rf_hz, 433.92e6);
    assert_eq!(controller.config().expect("config").center_freq, 433.92e6);
    assert_eq!(controller.state(0), Some(SessionState::Streaming));
}

#[test]
fn test_setting_the_same_value_sends_no_update() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");
    controller.retune(100e6).expect("retune");
    assert!(api.updates(SERIAL).is_empty());
}

#[test]
fn test_invalid_values_leave_config_unchanged() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");

    assert!(matches!(controller.retune(3e9), Err(Error::InvalidParameter(_))));
    assert!(matches!(controller.set_gain(70, 0), Err(Error::InvalidParameter(_))));
    assert!(matches!(
        controller.set_gain_db("MIX", 10.0),
        Err(Error::InvalidParameter(_))
    ));
    assert_eq!(controller.config().expect("config"), config());
    assert!(api.updates(SERIAL).is_empty());
}

#[test]
fn test_sample_rate_is_restart_only() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.set_sample_rate(500e3).expect("stopped rate change");
    assert_eq!(controller.sample_rate_plan().expect("plan").decimation, 4);

    controller.start().expect("start");
    assert!(matches!(
        controller.set_sample_rate(1e6),
        Err(Error::UnsupportedConfig(_))
    ));
    assert_eq!(controller.config().expect("config").sample_rate, 500e3);
}

#[test]
fn test_reconfigure_restarts_stream() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    let mut old_port = controller.output_port(0).expect("port");
    controller.start().expect("start");
    push_a(&*callbacks(&api), 0, 100, 7);

    let new_config = StreamConfig {
        sample_rate: 1e6,
        center_freq: 145e6,
        ..config()
    };
    controller.reconfigure(new_config.clone()).expect("reconfigure");
    assert_eq!(api.init_count(), 2);
    assert_eq!(controller.config().expect("config"), new_config);

    // The old session drains and finishes.
    let mut buf = vec![Complex::<i16>::default(); 256];
    assert_eq!(old_port.pull(&mut buf, 256), Produced::Items(100));
    assert_eq!(old_port.pull(&mut buf, 256), Produced::Done);

    // The new one streams into a new port.
    let mut new_port = controller.output_port(0).expect("new port");
    push_a(&*callbacks(&api), 0, 50, 1);
    assert_eq!(new_port.pull(&mut buf, 256), Produced::Items(50));
    assert_eq!(new_port.health().blocks, 1);
}

#[test]
fn test_reconfigure_hot_fields_is_live() {
    let api = manual_api(HwVersion::Rsp2);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");
    let hot = StreamConfig {
        antenna: Antenna::B,
        bias_tee: true,
        ..config()
    };
    controller.reconfigure(hot).expect("reconfigure");
    assert_eq!(api.init_count(), 1);
    let reason = api.updates(SERIAL)[0].reason;
    assert!(reason.contains(UpdateReason::RSP2_ANTENNA_CONTROL));
    assert!(reason.contains(UpdateReason::RSP2_BIAS_T_CONTROL));
}

#[test]
fn test_port_taken_once_per_session() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    let _port = controller.output_port(0).expect("port");
    assert!(matches!(controller.output_port(0), Err(Error::PortTaken(0))));
    assert!(matches!(
        controller.output_port(1),
        Err(Error::InvalidParameter(_))
    ));
}

#[test]
fn test_stop_drains_then_done() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    let mut port = controller.output_port(0).expect("port");
    controller.start().expect("start");
    let cb = callbacks(&api);
    push_a(&*cb, 0, 64, 3);
    controller.stop().expect("stop");
    assert_eq!(controller.state(0), Some(SessionState::Draining));

    // Late blocks are discarded.
    push_a(&*cb, 64, 64, 4);
    assert_eq!(controller.health(0).expect("health").late_blocks, 1);

    let mut buf = vec![Complex::<f32>::default(); 128];
    assert_eq!(port.pull(&mut buf, 128), Produced::Items(64));
    assert_eq!(port.pull(&mut buf, 128), Produced::Done);
    assert_eq!(controller.state(0), Some(SessionState::Closed));

    // A second stop is a no-op.
    controller.stop().expect("second stop");
}

#[test]
fn test_no_writes_after_stop_returns() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    let mut port = controller.output_port(0).expect("port");
    controller.start().expect("start");

    let cb = callbacks(&api);
    let running = Arc::new(AtomicBool::new(true));
    let delivered = Arc::new(AtomicU64::new(0));
    let pusher = {
        let running = running.clone();
        let delivered = delivered.clone();
        thread::spawn(move || {
            let mut first = 0u32;
            while running.load(Ordering::SeqCst) {
                push_a(&*cb, first, 32, 1);
                first = first.wrapping_add(32);
                delivered.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    thread::sleep(Duration::from_millis(20));
    controller.stop().expect("stop");

    let written = controller.health(0).expect("health");
    thread::sleep(Duration::from_millis(20));
    let later = controller.health(0).expect("health");
    assert_eq!(written.blocks, later.blocks);
    assert_eq!(written.buffered + written.dropped_count as usize, later.buffered + later.dropped_count as usize);
    assert!(later.late_blocks > 0);

    running.store(false, Ordering::SeqCst);
    pusher.join().expect("pusher");
    assert!(delivered.load(Ordering::SeqCst) > 0);

    let mut buf = vec![Complex::<i16>::default(); 4096];
    let mut pulled = 0;
    loop {
        match port.pull(&mut buf, 4096) {
            Produced::Items(n) => pulled += n,
            Produced::Done => break,
        }
    }
    assert_eq!(pulled, later.buffered);
}

#[test]
fn test_shutdown_timeout_faults_device() {
    let api = manual_api(HwVersion::Rsp1a);
    let options = sdrplay3::ControllerOptions {
        shutdown_timeout: Duration::from_millis(50),
        ..test_options()
    };
    let controller = open_with(&api, config(), options).expect("open");
    controller.start().expect("start");
    api.set_uninit_delay(Duration::from_millis(500));

    assert!(matches!(controller.stop(), Err(Error::ShutdownTimeout(_))));
    assert!(matches!(controller.start(), Err(Error::DeviceFault(_))));
    assert!(matches!(controller.retune(145e6), Err(Error::DeviceFault(_))));
    assert!(controller.health(0).expect("health").faulted);
    // Close still releases the device.
    controller.close().expect("close");
}

#[test]
fn test_start_failure_returns_to_configuring() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    api.set_fail_init(Some(ErrorCode::HwError));
    assert!(matches!(controller.start(), Err(Error::Api(_))));
    assert_eq!(controller.state(0), Some(SessionState::Configuring));
    assert!(!controller.is_streaming());

    api.set_fail_init(None);
    controller.start().expect("retry");
    assert_eq!(controller.state(0), Some(SessionState::Streaming));
}

#[test]
fn test_close_is_idempotent() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");
    controller.close().expect("close");
    assert!(!api.is_selected(SERIAL));
    assert_eq!(controller.state(0), Some(SessionState::Closed));
    controller.close().expect("second close");
    assert!(matches!(controller.start(), Err(Error::DeviceFault(_))));
}

#[test]
fn test_device_removed_while_streaming() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    let mut port = controller.output_port(0).expect("port");
    controller.start().expect("start");
    push_a(&*callbacks(&api), 0, 10, 1);

    api.remove_device(SERIAL);
    assert_eq!(controller.state(0), Some(SessionState::Closed));
    assert!(matches!(controller.retune(145e6), Err(Error::DeviceFault(_))));

    let mut buf = vec![Complex::<i16>::default(); 16];
    assert_eq!(port.pull(&mut buf, 16), Produced::Items(10));
    assert_eq!(port.pull(&mut buf, 16), Produced::Done);
    assert!(port.health().faulted);
    controller.close().expect("close after removal");
}

#[test]
fn test_overload_is_acknowledged() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");
    callbacks(&api).event(
        &Event::PowerOverloadChange(PowerOverload::Detected),
        TunerSelect::A,
    );
    let updates = api.updates(SERIAL);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].reason, UpdateReason::CTRL_OVERLOAD_MSG_ACK);
    assert_eq!(controller.health(0).expect("health").overloads, 1);
}

#[test]
fn test_sequence_gaps_in_health() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");
    let cb = callbacks(&api);
    push_a(&*cb, 0, 100, 1);
    push_a(&*cb, 100, 100, 1);
    push_a(&*cb, 300, 100, 1);
    let health = controller.health(0).expect("health");
    assert_eq!(health.blocks, 3);
    assert_eq!(health.last_sequence, Some(2));
    assert_eq!(health.discontinuities, 1);
    assert_eq!(health.missing_samples, 100);
}

#[test]
fn test_gain_by_name() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.set_gain_db("IF", -35.0).expect("IF gain");
    assert_eq!(controller.config().expect("config").gain_reduction, 35);
    assert_eq!(controller.gain_db("IF").expect("IF"), -35.0);

    // RSP1A 60-420 MHz: [0, 6, 12, 18, 20, 26, 32, 38, 57, 62]
    controller.set_gain_db("RF", -25.0).expect("RF gain");
    assert_eq!(controller.config().expect("config").lna_state, 5);
    assert_eq!(controller.gain_db("RF").expect("RF"), -26.0);
    assert_eq!(controller.gain_range("RF").expect("range"), (-62.0, 0.0));
    assert_eq!(controller.gain_range("IF").expect("range"), (-59.0, -20.0));
}

#[test]
fn test_lna_state_clamped_on_band_change() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, StreamConfig::new(100e6, 2e6, 40, 9)).expect("open");
    // Only 9 states above 1 GHz.
    controller.retune(1500e6).expect("retune");
    assert_eq!(controller.config().expect("config").lna_state, 8);
}

#[test]
fn test_debug_mode() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = open(&api, config()).expect("open");
    controller.set_debug_mode(true).expect("debug");
    assert!(api.debug_enabled(SERIAL));
}

#[test]
fn test_rspduo_dual_tuner() {
    let api = manual_api(HwVersion::RspDuo);
    let dual = StreamConfig {
        duo_mode: DuoMode::DualTuner,
        ..StreamConfig::new(100e6, 500e3, 40, 0)
    };
    let controller = open(&api, dual).expect("open");
    assert_eq!(controller.channels(), 2);
    let mut a = controller.output_port(0).expect("port a");
    let mut b = controller.output_port(1).expect("port b");
    controller.start().expect("start");

    let cb = callbacks(&api);
    push_a(&*cb, 0, 20, 1);
    push_b(&*cb, 0, 30, 2);
    let mut buf = vec![Complex::<i16>::default(); 64];
    assert_eq!(a.pull(&mut buf, 64), Produced::Items(20));
    assert_eq!(buf[0], Complex::new(1, 1));
    assert_eq!(b.pull(&mut buf, 64), Produced::Items(30));
    assert_eq!(buf[0], Complex::new(2, 2));

    controller.retune_tuner(1, 145e6).expect("retune tuner B");
    let updates = api.updates(SERIAL);
    assert_eq!(updates[0].tuner, TunerSelect::B);
    let params = api.params(SERIAL).expect("params");
    assert_eq!(params.rx_a.tuner.rf_hz, 100e6);
    assert_eq!(params.rx_b.expect("tuner B").tuner.rf_hz, 145e6);

    // Rates outside the shared set are not available in dual tuner mode.
    controller.stop().expect("stop");
    assert!(matches!(
        controller.set_sample_rate(6e6),
        Err(Error::UnsupportedConfig(_))
    ));
}

#[test]
fn test_rspduo_tuner_switch_needs_restart() {
    let api = manual_api(HwVersion::RspDuo);
    let controller = open(&api, config()).expect("open");
    controller.start().expect("start");
    assert!(matches!(
        controller.set_antenna(Antenna::Tuner2),
        Err(Error::UnsupportedConfig(_))
    ));

    let tuner2 = StreamConfig {
        antenna: Antenna::Tuner2,
        ..config()
    };
    controller.reconfigure(tuner2).expect("reconfigure");
    controller.retune(145e6).expect("retune");
    let updates = api.updates(SERIAL);
    assert_eq!(updates.last().expect("update").tuner, TunerSelect::B);
    assert_eq!(
        api.params(SERIAL).expect("params").rx_b.expect("tuner B").tuner.rf_hz,
        145e6
    );
}

#[test]
fn test_streaming_generator_end_to_end() {
    let api: Arc<SimulatedApi> = streaming_api(HwVersion::RspDx);
    let controller = open(&api, config()).expect("open");
    let mut port = controller.output_port(0).expect("port");
    controller.start().expect("start");

    let mut buf = vec![Complex::<f32>::default(); 8192];
    let mut total = 0;
    while total < 20_000 {
        match port.pull(&mut buf, 8192) {
            Produced::Items(n) => total += n,
            Produced::Done => panic!("stream ended early"),
        }
    }
    controller.stop().expect("stop");
    let health = controller.health(0).expect("health");
    assert_eq!(health.discontinuities, 0);
    assert!(health.blocks > 0);
}

#[test]
fn test_port_finishes_after_tuner_switch() {
    let api = manual_api(HwVersion::RspDuo);
    let controller = open(&api, config()).expect("open");
    let mut old = controller.output_port(0).expect("port");
    controller.set_antenna(Antenna::Tuner2).expect("switch tuner");

    let mut buf = vec![Complex::<i16>::default(); 16];
    assert_eq!(old.pull(&mut buf, 16), Produced::Done);
    assert_eq!(old.health().state, SessionState::Closed);

    let mut new = controller.output_port(0).expect("new port");
    assert_eq!(new.pull(&mut buf, 16), Produced::Items(0));
    controller.close().expect("close");
    assert_eq!(new.pull(&mut buf, 16), Produced::Done);
}

#[test]
fn test_rspduo_independent_gains() {
    let api = manual_api(HwVersion::RspDuo);
    let dual = StreamConfig {
        duo_mode: DuoMode::DualTuner,
        ..StreamConfig::new(100e6, 500e3, 40, 0)
    };
    let controller = open(&api, dual).expect("open");
    controller.start().expect("start");

    controller.set_gain_tuner(1, 30, 2).expect("gain tuner B");
    assert_eq!(api.updates(SERIAL).last().expect("update").tuner, TunerSelect::B);
    let params = api.params(SERIAL).expect("params");
    assert_eq!(params.rx_a.tuner.gain.gr_db, 40);
    let rx_b = params.rx_b.expect("tuner B");
    assert_eq!((rx_b.tuner.gain.gr_db, rx_b.tuner.gain.lna_state), (30, 2));

    controller.set_gain_db_tuner(0, "IF", -25.0).expect("IF gain tuner A");
    assert_eq!(api.updates(SERIAL).last().expect("update").tuner, TunerSelect::A);
    assert_eq!(controller.gain_db_tuner(0, "IF").expect("gain"), -25.0);
    assert_eq!(controller.gain_db_tuner(1, "IF").expect("gain"), -30.0);
    assert_eq!(controller.gain_db("IF").expect("gain"), -40.0);

    controller.retune_tuner(1, 145e6).expect("retune tuner B");
    assert_eq!(controller.center_freq_tuner(1).expect("freq"), 145e6);
    assert_eq!(controller.center_freq_tuner(0).expect("freq"), 100e6);

    assert!(matches!(
        controller.set_gain_tuner(2, 30, 0),
        Err(Error::InvalidParameter(_))
    ));
    assert!(matches!(
        controller.set_gain_tuner(1, 70, 0),
        Err(Error::InvalidParameter(_))
    ));

    // A gain for all tuners replaces the per-tuner ones.
    controller.set_gain(35, 1).expect("gain");
    assert_eq!(controller.gain_db_tuner(0, "IF").expect("gain"), -35.0);
    assert_eq!(controller.gain_db_tuner(1, "IF").expect("gain"), -35.0);
    let rx_b = api.params(SERIAL).expect("params").rx_b.expect("tuner B");
    assert_eq!((rx_b.tuner.gain.gr_db, rx_b.tuner.gain.lna_state), (35, 1));
    assert_eq!(rx_b.tuner.rf_hz, 145e6);
}

#[test]
fn test_rspduo_diversity_shares_settings() {
    let api = manual_api(HwVersion::RspDuo);
    let diversity = StreamConfig {
        duo_mode: DuoMode::Diversity,
        ..StreamConfig::new(100e6, 500e3, 40, 0)
    };
    let controller = open(&api, diversity).expect("open");
    assert_eq!(controller.channels(), 2);
    controller.start().expect("start");

    assert!(matches!(
        controller.retune_tuner(1, 145e6),
        Err(Error::UnsupportedConfig(_))
    ));
    assert!(matches!(
        controller.set_gain_tuner(0, 30, 0),
        Err(Error::UnsupportedConfig(_))
    ));

    controller.retune(145e6).expect("retune");
    assert_eq!(api.updates(SERIAL).last().expect("update").tuner, TunerSelect::Both);
    let params = api.params(SERIAL).expect("params");
    assert_eq!(params.rx_a.tuner.rf_hz, 145e6);
    assert_eq!(params.rx_b.expect("tuner B").tuner.rf_hz, 145e6);
}

#[test]
fn test_health_during_stalled_stop() {
    let api = manual_api(HwVersion::Rsp1a);
    let controller = Arc::new(open(&api, config()).expect("open"));
    controller.start().expect("start");
    push_a(&*callbacks(&api), 0, 8, 1);
    api.set_uninit_delay(Duration::from_millis(300));

    let stopping = {
        let controller = controller.clone();
        thread::spawn(move || controller.stop())
    };
    thread::sleep(Duration::from_millis(50));

    let asked = Instant::now();
    let health = controller.health(0).expect("health");
    assert_eq!(controller.state(0), Some(SessionState::Draining));
    assert!(!controller.is_streaming());
    assert!(asked.elapsed() < Duration::from_millis(100));
    assert_eq!(health.buffered, 8);

    stopping.join().expect("stop thread").expect("stop");
}
