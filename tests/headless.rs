//! Headless integration tests for signal_mix.
//!
//! These drive `MixEngine` end-to-end on offline engines: audio comes from
//! `tone:` URLs or scripted connectors and is rendered synchronously with
//! `advance`, so no audio device or network is needed.

use signal_mix::config::StreamConfig;
use signal_mix::device::StaticDevices;
use signal_mix::engine::{LogLevel, MixEngine};
use signal_mix::error::BindFailure;
use signal_mix::stream::{ConnectRequest, StreamConnector, StreamSession};
use signal_mix::{BusId, EqBand, ExportFormat, MixConfig, MixError, MixEvent, StreamState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TONE: &str = "tone:440?amp=0.5";
const STEP: Duration = Duration::from_millis(50);

fn test_config() -> MixConfig {
    MixConfig {
        stream: StreamConfig {
            max_reconnects: 0,
            retry_base_delay_ms: 10,
            ..StreamConfig::default()
        },
        ..MixConfig::default()
    }
}

fn make_engine() -> MixEngine {
    MixEngine::offline(test_config()).unwrap()
}

fn engine_with(connector: Arc<dyn StreamConnector>) -> MixEngine {
    MixEngine::offline_with(test_config(), connector, Box::new(StaticDevices::default())).unwrap()
}

/// Poll until `pred` holds, collecting every event. Panics after 5 s.
fn poll_until(engine: &mut MixEngine, pred: impl Fn(&MixEngine) -> bool) -> Vec<MixEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    loop {
        events.extend(engine.poll().unwrap());
        if pred(engine) {
            return events;
        }
        assert!(Instant::now() < deadline, "condition not reached; events: {:?}", events);
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn state_of(engine: &MixEngine, channel: &str) -> Option<StreamState> {
    engine.channel(channel).unwrap().stream_state
}

fn play(engine: &mut MixEngine, channel: &str, url: &str) {
    engine.bind_stream(channel, url).unwrap();
    poll_until(engine, |e| state_of(e, channel) == Some(StreamState::Playing));
}

/// Render `duration` in steps, letting `channel`'s worker refill between them.
fn render(engine: &mut MixEngine, channel: &str, duration: Duration) -> Vec<MixEvent> {
    let mut events = Vec::new();
    let mut done = Duration::ZERO;
    while done < duration {
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.channel(channel).unwrap().buffered_ms < 100 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        engine.advance(STEP).unwrap();
        events.extend(engine.poll().unwrap());
        done += STEP;
    }
    events
}

// ── Scripted transport ─────────────────────────────────────────────────────

/// Connects to `<name>.m3u8#delay=<ms>&kbps=<n>&value=<x>` URLs and counts
/// how many sessions are alive at once.
struct Scripted {
    connects: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Scripted {
            connects: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }
}

struct Constant {
    value: f32,
    kbps: u32,
    live: Arc<AtomicUsize>,
}

impl StreamSession for Constant {
    fn next_block(&mut self) -> Result<Option<Vec<f32>>, BindFailure> {
        Ok(Some(vec![self.value; 960]))
    }

    fn bitrate_kbps(&self) -> Option<u32> {
        Some(self.kbps)
    }
}

impl Drop for Constant {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StreamConnector for Scripted {
    fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn StreamSession>, BindFailure> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (_, params) = request.url.split_once('#').unwrap_or((request.url, ""));
        let mut delay = 0;
        let mut kbps = 128;
        let mut value = 0.1;
        for pair in params.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("delay", v)) => delay = v.parse().unwrap(),
                Some(("kbps", v)) => kbps = v.parse().unwrap(),
                Some(("value", v)) => value = v.parse().unwrap(),
                _ => return Err(BindFailure::Manifest(pair.to_string())),
            }
        }
        std::thread::sleep(Duration::from_millis(delay));
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Constant {
            value,
            kbps,
            live: self.live.clone(),
        }))
    }
}

// ── Channel strip ──────────────────────────────────────────────────────────

#[test]
fn mute_then_unmute_restores_every_fader() {
    let mut engine = make_engine();
    for (i, id) in engine.channel_ids().iter().enumerate() {
        let fader = 0.1 + i as f32 * 0.07;
        engine.set_channel_fader(id, fader).unwrap();
        engine.set_channel_mute(id, true).unwrap();
        assert!(engine.channel(id).unwrap().muted);
        engine.set_channel_mute(id, false).unwrap();
        let ch = engine.channel(id).unwrap();
        assert!(!ch.muted);
        assert_eq!(ch.fader, fader, "{} drifted", id);
    }
}

#[test]
fn eq_bypass_twice_restores_every_band() {
    let mut engine = make_engine();
    for id in engine.channel_ids() {
        engine.set_channel_eq(&id, EqBand::Low, 4.5).unwrap();
        engine.set_channel_eq(&id, EqBand::Mid, -3.0).unwrap();
        engine.set_channel_eq(&id, EqBand::High, 7.25).unwrap();
        let before = engine.channel(&id).unwrap().eq;

        assert!(engine.toggle_channel_eq_bypass(&id).unwrap());
        assert!(!engine.toggle_channel_eq_bypass(&id).unwrap());
        assert_eq!(engine.channel(&id).unwrap().eq, before, "{} lost its EQ", id);
    }
}

#[test]
fn eq_gains_are_clamped() {
    let mut engine = make_engine();
    assert_eq!(engine.set_channel_eq("A", EqBand::Low, 30.0).unwrap(), 12.0);
    assert_eq!(engine.set_channel_eq("A", EqBand::High, -30.0).unwrap(), -12.0);
}

// ── Routing ────────────────────────────────────────────────────────────────

#[test]
fn muted_channel_leaves_master_and_returns_on_unmute() {
    let mut engine = make_engine();
    play(&mut engine, "C", TONE);
    engine.set_channel_fader("C", 0.8).unwrap();
    engine.set_channel_mute("C", true).unwrap();
    render(&mut engine, "C", Duration::from_millis(500));

    let master = engine.bus_tap(BusId::Master).unwrap();
    assert!(master.rms() < 1e-4, "muted C leaked: {}", master.rms());
    assert!(engine.channel_tap("C").unwrap().rms() > 0.1);

    engine.set_channel_mute("C", false).unwrap();
    render(&mut engine, "C", Duration::from_millis(500));
    assert!(master.rms() > 0.05, "unmute did not restore C: {}", master.rms());
    assert_eq!(engine.channel("C").unwrap().fader, 0.8);
}

#[test]
fn freshly_bound_stream_is_audible_on_master() {
    let mut engine = make_engine();
    assert_eq!(engine.channel("C").unwrap().fader, 0.8);
    play(&mut engine, "C", TONE);
    render(&mut engine, "C", Duration::from_millis(300));
    assert!(engine.bus_tap(BusId::Master).unwrap().rms() > 0.05);
}

#[test]
fn aux_send_reaches_aux1_while_muted_on_master() {
    let mut engine = make_engine();
    play(&mut engine, "C", TONE);
    engine.set_channel_fader("C", 0.8).unwrap();
    engine.set_channel_mute("C", true).unwrap();
    let send = engine.set_aux_send("C", BusId::Aux1, 0.9).unwrap();
    assert!(send.enabled);
    render(&mut engine, "C", Duration::from_millis(300));

    assert!(engine.bus_tap(BusId::Aux1).unwrap().rms() > 0.05);
    assert!(engine.bus_tap(BusId::Aux2).unwrap().rms() < 1e-4);
    assert!(engine.bus_tap(BusId::Master).unwrap().rms() < 1e-4);
}

#[test]
fn dynamics_toggles_leave_aux_buses_alone() {
    let mut engine = make_engine();
    play(&mut engine, "C", TONE);
    engine.set_channel_fader("C", 0.6).unwrap();
    engine.set_aux_send("C", BusId::Aux1, 1.0).unwrap();
    engine.set_bus_level(BusId::Aux2, 0.4).unwrap();
    render(&mut engine, "C", Duration::from_millis(400));

    let aux1 = engine.bus_tap(BusId::Aux1).unwrap();
    let before = aux1.rms();
    assert!(before > 0.05);

    assert!(engine.toggle_compressor().unwrap());
    assert!(!engine.toggle_limiter().unwrap());
    render(&mut engine, "C", Duration::from_millis(400));

    assert!((aux1.rms() - before).abs() < 0.01, "{} vs {}", aux1.rms(), before);
    assert_eq!(engine.bus(BusId::Aux1).unwrap().level, 1.0);
    assert_eq!(engine.bus(BusId::Aux2).unwrap().level, 0.4);
    // C still feeds MASTER through the new chain.
    assert!(engine.bus_tap(BusId::Master).unwrap().rms() > 0.01);
}

#[test]
fn output_route_failure_keeps_other_buses_running() {
    let mut engine = make_engine();
    let err = engine
        .set_output_device(BusId::Aux1, Some("Nonexistent"))
        .unwrap_err();
    assert!(matches!(err, MixError::DeviceRouteFailure { .. }));
    assert_eq!(engine.bus(BusId::Aux1).unwrap().route, "default");

    play(&mut engine, "C", TONE);
    engine.set_channel_fader("C", 1.0).unwrap();
    render(&mut engine, "C", Duration::from_millis(200));
    assert!(engine.bus_tap(BusId::Master).unwrap().rms() > 0.05);
}

// ── Stream sources ─────────────────────────────────────────────────────────

#[test]
fn rebind_while_loading_keeps_only_the_newest_session() {
    let connector = Scripted::new();
    let mut engine = engine_with(connector.clone());

    engine.bind_stream("C", "u1.m3u8#delay=300&value=0.9").unwrap();
    assert_eq!(state_of(&engine, "C"), Some(StreamState::Loading));
    engine.bind_stream("C", "u2.m3u8#value=0.1").unwrap();
    poll_until(&mut engine, |e| state_of(e, "C") == Some(StreamState::Playing));

    // Let the superseded connect finish and be thrown away.
    std::thread::sleep(Duration::from_millis(500));
    engine.poll().unwrap();
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    assert_eq!(connector.live.load(Ordering::SeqCst), 1);

    let ch = engine.channel("C").unwrap();
    assert_eq!(ch.url.as_deref(), Some("u2.m3u8#value=0.1"));
    assert_eq!(ch.stream_state, Some(StreamState::Playing));

    // Only u2's audio reaches the strip.
    render(&mut engine, "C", Duration::from_millis(300));
    let level = engine.channel_tap("C").unwrap().rms();
    assert!((level - 0.1).abs() < 0.01, "tap level {}", level);
}

#[test]
fn adaptive_rebind_never_reports_a_stale_bitrate() {
    let connector = Scripted::new();
    let mut engine = engine_with(connector);

    engine.bind_stream("C", "u1.m3u8#kbps=256").unwrap();
    let events = poll_until(&mut engine, |e| {
        e.channel("C").unwrap().bitrate_kbps == Some(256)
    });
    assert!(events.contains(&MixEvent::StreamState {
        channel: "C".into(),
        state: StreamState::Playing
    }));
    assert!(events.contains(&MixEvent::Bitrate {
        channel: "C".into(),
        kbps: 256
    }));

    engine.bind_stream("C", "u1.m3u8#delay=300&kbps=256").unwrap();
    assert_eq!(state_of(&engine, "C"), Some(StreamState::Loading));
    assert_eq!(engine.channel("C").unwrap().bitrate_kbps, None);
    engine.bind_stream("C", "u2.m3u8#kbps=64").unwrap();

    let mut events = poll_until(&mut engine, |e| state_of(e, "C") == Some(StreamState::Playing));
    std::thread::sleep(Duration::from_millis(500));
    events.extend(engine.poll().unwrap());

    for event in &events {
        if let MixEvent::Bitrate { kbps, .. } = event {
            assert_eq!(*kbps, 64, "stale bitrate in {:?}", events);
        }
    }
    let ch = engine.channel("C").unwrap();
    assert_eq!(ch.bitrate_kbps, Some(64));
    assert_eq!(ch.url.as_deref(), Some("u2.m3u8#kbps=64"));
}

#[test]
fn failed_channel_stays_controllable_and_recovers() {
    let mut engine = make_engine();
    engine.bind_stream("D", "tone:loud").unwrap();
    let events = poll_until(&mut engine, |e| state_of(e, "D") == Some(StreamState::Error));
    assert!(events
        .iter()
        .any(|e| matches!(e, MixEvent::StreamFailed { channel, .. } if channel == "D")));
    assert!(engine.channel("D").unwrap().last_error.is_some());

    assert_eq!(engine.set_channel_fader("D", 0.5).unwrap(), 0.5);
    engine.set_channel_eq("D", EqBand::Mid, 2.0).unwrap();

    engine.bind_stream("D", TONE).unwrap();
    poll_until(&mut engine, |e| state_of(e, "D") == Some(StreamState::Playing));
    assert!(engine.channel("D").unwrap().last_error.is_none());
}

#[test]
fn cross_origin_refusal_plays_without_analysis() {
    let mut engine = make_engine();
    engine.bind_stream("E", "tone:440?amp=0.5&cors=deny").unwrap();
    let events = poll_until(&mut engine, |e| state_of(e, "E") == Some(StreamState::Playing));
    assert!(events.contains(&MixEvent::AnalysisDegraded {
        channel: "E".into()
    }));
    assert!(engine.channel("E").unwrap().analysis_degraded);

    engine.set_channel_fader("E", 1.0).unwrap();
    render(&mut engine, "E", Duration::from_millis(300));
    assert_eq!(engine.channel_tap("E").unwrap().rms(), 0.0);
    assert!(engine.bus_tap(BusId::Master).unwrap().rms() > 0.05);
}

#[test]
fn pause_resume_and_stop() {
    let mut engine = make_engine();
    play(&mut engine, "F", TONE);
    assert!(engine.is_any_playing());

    assert_eq!(engine.toggle_play("F").unwrap(), StreamState::Paused);
    assert!(!engine.is_any_playing());
    assert!(!engine.pause_stream("F").unwrap());
    assert_eq!(engine.toggle_play("F").unwrap(), StreamState::Playing);

    engine.stop_stream("F").unwrap();
    let ch = engine.channel("F").unwrap();
    assert_eq!(ch.stream_state, Some(StreamState::Idle));
    assert_eq!(ch.url.as_deref(), Some(TONE));
    assert_eq!(engine.toggle_play("F").unwrap(), StreamState::Idle);
}

#[test]
fn refresh_all_reloads_only_active_streams() {
    let mut engine = make_engine();
    play(&mut engine, "A", TONE);
    play(&mut engine, "C", TONE);
    engine.stop_stream("C").unwrap();

    assert_eq!(engine.refresh_all().unwrap(), 1);
    assert_eq!(state_of(&engine, "A"), Some(StreamState::Loading));
    assert_eq!(state_of(&engine, "C"), Some(StreamState::Idle));
    poll_until(&mut engine, |e| state_of(e, "A") == Some(StreamState::Playing));
}

#[test]
fn reload_rebinds_the_current_url() {
    let mut engine = make_engine();
    play(&mut engine, "D", TONE);
    let start = engine.logs(0).len();

    engine.reload_stream("D").unwrap();
    assert_eq!(state_of(&engine, "D"), Some(StreamState::Loading));
    assert_eq!(engine.channel("D").unwrap().url.as_deref(), Some(TONE));
    poll_until(&mut engine, |e| state_of(e, "D") == Some(StreamState::Playing));

    let logs = engine.logs(start);
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Info && l.message.contains("reloading")));
    assert!(matches!(
        engine.reload_stream("LIVE_MIC"),
        Err(MixError::InvalidHandle(_))
    ));
}

#[test]
fn station_picker_binds_catalog_url() {
    let connector = Scripted::new();
    let mut engine = engine_with(connector);
    let stations = engine.channel("A").unwrap().stations;
    assert_eq!(stations.len(), 6);

    engine.bind_station("A", "RNE OCA 3").unwrap();
    assert!(engine.channel("A").unwrap().url.unwrap().contains("oca3"));
    poll_until(&mut engine, |e| state_of(e, "A") == Some(StreamState::Playing));
    assert!(matches!(
        engine.bind_station("A", "Nope"),
        Err(MixError::InvalidHandle(_))
    ));
}

#[test]
fn empty_url_is_a_bind_failure() {
    let mut engine = make_engine();
    assert!(matches!(
        engine.bind_stream("A", "  "),
        Err(MixError::StreamBindFailure { .. })
    ));
}

#[test]
fn on_air_follows_master_level() {
    let mut engine = make_engine();
    assert!(!engine.is_on_air());
    play(&mut engine, "C", TONE);
    engine.set_channel_fader("C", 1.0).unwrap();
    let events = render(&mut engine, "C", Duration::from_millis(600));
    assert!(events.contains(&MixEvent::OnAir { on_air: true }));
    assert!(engine.status().unwrap().on_air);

    engine.set_channel_fader("C", 0.0).unwrap();
    let events = render(&mut engine, "C", Duration::from_millis(600));
    assert!(events.contains(&MixEvent::OnAir { on_air: false }));
}

// ── Recording ──────────────────────────────────────────────────────────────

#[test]
fn three_second_wav_recording_exports() {
    let mut engine = make_engine();
    play(&mut engine, "C", TONE);
    engine.set_channel_fader("C", 0.8).unwrap();

    engine.start_recording_as(BusId::Master, ExportFormat::Wav).unwrap();
    let events = render(&mut engine, "C", Duration::from_secs(3));
    assert!(events.contains(&MixEvent::RecordingTick {
        bus: BusId::Master,
        elapsed_seconds: 2
    }));
    assert!(engine.stop_recording(BusId::Master).unwrap());

    let recorder = engine.recorder(BusId::Master).unwrap();
    assert_eq!(recorder.elapsed_seconds, 3);

    let artifact = engine
        .export_recording(BusId::Master, Some(ExportFormat::Wav))
        .unwrap();
    assert!(!artifact.bytes.is_empty());
    assert!(artifact.name.starts_with("MASTER_"));
    assert!(artifact.name.ends_with(".wav"));
    let secs = artifact.duration.as_secs_f64();
    assert!((secs - 3.0).abs() <= 1.0, "declared duration {}", secs);

    let dir = tempfile::tempdir().unwrap();
    let path = engine
        .export_recording_to(BusId::Master, Some(ExportFormat::Wav), Some(dir.path()))
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap().len(), artifact.bytes.len());
}

#[test]
fn export_defaults_to_the_format_the_session_started_with() {
    let mut engine = make_engine();
    engine.start_recording_as(BusId::Aux2, ExportFormat::Wav).unwrap();
    engine.advance(Duration::from_millis(200)).unwrap();
    engine.stop_recording(BusId::Aux2).unwrap();

    // Changing the selection afterwards only affects the next session.
    engine.set_recording_format(BusId::Aux2, ExportFormat::Mp3).unwrap();
    let artifact = engine.export_recording(BusId::Aux2, None).unwrap();
    assert_eq!(artifact.format, ExportFormat::Wav);
    assert!(artifact.name.ends_with(".wav"));
}

#[test]
fn second_start_does_not_reset_the_session() {
    let mut engine = make_engine();
    play(&mut engine, "C", TONE);
    engine.start_recording(BusId::Aux2).unwrap();
    render(&mut engine, "C", Duration::from_millis(1200));

    let before = engine.recorder(BusId::Aux2).unwrap();
    assert_eq!(before.elapsed_seconds, 1);
    assert!(before.chunk_count > 0);

    let err = engine.start_recording(BusId::Aux2).unwrap_err();
    assert!(matches!(err, MixError::AlreadyRecording(BusId::Aux2)));
    let err = engine
        .start_recording_as(BusId::Aux2, ExportFormat::Ogg)
        .unwrap_err();
    assert!(matches!(err, MixError::AlreadyRecording(BusId::Aux2)));

    let after = engine.recorder(BusId::Aux2).unwrap();
    assert_eq!(after.elapsed_seconds, before.elapsed_seconds);
    assert_eq!(after.chunk_count, before.chunk_count);
    assert_eq!(after.format, before.format);
}

#[test]
fn export_is_refused_while_recording() {
    let mut engine = make_engine();
    engine.start_recording(BusId::Master).unwrap();
    engine.advance(Duration::from_millis(100)).unwrap();
    engine.poll().unwrap();
    assert!(matches!(
        engine.export_recording(BusId::Master, Some(ExportFormat::Wav)),
        Err(MixError::RecordingExportFailure(_))
    ));
    engine.stop_recording(BusId::Master).unwrap();
    assert!(engine
        .export_recording(BusId::Master, Some(ExportFormat::Wav))
        .is_ok());

    assert!(engine.clear_recording(BusId::Master).unwrap());
    assert!(matches!(
        engine.export_recording(BusId::Master, Some(ExportFormat::Wav)),
        Err(MixError::RecordingExportFailure(_))
    ));
}

#[test]
fn buses_record_independently() {
    let mut engine = make_engine();
    engine.start_recording(BusId::Master).unwrap();
    engine.start_recording(BusId::Aux1).unwrap();
    engine.advance(Duration::from_millis(200)).unwrap();
    engine.poll().unwrap();
    engine.stop_recording(BusId::Aux1).unwrap();

    let status = engine.status().unwrap();
    assert_eq!(status.recording, vec![BusId::Master]);
    assert!(engine.recorder(BusId::Aux1).unwrap().captured_seconds > 0.1);
}

// ── Lifecycle ──────────────────────────────────────────────────────────────

#[test]
fn shutdown_stops_everything() {
    let mut engine = make_engine();
    play(&mut engine, "C", TONE);
    engine.start_recording(BusId::Master).unwrap();
    engine.shutdown().unwrap();

    assert!(matches!(engine.channels(), Err(MixError::EngineNotReady)));
    assert!(matches!(
        engine.bind_stream("C", TONE),
        Err(MixError::EngineNotReady)
    ));
    assert!(matches!(
        engine.export_recording(BusId::Master, None),
        Err(MixError::EngineNotReady)
    ));
    assert!(!engine.logs(0).is_empty());
}

#[test]
fn logs_record_operations() {
    let mut engine = make_engine();
    let start = engine.logs(0).len();
    play(&mut engine, "C", TONE);
    let logs = engine.logs(start);
    assert!(logs.iter().any(|l| l.message.contains("loading")));
    assert!(logs.iter().all(|l| l.timestamp.len() == 8));
}
