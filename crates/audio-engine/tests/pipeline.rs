mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use audio_engine::config::{DeviceKind, EngineConfig};
use audio_engine::decode::{Decoder, DecoderContext, DecoderRegistry, DecoderStatus};
use audio_engine::engine::{AudioEngine, Plugins};
use audio_engine::error::DecodeError;
use audio_engine::event::{ConfigureEvent, EngineState, Event, Notification};
use audio_engine::format::{AudioFormat, Codec, sample};
use audio_engine::packet::Packet;
use crossbeam_channel::Receiver;

use common::{DeviceLog, MkvBlock, MkvCluster, MkvTrack, matroska, memory_sources, recording_devices};

/// Two clusters of 8 kHz mono S16. Every sample has two equal bytes, so byte order does not
/// matter when comparing what the device received.
fn pcm_file() -> (Vec<u8>, Vec<u8>) {
    let blocks: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i + 1; 160]).collect();
    let clusters = vec![
        MkvCluster {
            timecode: 0,
            blocks: blocks[..3]
                .iter()
                .enumerate()
                .map(|(i, b)| MkvBlock {
                    track: 1,
                    relative: i as i16 * 10,
                    flags: 0x80,
                    payload: b.clone(),
                })
                .collect(),
        },
        MkvCluster {
            timecode: 30,
            blocks: blocks[3..]
                .iter()
                .enumerate()
                .map(|(i, b)| MkvBlock {
                    track: 1,
                    relative: i as i16 * 10,
                    flags: 0x80,
                    payload: b.clone(),
                })
                .collect(),
        },
    ];
    let file = matroska(&[MkvTrack::pcm(1, 8_000.0, 1)], &clusters, Some(60.0), None);
    (file, blocks.concat())
}

fn engine(decoders: DecoderRegistry) -> (AudioEngine, Arc<Mutex<DeviceLog>>) {
    let log = Arc::new(Mutex::new(DeviceLog::default()));
    let (file, _) = pcm_file();
    let plugins = Plugins {
        sources: memory_sources(vec![("tone.mka", file)]),
        decoders,
        devices: recording_devices(log.clone()),
    };
    let mut config = EngineConfig::default();
    config.output.device = DeviceKind::Null;
    (AudioEngine::init_with(config, plugins).unwrap(), log)
}

/// Collect notifications until `done` has seen everything it wants, or the deadline passes.
fn collect_until(rx: &Receiver<Notification>, mut done: impl FnMut(&[Notification]) -> bool) -> Vec<Notification> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while !done(&seen) {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(n) => seen.push(n),
            Err(_) => break,
        }
    }
    seen
}

fn has(seen: &[Notification], n: &Notification) -> bool {
    seen.contains(n)
}

#[test]
fn pcm_file_plays_through_to_ready() {
    let (engine, log) = engine(DecoderRegistry::with_defaults());
    let rx = engine.notifications();
    engine.post(Event::Open("mem://tone.mka".into()));

    let ready = Notification::State(EngineState::Ready);
    let seen = collect_until(&rx, |s| has(s, &ready) && has(s, &Notification::Eos));
    assert!(engine.exit());

    assert_eq!(seen.first(), Some(&Notification::State(EngineState::Playing)));
    assert!(has(&seen, &Notification::Bos));
    assert!(has(&seen, &Notification::Eos), "notifications: {seen:?}");
    assert!(has(&seen, &ready), "notifications: {seen:?}");
    assert!(!seen.iter().any(|n| matches!(n, Notification::Error(_))));
    let times: Vec<_> = seen.iter().filter(|n| matches!(n, Notification::Time { .. })).collect();
    assert!(!times.is_empty());

    let log = log.lock().unwrap();
    let (_, pcm) = pcm_file();
    assert_eq!(log.bytes, pcm);
    assert_eq!(log.opens, 1);
    assert_eq!(log.configures, vec![AudioFormat::new(sample::S16, 8_000, 1)]);
    assert_eq!(log.closes, 1);
}

#[test]
fn pause_holds_the_drain_until_resumed() {
    let (engine, log) = engine(DecoderRegistry::with_defaults());
    let rx = engine.notifications();
    engine.post(Event::Pause);
    engine.post(Event::Open("mem://tone.mka".into()));

    let (_, pcm) = pcm_file();
    let deadline = Instant::now() + Duration::from_secs(5);
    while log.lock().unwrap().bytes.len() < pcm.len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(100));
    let paused: Vec<Notification> = rx.try_iter().collect();
    assert_eq!(paused.first(), Some(&Notification::State(EngineState::Pausing)));
    assert!(!has(&paused, &Notification::State(EngineState::Ready)));
    assert!(!has(&paused, &Notification::State(EngineState::Playing)));

    engine.post(Event::Pause);
    let ready = Notification::State(EngineState::Ready);
    let resumed = collect_until(&rx, |s| has(s, &ready));
    assert_eq!(resumed.first(), Some(&Notification::State(EngineState::Playing)));
    assert_eq!(resumed.last(), Some(&ready));
    assert!(engine.exit());
}

struct Broken;

impl Decoder for Broken {
    fn codec(&self) -> Codec {
        Codec::Pcm
    }

    fn init(&mut self, _cfg: &mut ConfigureEvent) -> bool {
        true
    }

    fn process(&mut self, _ctx: &DecoderContext<'_>, _packet: Packet) -> DecoderStatus {
        DecoderStatus::Error(DecodeError::Corrupt("bad frame".into()))
    }

    fn resume(&mut self, _ctx: &DecoderContext<'_>) -> DecoderStatus {
        DecoderStatus::Ok
    }

    fn has_pending(&self) -> bool {
        false
    }

    fn flush(&mut self, _offset: i64) {}
}

#[test]
fn decoder_failure_reports_once_and_stops_the_stream() {
    let mut decoders = DecoderRegistry::new();
    decoders.register(Codec::Pcm, Arc::new(|_: Codec| -> Box<dyn Decoder> { Box::new(Broken) }));
    let (engine, log) = engine(decoders);
    let rx = engine.notifications();
    engine.post(Event::Open("mem://tone.mka".into()));

    let ready = Notification::State(EngineState::Ready);
    let mut seen = collect_until(&rx, |s| has(s, &ready));
    // Anything still in flight settles well within this.
    std::thread::sleep(Duration::from_millis(200));
    seen.extend(rx.try_iter());
    assert!(engine.exit());

    let errors: Vec<&Notification> = seen.iter().filter(|n| matches!(n, Notification::Error(_))).collect();
    assert_eq!(
        errors,
        vec![&Notification::Error("Fatal decoder error: corrupt stream: bad frame".into())]
    );
    assert!(log.lock().unwrap().bytes.is_empty());
}

#[test]
fn missing_file_reports_and_engine_stays_usable() {
    let (engine, _log) = engine(DecoderRegistry::with_defaults());
    let rx = engine.notifications();
    engine.post(Event::Open("mem://absent.mka".into()));
    let seen = collect_until(&rx, |s| !s.is_empty());
    assert_eq!(seen, vec![Notification::Error("Unable to open mem://absent.mka.".into())]);

    engine.post(Event::Open("mem://tone.mka".into()));
    let ready = Notification::State(EngineState::Ready);
    let seen = collect_until(&rx, |s| has(s, &ready));
    assert!(has(&seen, &ready));
    assert!(engine.exit());
}
