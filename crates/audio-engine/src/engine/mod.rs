//! The streaming engine: three stage threads joined by event queues.
//!
//! - `ap_input` reads a byte source through a demuxer and emits compressed packets
//! - `ap_decoder` turns them into PCM packets
//! - `ap_output` paces PCM into the output device and reports position
//!
//! Commands enter at the front of the input or output queue; everything a stage emits travels
//! downstream at the back, so data never overtakes the `Configure` that describes it.

mod decoder;
mod input;
mod output;
mod thread;

use std::sync::Arc;

use anyhow::Result;
use crossbeam_channel::Receiver;

use crate::config::EngineConfig;
use crate::decode::DecoderRegistry;
use crate::event::{Event, Notification};
use crate::output::DeviceFactory;
use crate::packet::PacketPool;
use crate::queue::{EventQueue, Post};
use crate::source::SourceRegistry;

pub use thread::{EngineThread, Notifier};

use decoder::DecoderStage;
use input::InputStage;
use output::OutputStage;

/// Pluggable pieces the stages look up by URL scheme, codec and device kind.
#[derive(Clone)]
pub struct Plugins {
    pub sources: SourceRegistry,
    pub decoders: DecoderRegistry,
    pub devices: DeviceFactory,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            sources: SourceRegistry::new(),
            decoders: DecoderRegistry::with_defaults(),
            devices: DeviceFactory::with_defaults(),
        }
    }
}

pub struct AudioEngine {
    input: EngineThread,
    decoder: EngineThread,
    output: EngineThread,
    notifications: Receiver<Notification>,
    stopped: bool,
}

impl AudioEngine {
    /// Start the engine with the built-in sources, decoders and devices.
    pub fn init(config: EngineConfig) -> Result<Self> {
        Self::init_with(config, Plugins::default())
    }

    pub fn init_with(config: EngineConfig, plugins: Plugins) -> Result<Self> {
        config.validate()?;
        let (tx, notifications) = crossbeam_channel::unbounded();
        let notify = Notifier::new(tx);

        let input_fifo = Arc::new(EventQueue::new());
        let decoder_fifo = Arc::new(EventQueue::new());
        let output_fifo = Arc::new(EventQueue::new());

        let input_pool = PacketPool::new(config.input_pool.capacity, config.input_pool.packets);
        let decoder_pool = PacketPool::new(config.decoder_pool.capacity, config.decoder_pool.packets);
        tracing::debug!(
            input_packets = config.input_pool.packets,
            decoder_packets = config.decoder_pool.packets,
            device = ?config.output.device,
            "starting engine"
        );

        let output = {
            let (fifo, input, notify, cfg) =
                (output_fifo.clone(), input_fifo.clone(), notify.clone(), config.clone());
            let devices = plugins.devices;
            EngineThread::spawn("ap_output", output_fifo.clone(), move || {
                OutputStage::new(fifo, input, devices, &cfg, notify).run()
            })?
        };

        let decoder = {
            let (fifo, input, out, notify) =
                (decoder_fifo.clone(), input_fifo.clone(), output_fifo.clone(), notify.clone());
            let registry = plugins.decoders;
            EngineThread::spawn("ap_decoder", decoder_fifo.clone(), move || {
                DecoderStage::new(fifo, input, out, decoder_pool, registry, notify).run()
            })?
        };

        let input = {
            let (fifo, dec) = (input_fifo.clone(), decoder_fifo.clone());
            let sources = plugins.sources;
            EngineThread::spawn("ap_input", input_fifo, move || {
                InputStage::new(fifo, dec, input_pool, sources, notify).run()
            })?
        };

        Ok(Self {
            input,
            decoder,
            output,
            notifications,
            stopped: false,
        })
    }

    /// Send a command. Device commands go to the output stage, the rest to the input stage.
    pub fn post(&self, event: Event) {
        if self.stopped {
            return;
        }
        let kind = event.kind();
        if kind.targets_output() {
            self.output.post(event, Post::Front);
        } else {
            self.input.post(event, Post::Front);
        }
    }

    /// Receiving side of the notification channel. Clones share one stream of notifications.
    pub fn notifications(&self) -> Receiver<Notification> {
        self.notifications.clone()
    }

    /// Stop all stages and wait for them. Returns `false` if a stage thread panicked.
    pub fn exit(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        if self.stopped {
            return true;
        }
        self.stopped = true;
        tracing::debug!("stopping engine");

        // Quit travels input -> decoder -> output; a dead stage cannot pass it on.
        self.input.post(Event::Quit, Post::Flush);
        let mut clean = self.input.join();
        if !clean {
            self.decoder.post(Event::Quit, Post::Flush);
        }
        let decoder_ok = self.decoder.join();
        if !decoder_ok {
            self.output.post(Event::Quit, Post::Flush);
        }
        clean &= decoder_ok;
        clean &= self.output.join();
        clean
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceKind;
    use crate::event::EngineState;
    use std::time::Duration;

    fn null_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.output.device = DeviceKind::Null;
        config
    }

    #[test]
    fn commands_reach_their_stage() {
        let engine = AudioEngine::init(null_config()).unwrap();
        let rx = engine.notifications();
        engine.post(Event::Pause);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Notification::State(EngineState::Pausing)
        );
        engine.post(Event::Open("/nonexistent/a.ogg".into()));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Notification::Error(_)
        ));
        assert!(engine.exit());
    }

    #[test]
    fn single_packet_pool_is_refused() {
        let mut config = null_config();
        config.input_pool.packets = 1;
        let Err(err) = AudioEngine::init(config) else {
            panic!("engine started with a one-packet input pool");
        };
        assert!(err.to_string().contains("input_pool.packets"), "{err}");
    }

    #[test]
    fn drop_stops_threads() {
        let engine = AudioEngine::init(null_config()).unwrap();
        let rx = engine.notifications();
        drop(engine);
        assert!(rx.try_recv().is_err());
    }
}
