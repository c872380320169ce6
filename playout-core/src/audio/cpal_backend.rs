//! cpal output backend.
//!
//! ## Threading
//!
//! ```text
//! CpalBackend::open()
//!     └─► spawn "playout-cpal" worker ──► build_output_stream(render → engine)
//!             ▲                            │
//!             │ Command (crossbeam)        └─► oneshot: Ok(StreamInfo) / Err
//!         CpalStream (Send handle)
//! ```
//!
//! `cpal::Stream` never leaves the worker thread. The handle talks to it
//! over a command channel and waits for each reply, so `close()` returning
//! means the stream has been dropped and no further callback can run.
//!
//! cpal exposes no total-buffer knob: `BufferSize::Fixed` is the callback
//! period, so a resize moves `frames_per_burst` as well.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, Device, SampleRate, Stream, StreamConfig, SupportedBufferSize,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info, warn};

use super::{OutputBackend, OutputStream, PerformanceMode, SharingMode, StreamRequest};
use crate::{
    engine::CallbackEngine,
    error::{PlayoutError, Result},
};

/// Burst requested in low-latency mode when the device allows it.
const LOW_LATENCY_BURST: u32 = 256;

/// Burst assumed when the device does not report its buffer range.
const FALLBACK_BURST: u32 = 512;

#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open(
        &self,
        request: &StreamRequest,
        engine: Arc<CallbackEngine>,
    ) -> Result<Box<dyn OutputStream>> {
        let request = request.clone();
        let (cmd_tx, cmd_rx) = bounded::<Command>(8);
        let (open_tx, open_rx) = bounded::<Result<StreamInfo>>(1);

        let worker = thread::Builder::new()
            .name("playout-cpal".into())
            .spawn(move || worker_main(request, engine, cmd_rx, open_tx))?;

        match open_rx.recv() {
            Ok(Ok(info)) => Ok(Box::new(CpalStream {
                cmd_tx,
                info,
                worker: Some(worker),
            })),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(PlayoutError::StreamOpen(
                    "cpal worker exited before reporting".into(),
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StreamInfo {
    sample_rate: u32,
    channels: usize,
    burst_frames: usize,
    buffer_frames: usize,
    min_buffer: u32,
    max_buffer: u32,
}

enum Command {
    Play(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
    Resize(u32, Sender<Result<usize>>),
    Close(Sender<Result<()>>),
}

fn worker_main(
    request: StreamRequest,
    engine: Arc<CallbackEngine>,
    cmd_rx: Receiver<Command>,
    open_tx: Sender<Result<StreamInfo>>,
) {
    let opened = select_device(&request).and_then(|device| {
        let (config, info) = negotiate(&device, &request)?;
        let stream = build(&device, &config, &engine)?;
        Ok((device, config, stream, info))
    });

    let (device, mut config, mut stream, mut info) = match opened {
        Ok(parts) => parts,
        Err(e) => {
            let _ = open_tx.send(Err(e));
            return;
        }
    };
    engine.set_sample_rate(info.sample_rate);
    let _ = open_tx.send(Ok(info));

    let mut playing = false;
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            Command::Play(reply) => {
                let result = stream.play().map_err(|e| PlayoutError::Backend(e.to_string()));
                playing = result.is_ok();
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                playing = false;
                let result = stream.pause().map_err(|e| PlayoutError::Backend(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Resize(frames, reply) => {
                let granted = frames.clamp(info.min_buffer, info.max_buffer);
                config.buffer_size = BufferSize::Fixed(granted);
                // Two live streams would mean two consumers on one ring.
                if playing {
                    let _ = stream.pause();
                }
                let rebuilt = build(&device, &config, &engine).and_then(|fresh| {
                    if playing {
                        fresh
                            .play()
                            .map_err(|e| PlayoutError::Backend(e.to_string()))?;
                    }
                    Ok(fresh)
                });
                match rebuilt {
                    Ok(fresh) => {
                        stream = fresh;
                        info.burst_frames = granted as usize;
                        info.buffer_frames = granted as usize;
                        info!(frames = granted, "cpal buffer size changed");
                        let _ = reply.send(Ok(granted as usize));
                    }
                    Err(e) => {
                        warn!("cpal buffer resize failed: {e}");
                        if playing && stream.play().is_err() {
                            playing = false;
                        }
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Close(reply) => {
                drop(stream);
                let _ = reply.send(Ok(()));
                return;
            }
        }
    }
    // Handle dropped without close(): stream is released here.
}

fn select_device(request: &StreamRequest) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(preferred) = request.device.as_deref() {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("preferred output device '{}' not found, falling back", preferred);
            }
            Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
        }
    }

    host.default_output_device()
        .ok_or(PlayoutError::NoOutputDevice)
}

fn negotiate(device: &Device, request: &StreamRequest) -> Result<(StreamConfig, StreamInfo)> {
    let channels = u16::try_from(request.channels)
        .map_err(|_| PlayoutError::UnsupportedFormat(format!("{} channels", request.channels)))?;
    let rate = SampleRate(request.sample_rate);

    let supported = device
        .supported_output_configs()
        .map_err(|e| PlayoutError::StreamOpen(e.to_string()))?
        .find(|c| {
            c.channels() == channels
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= rate
                && rate <= c.max_sample_rate()
        })
        .ok_or_else(|| {
            PlayoutError::UnsupportedFormat(format!(
                "f32 x{} @ {} Hz",
                request.channels, request.sample_rate
            ))
        })?
        .with_sample_rate(rate);

    let (min_buffer, max_buffer) = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } => (*min, *max),
        SupportedBufferSize::Unknown => (FALLBACK_BURST, FALLBACK_BURST),
    };

    let (buffer_size, burst) = match request.performance {
        PerformanceMode::LowLatency => {
            let burst = LOW_LATENCY_BURST.clamp(min_buffer, max_buffer);
            (BufferSize::Fixed(burst), burst)
        }
        PerformanceMode::Default => (BufferSize::Default, FALLBACK_BURST),
    };

    if request.sharing == SharingMode::Exclusive {
        info!("cpal has no exclusive mode, opening shared");
    }
    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate = request.sample_rate,
        channels,
        burst,
        "opening output stream"
    );

    let config = StreamConfig {
        channels,
        sample_rate: rate,
        buffer_size,
    };
    let info = StreamInfo {
        sample_rate: request.sample_rate,
        channels: request.channels,
        burst_frames: burst as usize,
        buffer_frames: burst as usize,
        min_buffer,
        max_buffer,
    };
    Ok((config, info))
}

fn build(device: &Device, config: &StreamConfig, engine: &Arc<CallbackEngine>) -> Result<Stream> {
    let engine = Arc::clone(engine);
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                engine.on_audio_ready(data);
            },
            |err| error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| PlayoutError::StreamOpen(e.to_string()))
}

/// `Send` handle to a stream living on its worker thread.
pub struct CpalStream {
    cmd_tx: Sender<Command>,
    info: StreamInfo,
    worker: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn request<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| PlayoutError::Backend("cpal worker has exited".into()))?;
        reply_rx
            .recv()
            .map_err(|_| PlayoutError::Backend("cpal worker dropped the reply".into()))?
    }
}

impl OutputStream for CpalStream {
    fn start(&mut self) -> Result<()> {
        self.request(Command::Play)
    }

    fn stop(&mut self) -> Result<()> {
        self.request(Command::Pause)
    }

    fn close(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = self.request(Command::Close);
        if worker.join().is_err() {
            return Err(PlayoutError::Backend("cpal worker panicked".into()));
        }
        result
    }

    fn frames_per_burst(&self) -> usize {
        self.info.burst_frames
    }

    fn buffer_size_frames(&self) -> usize {
        self.info.buffer_frames
    }

    fn set_buffer_size_frames(&mut self, frames: usize) -> Result<usize> {
        let frames = u32::try_from(frames).unwrap_or(u32::MAX);
        let granted = self.request(|reply| Command::Resize(frames, reply))?;
        self.info.burst_frames = granted;
        self.info.buffer_frames = granted;
        Ok(granted)
    }

    /// `BufferSize::Fixed` is the frames per callback.
    fn buffer_is_burst(&self) -> bool {
        true
    }

    fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    fn channels(&self) -> usize {
        self.info.channels
    }

    fn sharing(&self) -> SharingMode {
        SharingMode::Shared
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing cpal stream on drop failed: {e}");
        }
    }
}
