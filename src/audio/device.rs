//! Audio device wiring
//!
//! Opens the default input and output devices with the engine's fixed
//! configuration. cpal has no duplex stream, so the input callback pushes
//! into a ring and the output callback, which drives the ticks, pops one
//! tick of input before each call to [`AudioProcessor::process`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapRb,
};

use super::processor::AudioProcessor;
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Ticks of input the device ring can hold before dropping
const INPUT_RING_TICKS: usize = 8;

/// Running input/output streams. Dropping it stops audio I/O.
pub struct AudioDevice {
    /// Held only to keep the input stream running
    _input_stream: Option<cpal::Stream>,
    /// Held only to keep the output stream running
    _output_stream: cpal::Stream,
    /// Name of the output device in use
    pub output_name: String,
    /// Name of the input device, `None` when recording silence
    pub input_name: Option<String>,
}

impl AudioDevice {
    /// Open the default devices and start driving `processor`.
    ///
    /// `on_error` is called from the stream error callbacks.
    pub fn open<E>(
        config: &EngineConfig,
        mut processor: AudioProcessor,
        on_error: E,
    ) -> Result<Self, EngineError>
    where
        E: Fn(String) + Send + Clone + 'static,
    {
        let host = cpal::default_host();
        let output_device = host
            .default_output_device()
            .ok_or_else(|| EngineError::Device("No output device available".to_string()))?;
        let output_name = output_device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using output device: {}", output_name);

        let stream_config = cpal::StreamConfig {
            channels: config.channel_count,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: if config.low_latency {
                cpal::BufferSize::Fixed(config.buffer_size)
            } else {
                cpal::BufferSize::Default
            },
        };
        log::info!("Audio config: {:?}", stream_config);

        let channels = config.channel_count as usize;
        let tick_samples = config.frames_per_tick() * channels;
        let rb = HeapRb::<f32>::new(tick_samples * INPUT_RING_TICKS);
        let (mut input_prod, mut input_cons) = rb.split();

        let (input_stream, input_name) = match host.default_input_device() {
            Some(device) => {
                let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                log::info!("Using input device: {}", name);
                let on_error = on_error.clone();
                let stream = device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            // Overflow drops input
                            let _ = input_prod.push_slice(data);
                        },
                        move |err| {
                            log::error!("Audio input error: {}", err);
                            on_error(err.to_string());
                        },
                        None,
                    )
                    .map_err(|e| EngineError::Device(e.to_string()))?;
                (Some(stream), Some(name))
            }
            None => {
                log::warn!("No input device, recordings will be silent");
                (None, None)
            }
        };

        let mut input = vec![0.0f32; tick_samples];
        let output_stream = output_device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for chunk in data.chunks_mut(tick_samples) {
                        let want = chunk.len();
                        let got = input_cons.pop_slice(&mut input[..want]);
                        input[got..want].fill(0.0);
                        processor.process(&input[..want], chunk);
                    }
                },
                move |err| {
                    log::error!("Audio output error: {}", err);
                    on_error(err.to_string());
                },
                None,
            )
            .map_err(|e| EngineError::Device(e.to_string()))?;

        if let Some(stream) = &input_stream {
            stream.play().map_err(|e| EngineError::Device(e.to_string()))?;
        }
        output_stream
            .play()
            .map_err(|e| EngineError::Device(e.to_string()))?;
        log::info!("Audio I/O started");

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
            output_name,
            input_name,
        })
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        log::info!("Audio I/O stopped");
    }
}
