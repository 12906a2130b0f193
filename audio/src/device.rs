//! Audio capture and playback devices with listener fan-out.
//!
//! Both device variants share a registration protocol: listeners are added
//! as trait objects and dispatched in registration order from the backend's
//! realtime callback. Listeners must not block, allocate unboundedly, or
//! perform network I/O; the intended consumers touch only a lock-bounded
//! byte queue or a non-blocking channel send.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Handle returned by `add_listener`, used to remove the listener again.
pub type ListenerId = u64;

/// Fills the playback output buffer (f32 interleaved, device rate).
pub trait PlaybackSource: Send + Sync {
    fn fill(&self, output: &mut [f32]);
}

/// Consumes captured input (i16 mono at the device rate).
pub trait CaptureSink: Send + Sync {
    fn capture(&self, input: &[i16]);
}

/// Ordered listener registry shared with the realtime callback.
struct ListenerSet<T: ?Sized> {
    next_id: ListenerId,
    entries: Vec<(ListenerId, Arc<T>)>,
}

impl<T: ?Sized> ListenerSet<T> {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, listener: Arc<T>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(lid, _)| *lid != id);
        self.entries.len() != before
    }
}

/// Playback device configuration.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_per_buffer: u32,
}

/// Capture device configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_per_buffer: u32,
    /// When the device is multi-channel, forward only this channel as mono.
    pub channel_index: Option<u16>,
}

/// Output device. The realtime callback zero-fills the buffer, then hands
/// it to every registered `PlaybackSource` in registration order.
pub struct PlaybackDevice {
    config: PlaybackConfig,
    listeners: Arc<Mutex<ListenerSet<dyn PlaybackSource>>>,
    stream: Option<cpal::Stream>,
}

impl PlaybackDevice {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(Mutex::new(ListenerSet::new())),
            stream: None,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PlaybackSource>) -> ListenerId {
        self.listeners.lock().unwrap().add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().unwrap().remove(id)
    }

    /// Opens the default output device and starts the stream.
    /// Opening an already-open device fails with `AlreadyOpen`.
    pub fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(Error::NoDevice)?;
        info!(
            device = %device.name().unwrap_or_default(),
            rate = self.config.sample_rate,
            channels = self.config.channels,
            "opening playback device"
        );

        let listeners = Arc::clone(&self.listeners);
        let data_cb = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            data.fill(0.0);
            let set = listeners.lock().unwrap();
            for (_, listener) in &set.entries {
                listener.fill(data);
            }
        };

        let requested = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.config.frames_per_buffer),
        };
        let stream = match device.build_output_stream(&requested, data_cb.clone(), stream_err, None)
        {
            Ok(s) => s,
            Err(e) => {
                warn!(%e, "fixed buffer size rejected; retrying with backend default");
                let fallback = cpal::StreamConfig {
                    buffer_size: cpal::BufferSize::Default,
                    ..requested
                };
                device
                    .build_output_stream(&fallback, data_cb, stream_err, None)
                    .map_err(|e| Error::Backend(e.to_string()))?
            }
        };
        stream.play().map_err(|e| Error::Backend(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Stops the stream and releases the device.
    pub fn close(&mut self) {
        self.stream = None;
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Input device. Captured i16 PCM is dispatched to every registered
/// `CaptureSink` in registration order; multi-channel input is reduced to
/// the configured channel first.
pub struct CaptureDevice {
    config: CaptureConfig,
    listeners: Arc<Mutex<ListenerSet<dyn CaptureSink>>>,
    stream: Option<cpal::Stream>,
}

impl CaptureDevice {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(Mutex::new(ListenerSet::new())),
            stream: None,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CaptureSink>) -> ListenerId {
        self.listeners.lock().unwrap().add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().unwrap().remove(id)
    }

    /// Opens the default input device and starts the stream.
    /// Opening an already-open device fails with `AlreadyOpen`.
    pub fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(Error::NoDevice)?;
        info!(
            device = %device.name().unwrap_or_default(),
            rate = self.config.sample_rate,
            channels = self.config.channels,
            "opening capture device"
        );

        let requested = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.config.frames_per_buffer),
        };

        let listeners = Arc::clone(&self.listeners);
        let channels = self.config.channels;
        let channel_index = self.config.channel_index;
        let i16_cb = move |data: &[i16], _: &cpal::InputCallbackInfo| {
            dispatch_capture(&listeners, channels, channel_index, data);
        };

        let stream = match device.build_input_stream(&requested, i16_cb.clone(), stream_err, None) {
            Ok(s) => s,
            Err(e) => {
                warn!(%e, "i16 stream with fixed buffer rejected; falling back");
                let fallback = cpal::StreamConfig {
                    buffer_size: cpal::BufferSize::Default,
                    ..requested
                };
                match device.build_input_stream(&fallback, i16_cb, stream_err, None) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%e, "i16 capture unsupported; converting from f32");
                        let listeners = Arc::clone(&self.listeners);
                        let f32_cb = move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            let pcm: Vec<i16> = data
                                .iter()
                                .map(|s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
                                .collect();
                            dispatch_capture(&listeners, channels, channel_index, &pcm);
                        };
                        device
                            .build_input_stream(&fallback, f32_cb, stream_err, None)
                            .map_err(|e| Error::Backend(e.to_string()))?
                    }
                }
            }
        };
        stream.play().map_err(|e| Error::Backend(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Stops the stream and releases the device.
    pub fn close(&mut self) {
        self.stream = None;
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

fn stream_err(err: cpal::StreamError) {
    error!(%err, "audio stream error");
}

/// Reduces interleaved multi-channel input to the selected channel and
/// fans the result out to every registered sink.
fn dispatch_capture(
    listeners: &Arc<Mutex<ListenerSet<dyn CaptureSink>>>,
    channels: u16,
    channel_index: Option<u16>,
    data: &[i16],
) {
    let set = listeners.lock().unwrap();
    if set.entries.is_empty() {
        return;
    }
    if channels > 1 {
        let n = channels as usize;
        let ch = (channel_index.unwrap_or(0) as usize).min(n - 1);
        let mono: Vec<i16> = data.chunks_exact(n).map(|frame| frame[ch]).collect();
        for (_, listener) in &set.entries {
            listener.capture(&mono);
        }
    } else {
        for (_, listener) in &set.entries {
            listener.capture(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        tag: i16,
        seen: Mutex<Vec<Vec<i16>>>,
        order: Arc<Mutex<Vec<i16>>>,
    }

    impl CaptureSink for Recorder {
        fn capture(&self, input: &[i16]) {
            self.seen.lock().unwrap().push(input.to_vec());
            self.order.lock().unwrap().push(self.tag);
        }
    }

    fn recorder(tag: i16, order: &Arc<Mutex<Vec<i16>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            tag,
            seen: Mutex::new(Vec::new()),
            order: Arc::clone(order),
        })
    }

    #[test]
    fn test_dispatch_registration_order() {
        let listeners: Arc<Mutex<ListenerSet<dyn CaptureSink>>> =
            Arc::new(Mutex::new(ListenerSet::new()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(1, &order);
        let b = recorder(2, &order);
        listeners.lock().unwrap().add(a.clone());
        listeners.lock().unwrap().add(b.clone());

        dispatch_capture(&listeners, 1, None, &[10, 20]);

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(a.seen.lock().unwrap()[0], vec![10, 20]);
        assert_eq!(b.seen.lock().unwrap()[0], vec![10, 20]);
    }

    #[test]
    fn test_dispatch_channel_extraction() {
        let listeners: Arc<Mutex<ListenerSet<dyn CaptureSink>>> =
            Arc::new(Mutex::new(ListenerSet::new()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(1, &order);
        listeners.lock().unwrap().add(a.clone());

        // 4-channel interleaved frames; extract channel 3.
        let data = [
            11, 12, 13, 14, //
            21, 22, 23, 24, //
        ];
        dispatch_capture(&listeners, 4, Some(3), &data);

        assert_eq!(a.seen.lock().unwrap()[0], vec![14, 24]);
    }

    #[test]
    fn test_remove_listener() {
        let listeners: Arc<Mutex<ListenerSet<dyn CaptureSink>>> =
            Arc::new(Mutex::new(ListenerSet::new()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(1, &order);
        let b = recorder(2, &order);
        let id_a = listeners.lock().unwrap().add(a.clone());
        listeners.lock().unwrap().add(b.clone());

        assert!(listeners.lock().unwrap().remove(id_a));
        assert!(!listeners.lock().unwrap().remove(id_a));

        dispatch_capture(&listeners, 1, None, &[1]);
        assert_eq!(*order.lock().unwrap(), vec![2]);
        assert!(a.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_open_twice_fails() {
        // Exercised without hardware: a second open must fail fast once a
        // stream slot is occupied.
        let mut dev = PlaybackDevice::new(PlaybackConfig {
            sample_rate: 8000,
            channels: 1,
            frames_per_buffer: 320,
        });
        if dev.open().is_ok() {
            assert!(matches!(dev.open(), Err(Error::AlreadyOpen)));
            dev.close();
        }
    }
}
