//! Audio subsystem: inbound queues, platform output and the playback loop

pub mod buffer;
pub mod channel;
pub mod device;
pub mod playback;
pub mod sink;

pub use buffer::SampleRing;
pub use channel::{audio_channels, AudioItem, AudioReceivers, AudioSenders};
pub use device::{find_output_device, list_output_devices, AudioDevice, OutputDeviceInfo};
pub use playback::{Concealment, PlaybackMultiplexer, PlaybackState};
pub use sink::{jitter_buffer_frames, AudioSink, CpalSink};
