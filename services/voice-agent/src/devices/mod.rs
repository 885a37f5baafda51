//! Audio backends for the session's capture and playback seams.

#[cfg(feature = "native-audio")]
pub mod native;
pub mod wav;

#[cfg(feature = "native-audio")]
pub use native::{MicCapture, SpeakerSink};
pub use wav::{WavDirSink, WavFileCapture};
