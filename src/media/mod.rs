//! Voice media plane: the UDP audio transport and the audio backends.

pub mod headless;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod transport;

pub use headless::{DiscardPlayback, HeadlessBackend, MuLawCodec, SilentCapture};
#[cfg(feature = "native-audio")]
pub use native::{CpalBackend, CpalCapture, CpalPlayback, OpusCodec};
pub use transport::{
    AudioTransport, AudioTransportConfig, MediaError, MediaEvent, MediaStats, TransportParams,
};
