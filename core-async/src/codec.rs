//! Frame codecs.
//!
//! The peer protocol frames every message with a length prefix. Re-exporting
//! the codec here keeps `tokio-util` an implementation detail of this crate.

pub use tokio_util::codec::{
    Framed, FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError,
};

/// Largest frame the protocol will accept (16 MiB).
///
/// An index for a large library is the biggest message exchanged; anything
/// beyond this is treated as a corrupt stream.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Builds the length-delimited codec used for protocol control streams.
pub fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}
