use thiserror::Error;

/// Errors from standard MIDI file reading and writing.
///
/// Streaming parse problems are not errors: malformed stream events are
/// skipped and the stream continues. A malformed file fails the whole
/// load with one of these.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("not a standard MIDI file: expected 'MThd' chunk")]
    BadHeaderTag,
    #[error("unsupported MThd length {0}, expected 6")]
    BadHeaderLength(u32),
    #[error("unsupported file format {0}")]
    BadFormat(u16),
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("variable-length quantity exceeds 4 bytes")]
    VlqTooLong,
    #[error("track event {0:#04x} with no running status")]
    OrphanedTrackData(u8),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
