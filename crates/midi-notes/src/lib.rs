//! Note data for Standard MIDI Files.
//!
//! Decodes SMF bytes into typed message tracks, rebuilds absolute-time notes
//! from them and summarizes the file (tempo, meter, length).

pub mod message;
pub mod note;
pub mod reconstruct;
pub mod summary;
pub mod writer;

pub use message::{decode, DecodedFile, Message, MessageKind, Track};
pub use note::{NoteEvent, NoteTrack, ParsedFile, TimeSignature, DEFAULT_TEMPO};
pub use reconstruct::{reconstruct, reconstruct_track, MetaState, Reconstruction};
pub use summary::{bpm, summarize, total_duration};
pub use writer::{sample_file, sample_scale, write_smf};

/// Errors from MIDI decoding and encoding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("MIDI parse error: {0}")]
    Parse(String),

    #[error("MIDI header declares a tick resolution of 0")]
    InvalidResolution,

    #[error("cannot encode MIDI message: {0}")]
    Unencodable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decode, reconstruct and summarize one file.
///
/// Pure function of its inputs: the same bytes always give the same result.
pub fn parse_midi(filename: &str, bytes: &[u8]) -> Result<ParsedFile> {
    let decoded = decode(bytes)?;
    let reconstruction = reconstruct(&decoded);
    Ok(summarize(filename, &decoded, reconstruction))
}
