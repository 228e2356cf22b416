//! File-level figures derived from reconstructed tracks.

use crate::message::DecodedFile;
use crate::note::{round_to, NoteTrack, ParsedFile};
use crate::reconstruct::Reconstruction;

/// Beats per minute for a tempo in microseconds per beat, to 2 places.
pub fn bpm(microseconds_per_beat: u32) -> f64 {
    round_to(60_000_000.0 / microseconds_per_beat as f64, 2)
}

/// Latest note end over all tracks, taken from each track's last note.
///
/// Zero when there are no notes at all.
pub fn total_duration(tracks: &[NoteTrack]) -> f64 {
    tracks
        .iter()
        .filter_map(NoteTrack::last_note_end)
        .fold(0.0, f64::max)
}

/// Assemble the response for one file.
pub fn summarize(filename: &str, decoded: &DecodedFile, reconstruction: Reconstruction) -> ParsedFile {
    let meta = reconstruction.final_meta;
    ParsedFile {
        filename: filename.to_string(),
        bpm: bpm(meta.tempo),
        time_signature: meta.time_signature.to_string(),
        duration_seconds: round_to(total_duration(&reconstruction.tracks), 2),
        tick_resolution: decoded.tick_resolution,
        tracks: reconstruction.tracks,
    }
}
