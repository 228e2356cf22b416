//! Absolute-time note reconstruction from delta-time message tracks.
//!
//! Each note-on is paired with the first later message in the same track that
//! releases the same note number, regardless of channel. Overlapping or
//! re-struck notes of one pitch are not disambiguated, and a note-on without
//! any later release is dropped.
//!
//! Tick-to-second conversion uses the tempo in effect when the note-on is
//! reached; a tempo change during a held note does not stretch it.

use crate::message::{DecodedFile, Message, MessageKind};
use crate::note::{round_to, NoteEvent, NoteTrack, TimeSignature, DEFAULT_TEMPO};

/// Meta state that carries across tracks in file order.
///
/// Format-1 files put tempo and meter in a conductor track, so the values
/// seen there must still be in effect when later tracks are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaState {
    pub tempo: u32,
    pub time_signature: TimeSignature,
}

impl Default for MetaState {
    fn default() -> Self {
        Self {
            tempo: DEFAULT_TEMPO,
            time_signature: TimeSignature::default(),
        }
    }
}

impl MetaState {
    fn seconds_per_tick(&self, tick_resolution: u16) -> f64 {
        (self.tempo as f64 / 1_000_000.0) / tick_resolution as f64
    }
}

/// Result of reconstructing every track of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    /// Tracks with at least one note, in file order.
    pub tracks: Vec<NoteTrack>,
    /// Meta state after the last track was read.
    pub final_meta: MetaState,
}

/// Reconstruct every track, dropping the ones without notes.
pub fn reconstruct(decoded: &DecodedFile) -> Reconstruction {
    let mut meta = MetaState::default();
    let mut tracks = Vec::new();

    for (index, track) in decoded.tracks.iter().enumerate() {
        let note_track = reconstruct_track(track, index, decoded.tick_resolution, &mut meta);
        if !note_track.notes.is_empty() {
            tracks.push(note_track);
        }
    }

    Reconstruction {
        tracks,
        final_meta: meta,
    }
}

/// Single forward pass over one track.
///
/// `index` is the zero-based position of the track in the file and names
/// the track when no track_name message is present.
pub fn reconstruct_track(
    track: &[Message],
    index: usize,
    tick_resolution: u16,
    meta: &mut MetaState,
) -> NoteTrack {
    let mut track_name = format!("Track {}", index + 1);
    let mut notes = Vec::new();
    let mut current_tick: u64 = 0;

    for (position, message) in track.iter().enumerate() {
        current_tick += u64::from(message.delta_ticks);

        match &message.kind {
            MessageKind::SetTempo {
                microseconds_per_beat,
            } => meta.tempo = *microseconds_per_beat,
            MessageKind::TimeSignature {
                numerator,
                denominator,
            } => {
                meta.time_signature = TimeSignature {
                    numerator: *numerator,
                    denominator: *denominator,
                }
            }
            MessageKind::TrackName { name } => track_name = name.clone(),
            MessageKind::NoteOn { note, velocity, .. } if *velocity > 0 => {
                let Some(duration_ticks) = ticks_until_release(&track[position + 1..], *note)
                else {
                    continue;
                };

                let seconds_per_tick = meta.seconds_per_tick(tick_resolution);
                notes.push(NoteEvent {
                    note: *note,
                    onset_seconds: round_to(current_tick as f64 * seconds_per_tick, 3),
                    duration_seconds: round_to(duration_ticks as f64 * seconds_per_tick, 3),
                    velocity: *velocity,
                });
            }
            _ => {}
        }
    }

    NoteTrack { track_name, notes }
}

/// Ticks from the start of `rest` to the first message releasing `note`.
fn ticks_until_release(rest: &[Message], note: u8) -> Option<u64> {
    let mut elapsed: u64 = 0;
    for message in rest {
        elapsed += u64::from(message.delta_ticks);
        if message.releases(note) {
            return Some(elapsed);
        }
    }
    None
}
