use serde::{Deserialize, Serialize};

/// Tempo assumed until a set_tempo message is seen (120 BPM).
pub const DEFAULT_TEMPO: u32 = 500_000;

/// A reconstructed note with absolute timing in seconds.
///
/// Serialized with the field names the note-fall front end reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub note: u8,
    #[serde(rename = "time")]
    pub onset_seconds: f64,
    #[serde(rename = "duration")]
    pub duration_seconds: f64,
    pub velocity: u8,
}

impl NoteEvent {
    pub fn end_seconds(&self) -> f64 {
        self.onset_seconds + self.duration_seconds
    }
}

/// Time signature as written in the file, displayed as "N/D".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u32,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl std::fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// A track that produced at least one note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteTrack {
    pub track_name: String,
    pub notes: Vec<NoteEvent>,
}

impl NoteTrack {
    /// End of the track's last note, the value the file duration is built from.
    pub fn last_note_end(&self) -> Option<f64> {
        self.notes.last().map(NoteEvent::end_seconds)
    }
}

/// Everything served for one stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub filename: String,
    #[serde(rename = "tempo")]
    pub bpm: f64,
    pub time_signature: String,
    #[serde(rename = "duration")]
    pub duration_seconds: f64,
    #[serde(rename = "ticks_per_beat")]
    pub tick_resolution: u16,
    pub tracks: Vec<NoteTrack>,
}

/// Round to a fixed number of decimal places.
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
