//! Decoding of Standard MIDI File bytes into per-track message sequences.
//!
//! midly does the chunk parsing and expands running status, so every
//! message handed downstream carries its full kind. Events the note path
//! has no use for are kept as [`MessageKind::Other`] so their delta-times
//! still advance the track clock.

use crate::{Error, Result};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use serde::{Deserialize, Serialize};

/// Ticks per beat used for SMPTE-timed files, which carry no beat resolution.
pub const TIMECODE_FALLBACK_RESOLUTION: u16 = 480;

/// What a single track message means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    SetTempo { microseconds_per_beat: u32 },
    TimeSignature { numerator: u8, denominator: u32 },
    TrackName { name: String },
    EndOfTrack,
    Other,
}

/// A track message with its delta-time relative to the previous message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub delta_ticks: u32,
    pub kind: MessageKind,
}

impl Message {
    pub fn new(delta_ticks: u32, kind: MessageKind) -> Self {
        Self { delta_ticks, kind }
    }

    pub fn note_on(delta_ticks: u32, note: u8, velocity: u8) -> Self {
        Self::new(
            delta_ticks,
            MessageKind::NoteOn {
                channel: 0,
                note,
                velocity,
            },
        )
    }

    pub fn note_off(delta_ticks: u32, note: u8, velocity: u8) -> Self {
        Self::new(
            delta_ticks,
            MessageKind::NoteOff {
                channel: 0,
                note,
                velocity,
            },
        )
    }

    /// True when this message ends a sounding `note`: a note-off for it, or
    /// a note-on for it with velocity 0. Channel is not considered.
    pub fn releases(&self, note: u8) -> bool {
        match self.kind {
            MessageKind::NoteOff { note: n, .. } => n == note,
            MessageKind::NoteOn {
                note: n, velocity, ..
            } => n == note && velocity == 0,
            _ => false,
        }
    }
}

/// One track's messages in file order.
pub type Track = Vec<Message>;

/// Decoded container: global tick resolution plus every track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFile {
    pub tick_resolution: u16,
    pub tracks: Vec<Track>,
}

/// Decode raw SMF bytes.
pub fn decode(bytes: &[u8]) -> Result<DecodedFile> {
    let smf = Smf::parse(bytes).map_err(|e| Error::Parse(e.to_string()))?;

    let tick_resolution = match smf.header.timing {
        Timing::Metrical(ticks) => ticks.as_int(),
        Timing::Timecode(_fps, _subframes) => TIMECODE_FALLBACK_RESOLUTION,
    };
    if tick_resolution == 0 {
        return Err(Error::InvalidResolution);
    }

    let mut tracks = Vec::with_capacity(smf.tracks.len());
    for (index, events) in smf.tracks.iter().enumerate() {
        let mut track = Vec::with_capacity(events.len());
        for event in events {
            let kind = convert_kind(&event.kind).map_err(|reason| {
                Error::Parse(format!("track {}: {}", index + 1, reason))
            })?;
            track.push(Message::new(event.delta.as_int(), kind));
        }
        tracks.push(track);
    }

    Ok(DecodedFile {
        tick_resolution,
        tracks,
    })
}

fn convert_kind(kind: &TrackEventKind<'_>) -> std::result::Result<MessageKind, String> {
    let converted = match *kind {
        TrackEventKind::Midi { channel, message } => match message {
            MidiMessage::NoteOn { key, vel } => MessageKind::NoteOn {
                channel: channel.as_int(),
                note: key.as_int(),
                velocity: vel.as_int(),
            },
            MidiMessage::NoteOff { key, vel } => MessageKind::NoteOff {
                channel: channel.as_int(),
                note: key.as_int(),
                velocity: vel.as_int(),
            },
            _ => MessageKind::Other,
        },
        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
            let microseconds_per_beat = tempo.as_int();
            if microseconds_per_beat == 0 {
                return Err("set_tempo of 0 microseconds per beat".to_string());
            }
            MessageKind::SetTempo {
                microseconds_per_beat,
            }
        }
        TrackEventKind::Meta(MetaMessage::TimeSignature(numerator, denom_pow, _, _)) => {
            // denom_pow is log2 of the denominator
            match 1u32.checked_shl(denom_pow.into()) {
                Some(denominator) => MessageKind::TimeSignature {
                    numerator,
                    denominator,
                },
                None => MessageKind::Other,
            }
        }
        TrackEventKind::Meta(MetaMessage::TrackName(raw)) => MessageKind::TrackName {
            name: String::from_utf8_lossy(raw).into_owned(),
        },
        TrackEventKind::Meta(MetaMessage::EndOfTrack) => MessageKind::EndOfTrack,
        _ => MessageKind::Other,
    };
    Ok(converted)
}
