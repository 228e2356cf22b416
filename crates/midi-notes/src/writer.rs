//! Encode message tracks as a Standard MIDI File.
//!
//! Every channel message is written with an explicit status byte. `Other`
//! messages carry nothing that can be re-encoded, so they are skipped and
//! their delta-time is folded into the next written message.

use crate::message::{Message, MessageKind, Track};
use crate::note::DEFAULT_TEMPO;
use crate::{Error, Result};

/// Ticks per beat of the bundled sample file.
pub const SAMPLE_RESOLUTION: u16 = 480;

/// Build SMF bytes. One track is written as format 0, more as format 1.
///
/// Fails if a message cannot be represented in SMF, such as a time
/// signature whose denominator is not a power of two.
pub fn write_smf(tick_resolution: u16, tracks: &[Track]) -> Result<Vec<u8>> {
    for message in tracks.iter().flatten() {
        if let MessageKind::TimeSignature { denominator, .. } = &message.kind {
            if !denominator.is_power_of_two() {
                return Err(Error::Unencodable(format!(
                    "time signature denominator {} is not a power of two",
                    denominator
                )));
            }
        }
    }
    Ok(encode_smf(tick_resolution, tracks))
}

fn encode_smf(tick_resolution: u16, tracks: &[Track]) -> Vec<u8> {
    let chunks: Vec<Vec<u8>> = tracks.iter().map(|t| encode_track(t)).collect();
    let format: u16 = if chunks.len() == 1 { 0 } else { 1 };

    let mut buf = Vec::new();

    // MThd header
    buf.extend_from_slice(b"MThd");
    buf.extend_from_slice(&6u32.to_be_bytes());
    buf.extend_from_slice(&format.to_be_bytes());
    buf.extend_from_slice(&(chunks.len() as u16).to_be_bytes());
    buf.extend_from_slice(&tick_resolution.to_be_bytes());

    // MTrk chunks
    for chunk in &chunks {
        buf.extend_from_slice(b"MTrk");
        buf.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        buf.extend_from_slice(chunk);
    }

    buf
}

/// The sample track: a C major scale of quarter notes at 120 BPM in 4/4.
pub fn sample_scale() -> Track {
    const SCALE: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];
    const VELOCITY: u8 = 80;

    let mut track = vec![
        Message::new(
            0,
            MessageKind::SetTempo {
                microseconds_per_beat: DEFAULT_TEMPO,
            },
        ),
        Message::new(
            0,
            MessageKind::TimeSignature {
                numerator: 4,
                denominator: 4,
            },
        ),
        Message::new(
            0,
            MessageKind::TrackName {
                name: "Piano".to_string(),
            },
        ),
    ];

    for note in SCALE {
        track.push(Message::note_on(0, note, VELOCITY));
        track.push(Message::note_off(u32::from(SAMPLE_RESOLUTION), note, VELOCITY));
    }

    track.push(Message::new(0, MessageKind::EndOfTrack));
    track
}

/// Bytes of the bundled sample file.
pub fn sample_file() -> Vec<u8> {
    encode_smf(SAMPLE_RESOLUTION, &[sample_scale()])
}

fn encode_track(track: &[Message]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut pending_delta: u32 = 0;
    let mut ended = false;

    for message in track {
        pending_delta = pending_delta.saturating_add(message.delta_ticks);

        let body: Vec<u8> = match &message.kind {
            MessageKind::NoteOn {
                channel,
                note,
                velocity,
            } => vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MessageKind::NoteOff {
                channel,
                note,
                velocity,
            } => vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MessageKind::SetTempo {
                microseconds_per_beat,
            } => {
                let bytes = microseconds_per_beat.to_be_bytes();
                vec![0xFF, 0x51, 0x03, bytes[1], bytes[2], bytes[3]]
            }
            MessageKind::TimeSignature {
                numerator,
                denominator,
            } => {
                // Denominator is stored as its log2 (checked in write_smf);
                // 24 clocks per click and 8 32nds per quarter are the usual
                // values.
                let power = denominator.trailing_zeros() as u8;
                vec![0xFF, 0x58, 0x04, *numerator, power, 24, 8]
            }
            MessageKind::TrackName { name } => {
                let mut meta = vec![0xFF, 0x03];
                write_vlq(&mut meta, name.len() as u32);
                meta.extend_from_slice(name.as_bytes());
                meta
            }
            MessageKind::EndOfTrack => {
                ended = true;
                vec![0xFF, 0x2F, 0x00]
            }
            MessageKind::Other => continue,
        };

        write_vlq(&mut data, pending_delta);
        data.extend_from_slice(&body);
        pending_delta = 0;

        if ended {
            break;
        }
    }

    if !ended {
        write_vlq(&mut data, pending_delta);
        data.extend_from_slice(&[0xFF, 0x2F, 0x00]);
    }

    data
}

/// Write a variable-length quantity to a byte buffer.
fn write_vlq(buf: &mut Vec<u8>, mut value: u32) {
    if value == 0 {
        buf.push(0);
        return;
    }

    let mut bytes = Vec::new();
    bytes.push((value & 0x7F) as u8);
    value >>= 7;

    while value > 0 {
        bytes.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }

    bytes.reverse();
    buf.extend_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::decode;
    use pretty_assertions::assert_eq;

    #[test]
    fn vlq_encoding() {
        let cases: [(u32, &[u8]); 5] = [
            (0, &[0x00]),
            (0x7F, &[0x7F]),
            (0x80, &[0x81, 0x00]),
            (480, &[0x83, 0x60]),
            (0x0FFF_FFFF, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            write_vlq(&mut buf, value);
            assert_eq!(buf, expected, "value {value}");
        }
    }

    #[test]
    fn sample_file_decodes_to_sample_track() {
        let decoded = decode(&sample_file()).unwrap();
        assert_eq!(decoded.tick_resolution, SAMPLE_RESOLUTION);
        assert_eq!(decoded.tracks, vec![sample_scale()]);
    }

    #[test]
    fn other_messages_fold_their_delta() {
        let track = vec![
            Message::new(100, MessageKind::Other),
            Message::note_on(20, 60, 80),
            Message::note_off(480, 60, 0),
        ];
        let decoded = decode(&write_smf(480, &[track]).unwrap()).unwrap();

        assert_eq!(decoded.tracks[0][0], Message::note_on(120, 60, 80));
        assert_eq!(
            decoded.tracks[0].last().map(|m| m.kind.clone()),
            Some(MessageKind::EndOfTrack)
        );
    }

    #[test]
    fn multiple_tracks_use_format_one() {
        let bytes = write_smf(96, &[vec![], vec![Message::note_on(0, 60, 1)]]).unwrap();
        assert_eq!(&bytes[8..10], &1u16.to_be_bytes());
        assert_eq!(&bytes[10..12], &2u16.to_be_bytes());
    }

    #[test]
    fn sample_file_matches_checked_writer() {
        assert_eq!(
            write_smf(SAMPLE_RESOLUTION, &[sample_scale()]).unwrap(),
            sample_file()
        );
    }

    #[test]
    fn meter_round_trips_through_writer() {
        let track = vec![Message::new(
            0,
            MessageKind::TimeSignature {
                numerator: 6,
                denominator: 8,
            },
        )];
        let decoded = decode(&write_smf(480, &[track.clone()]).unwrap()).unwrap();
        assert_eq!(decoded.tracks[0][0], track[0]);
    }

    #[test]
    fn non_power_of_two_denominator_is_rejected() {
        for denominator in [0, 3, 6, 12] {
            let track = vec![Message::new(
                0,
                MessageKind::TimeSignature {
                    numerator: 4,
                    denominator,
                },
            )];
            let err = write_smf(480, &[track]).unwrap_err();
            assert!(
                matches!(err, Error::Unencodable(_)),
                "denominator {denominator}: {err}"
            );
        }
    }
}
