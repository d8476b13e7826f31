//! Standard MIDI file reading and writing.
//!
//! The reader tolerates unknown chunks and skips malformed events where it
//! can; a malformed header fails the whole load. The writer rewrites
//! `TrackName`, `SetTempo` and `TimeSignature` at the head of every track
//! and suppresses them in the body, so round-trips through other writers
//! may reorder those metas.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::error::FileError;
use crate::pattern::*;

const HEADER_TAG: &[u8; 4] = b"MThd";
const TRACK_TAG: &[u8; 4] = b"MTrk";

/// Parsed file-level header data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmfHeader {
    pub format: u16,
    pub track_count: u16,
    /// Ticks per quarter; SMPTE divisions fall back to `DEFAULT_PPQ`
    pub ppq: u16,
}

/// Reads a standard MIDI file into patterns, one per track.
pub struct SmfReader;

impl SmfReader {
    /// Parses an entire file image.
    pub fn read(bytes: &[u8]) -> Result<(SmfHeader, Vec<Pattern>), FileError> {
        let mut cursor = Cursor::new(bytes);
        let header = Self::read_header(&mut cursor)?;
        let mut patterns = Vec::with_capacity(header.track_count as usize);

        for _ in 0..header.track_count {
            let mut tag = [0u8; 4];
            if cursor.read_exact(&mut tag).is_err() {
                break; // fewer tracks than declared; keep what we have
            }
            let length = cursor.read_u32::<BigEndian>()?;
            let mut body = vec![0u8; length as usize];
            cursor
                .read_exact(&mut body)
                .map_err(|_| FileError::UnexpectedEof)?;
            if &tag != TRACK_TAG {
                debug!("skipping unknown chunk {:?}", tag);
                continue;
            }
            patterns.push(Self::read_track(&body, header.ppq)?);
        }
        Ok((header, patterns))
    }

    fn read_header(cursor: &mut Cursor<&[u8]>) -> Result<SmfHeader, FileError> {
        let mut tag = [0u8; 4];
        cursor
            .read_exact(&mut tag)
            .map_err(|_| FileError::BadHeaderTag)?;
        if &tag != HEADER_TAG {
            return Err(FileError::BadHeaderTag);
        }
        let length = cursor.read_u32::<BigEndian>()?;
        if length != 6 {
            return Err(FileError::BadHeaderLength(length));
        }
        let format = cursor.read_u16::<BigEndian>()?;
        if format > 2 {
            return Err(FileError::BadFormat(format));
        }
        let track_count = cursor.read_u16::<BigEndian>()?;
        let division = cursor.read_u16::<BigEndian>()?;
        let ppq = if division & 0x8000 != 0 {
            // SMPTE timing: not beat-based, use the default resolution.
            warn!("SMPTE division {division:#06x}, using default PPQ");
            DEFAULT_PPQ
        } else {
            division
        };
        Ok(SmfHeader {
            format,
            track_count,
            ppq,
        })
    }

    fn read_track(body: &[u8], ppq: u16) -> Result<Pattern, FileError> {
        let mut pattern = Pattern {
            ppq,
            ..Pattern::default()
        };
        let mut cursor = Cursor::new(body);
        let mut tick: u64 = 0;
        let mut running_status: Option<u8> = None;

        loop {
            let delta = match read_vlq(&mut cursor) {
                Ok(v) => v,
                Err(FileError::UnexpectedEof) => break, // track ended without EndOfTrack
                Err(e) => return Err(e),
            };
            tick += delta as u64;

            let first = match cursor.read_u8() {
                Ok(b) => b,
                Err(_) => break,
            };

            match first {
                0xFF => {
                    running_status = None;
                    let meta_type = cursor.read_u8()?;
                    let len = read_vlq(&mut cursor)?;
                    let mut data = vec![0u8; len as usize];
                    cursor
                        .read_exact(&mut data)
                        .map_err(|_| FileError::UnexpectedEof)?;
                    match meta_type {
                        META_TRACK_NAME => {
                            pattern.name = String::from_utf8_lossy(&data).into_owned();
                        }
                        META_SET_TEMPO if data.len() >= 3 => {
                            pattern.tempo =
                                ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32;
                        }
                        META_TIME_SIGNATURE if data.len() >= 2 => {
                            pattern.time_sig_numerator = data[0];
                            pattern.time_sig_denominator = 1u8 << data[1].min(7);
                        }
                        META_END_OF_TRACK => {
                            pattern.length_ticks = tick;
                            pattern.events.push(PatternEvent {
                                tick,
                                delta,
                                kind: PatternEventKind::Meta,
                                channel: 0,
                                status: META_END_OF_TRACK,
                                data,
                            });
                            break;
                        }
                        _ => {}
                    }
                    if meta_type != META_END_OF_TRACK {
                        pattern.events.push(PatternEvent {
                            tick,
                            delta,
                            kind: PatternEventKind::Meta,
                            channel: 0,
                            status: meta_type,
                            data,
                        });
                    }
                }
                0xF0 | 0xF7 => {
                    running_status = None;
                    let len = read_vlq(&mut cursor)?;
                    let mut data = vec![0u8; len as usize];
                    cursor
                        .read_exact(&mut data)
                        .map_err(|_| FileError::UnexpectedEof)?;
                    pattern.events.push(PatternEvent {
                        tick,
                        delta,
                        kind: PatternEventKind::SysEx,
                        channel: 0,
                        status: first,
                        data,
                    });
                }
                status if status & 0x80 != 0 => {
                    running_status = Some(status);
                    let data = read_voice_data(&mut cursor, status, None)?;
                    pattern.events.push(PatternEvent {
                        tick,
                        delta,
                        kind: PatternEventKind::ChannelVoice,
                        channel: status & 0x0F,
                        status,
                        data,
                    });
                }
                data_byte => {
                    // Running status: the byte we just read is data.
                    let status =
                        running_status.ok_or(FileError::OrphanedTrackData(data_byte))?;
                    let data = read_voice_data(&mut cursor, status, Some(data_byte))?;
                    pattern.events.push(PatternEvent {
                        tick,
                        delta,
                        kind: PatternEventKind::ChannelVoice,
                        channel: status & 0x0F,
                        status,
                        data,
                    });
                }
            }
        }

        if pattern.length_ticks == 0 {
            pattern.length_ticks = tick;
        }
        Ok(pattern)
    }
}

/// Writes patterns back out as a format-1 standard MIDI file.
pub struct SmfWriter;

impl SmfWriter {
    pub fn write(patterns: &[Pattern]) -> Result<Vec<u8>, FileError> {
        let ppq = patterns.first().map(|p| p.ppq).unwrap_or(DEFAULT_PPQ);
        let mut out = Vec::new();
        out.write_all(HEADER_TAG)?;
        out.write_u32::<BigEndian>(6)?;
        out.write_u16::<BigEndian>(if patterns.len() > 1 { 1 } else { 0 })?;
        out.write_u16::<BigEndian>(patterns.len() as u16)?;
        out.write_u16::<BigEndian>(ppq & 0x7FFF)?;
        for pattern in patterns {
            Self::write_track(&mut out, pattern)?;
        }
        Ok(out)
    }

    fn write_track(out: &mut Vec<u8>, pattern: &Pattern) -> Result<(), FileError> {
        let mut body = Vec::new();

        // Head rewrite: name, tempo and time signature always lead the
        // track, whatever the body carried.
        write_meta(&mut body, 0, META_TRACK_NAME, pattern.name.as_bytes());
        let tempo = pattern.tempo;
        write_meta(
            &mut body,
            0,
            META_SET_TEMPO,
            &[(tempo >> 16) as u8, (tempo >> 8) as u8, tempo as u8],
        );
        let denom_log2 = pattern.time_sig_denominator.max(1).trailing_zeros() as u8;
        write_meta(
            &mut body,
            0,
            META_TIME_SIGNATURE,
            &[pattern.time_sig_numerator, denom_log2, 24, 8],
        );

        let mut last_tick: u64 = 0;
        for event in &pattern.events {
            let suppressed = matches!(event.kind, PatternEventKind::Meta)
                && matches!(
                    event.status,
                    META_TRACK_NAME | META_SET_TEMPO | META_TIME_SIGNATURE | META_END_OF_TRACK
                );
            if suppressed {
                continue;
            }
            let delta = event.tick.saturating_sub(last_tick) as u32;
            last_tick = event.tick;
            write_vlq(&mut body, delta);
            match event.kind {
                PatternEventKind::ChannelVoice => {
                    body.push(event.status);
                    body.extend_from_slice(&event.data);
                }
                PatternEventKind::Meta => {
                    body.push(0xFF);
                    body.push(event.status);
                    write_vlq(&mut body, event.data.len() as u32);
                    body.extend_from_slice(&event.data);
                }
                PatternEventKind::SysEx => {
                    body.push(event.status);
                    write_vlq(&mut body, event.data.len() as u32);
                    body.extend_from_slice(&event.data);
                }
            }
        }

        // Close at the declared pattern length.
        let tail_delta = pattern.length_ticks.saturating_sub(last_tick) as u32;
        write_vlq(&mut body, tail_delta);
        body.push(0xFF);
        body.push(META_END_OF_TRACK);
        write_vlq(&mut body, 0);

        out.write_all(TRACK_TAG)?;
        out.write_u32::<BigEndian>(body.len() as u32)?;
        out.write_all(&body)?;
        Ok(())
    }
}

/// Data byte count that follows a channel-voice status.
fn voice_data_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        _ => 2,
    }
}

fn read_voice_data(
    cursor: &mut Cursor<&[u8]>,
    status: u8,
    first: Option<u8>,
) -> Result<Vec<u8>, FileError> {
    let needed = voice_data_len(status);
    let mut data = Vec::with_capacity(needed);
    if let Some(b) = first {
        data.push(b);
    }
    while data.len() < needed {
        data.push(cursor.read_u8().map_err(|_| FileError::UnexpectedEof)?);
    }
    Ok(data)
}

/// Reads a variable-length quantity: 7-bit groups, high bit continues.
pub fn read_vlq(cursor: &mut Cursor<&[u8]>) -> Result<u32, FileError> {
    let mut value: u32 = 0;
    for i in 0.. {
        if i >= 4 {
            return Err(FileError::VlqTooLong);
        }
        let byte = cursor.read_u8().map_err(|_| FileError::UnexpectedEof)?;
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(value)
}

/// Writes a meta event: delta-time, 0xFF, type, length, data.
fn write_meta(out: &mut Vec<u8>, delta: u32, meta_type: u8, data: &[u8]) {
    write_vlq(out, delta);
    out.push(0xFF);
    out.push(meta_type);
    write_vlq(out, data.len() as u32);
    out.extend_from_slice(data);
}

/// Writes a variable-length quantity.
pub fn write_vlq(out: &mut Vec<u8>, mut value: u32) {
    let mut stack = [0u8; 4];
    let mut n = 0;
    loop {
        stack[n] = (value & 0x7F) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    while n > 1 {
        n -= 1;
        out.push(stack[n] | 0x80);
    }
    out.push(stack[0]);
}
