//! Intel-HEX firmware image loader and writer.
//!
//! Parses the `:`-prefixed ASCII record stream into a map of base address
//! to contiguous byte blocks plus any declared entry points, and emits the
//! same format back out. Lines that do not start with `:` are skipped
//! (xcal-style images wrap ihex records in other text); records with a bad
//! checksum or truncated payload are an error.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordCode {
    Data = 0,
    Eof = 1,
    ExtSegAddr = 2,
    StartSegAddr = 3,
    ExtLinearAddr = 4,
    StartLinearAddr = 5,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IhexError {
    #[error("record at line {line} is not valid hex")]
    BadHex { line: usize },
    #[error("record at line {line} fails its checksum")]
    BadChecksum { line: usize },
    #[error("record at line {line} is truncated")]
    Truncated { line: usize },
    #[error("record at line {line} has unknown type {code}")]
    UnknownType { line: usize, code: u8 },
}

/// A parsed firmware image.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Image {
    /// Contiguous data blocks keyed by absolute base address.
    pub blocks: BTreeMap<u32, Vec<u8>>,
    /// Entry addresses declared by start-address records.
    pub entries: Vec<u32>,
}

/// Sum of all record bytes modulo 256; a valid record sums to zero
/// including its trailing checksum byte.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn parse_hex_line(line: &str, lineno: usize) -> Result<Vec<u8>, IhexError> {
    let body = line.trim_start_matches(':').trim_end();
    if body.len() % 2 != 0 {
        return Err(IhexError::BadHex { line: lineno });
    }
    (0..body.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&body[i..i + 2], 16).map_err(|_| IhexError::BadHex { line: lineno }))
        .collect()
}

/// Parse an ihex image. Blocks are coalesced while the data records stay
/// contiguous; a gap starts a new block.
pub fn parse(data: &str) -> Result<Image, IhexError> {
    let mut image = Image::default();
    let mut cur_base: Option<u32> = None;
    let mut cur_block: Vec<u8> = Vec::new();
    let mut offset: u32 = 0;

    for (lineno, line) in data.lines().enumerate() {
        if !line.starts_with(':') {
            continue;
        }
        let rec = parse_hex_line(line, lineno)?;
        if rec.len() < 5 {
            return Err(IhexError::Truncated { line: lineno });
        }
        if checksum(&rec) != 0 {
            return Err(IhexError::BadChecksum { line: lineno });
        }
        let size = rec[0] as usize;
        let addr = BigEndian::read_u16(&rec[1..3]) as u32;
        let code = rec[3];
        if rec.len() != size + 5 {
            return Err(IhexError::Truncated { line: lineno });
        }
        let payload = &rec[4..4 + size];

        match code {
            0 => {
                let abs = offset + addr;
                match cur_base {
                    Some(base) if base + cur_block.len() as u32 == abs => {}
                    Some(base) => {
                        image.blocks.insert(base, std::mem::take(&mut cur_block));
                        cur_base = Some(abs);
                    }
                    None => cur_base = Some(abs),
                }
                cur_block.extend_from_slice(payload);
            }
            1 => break,
            2 => {
                offset = (BigEndian::read_u16(payload) as u32) * 16;
            }
            3 => {
                let cs = BigEndian::read_u16(&payload[0..2]) as u32;
                let ip = BigEndian::read_u16(&payload[2..4]) as u32;
                image.entries.push((cs << 4) + ip);
            }
            4 => {
                offset = (BigEndian::read_u16(payload) as u32) << 16;
            }
            5 => {
                image.entries.push(BigEndian::read_u32(payload));
            }
            code => return Err(IhexError::UnknownType { line: lineno, code }),
        }
    }

    if let Some(base) = cur_base {
        if !cur_block.is_empty() {
            image.blocks.insert(base, cur_block);
        }
    }
    Ok(image)
}

fn emit_record(out: &mut String, addr: u16, code: u8, payload: &[u8]) {
    let mut rec = Vec::with_capacity(payload.len() + 5);
    rec.push(payload.len() as u8);
    rec.extend_from_slice(&addr.to_be_bytes());
    rec.push(code);
    rec.extend_from_slice(payload);
    rec.push(0u8.wrapping_sub(checksum(&rec)));

    out.push(':');
    for b in rec {
        out.push_str(&format!("{:02X}", b));
    }
    out.push('\n');
}

/// Emit an image as ihex text, 16 data bytes per record, with extended
/// linear address records at each 64KB boundary crossing.
pub fn emit(image: &Image) -> String {
    let mut out = String::new();
    let mut cur_upper: Option<u16> = None;

    for (&base, data) in &image.blocks {
        for (i, chunk) in data.chunks(16).enumerate() {
            let abs = base + (i as u32) * 16;
            let upper = (abs >> 16) as u16;
            if cur_upper != Some(upper) {
                emit_record(&mut out, 0, 4, &upper.to_be_bytes());
                cur_upper = Some(upper);
            }
            emit_record(&mut out, (abs & 0xFFFF) as u16, 0, chunk);
        }
    }
    for &entry in &image.entries {
        emit_record(&mut out, 0, 5, &entry.to_be_bytes());
    }
    emit_record(&mut out, 0, 1, &[]);
    out
}
