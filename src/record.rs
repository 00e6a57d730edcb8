//! On-disk record format.
//!
//! A state file is a sequence of fixed-width records of the form
//! `<hex device>:<hex inode>:<hex offset>\n`. All records of a file share one set of
//! field widths which is inferred from the first record. Widths are counted in bytes of the
//! integer they encode, so a 4 byte field occupies 8 hex digits.

use std::{io::Write, mem::size_of, path::Path};

use crate::{error::StateError, identity::Identity};

/// Upper bound on the length of a single record, newline included
pub const MAX_RECORD: usize = 100;

/// Separators terminating device, inode and offset fields respectively
pub const SEPARATORS: [u8; 3] = [b':', b':', b'\n'];

/// Widths of the three record fields in bytes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FieldWidths {
    pub device: usize,
    pub inode: usize,
    pub offset: usize,
}

impl FieldWidths {
    pub const fn new(device: usize, inode: usize, offset: usize) -> Self {
        Self {
            device,
            inode,
            offset,
        }
    }

    /// Widths needed to hold `stat` values on the current architecture
    pub fn native() -> Self {
        Self::new(
            size_of::<libc::dev_t>(),
            size_of::<libc::ino_t>(),
            size_of::<libc::off_t>(),
        )
    }

    fn as_array(&self) -> [usize; 3] {
        [self.device, self.inode, self.offset]
    }

    /// True if every field of `self` is at least as wide as in `other`
    pub fn covers(&self, other: &FieldWidths) -> bool {
        self.device >= other.device && self.inode >= other.inode && self.offset >= other.offset
    }

    /// Field-wise maximum. Widths only ever grow.
    pub fn widen(&self, other: &FieldWidths) -> FieldWidths {
        FieldWidths::new(
            self.device.max(other.device),
            self.inode.max(other.inode),
            self.offset.max(other.offset),
        )
    }

    /// Length of a full record including its newline
    pub fn record_len(&self) -> usize {
        self.as_array().iter().map(|w| 2 * w + 1).sum()
    }
}

/// Encoder and decoder for records of one generation of field widths
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordFormat {
    widths: FieldWidths,
    prefix_len: usize,
    record_len: usize,
}

impl RecordFormat {
    /// Build a format for `widths`, refusing records that would not fit `MAX_RECORD`
    pub fn new(widths: FieldWidths) -> Result<Self, StateError> {
        let record_len = widths.record_len();
        if record_len >= MAX_RECORD {
            return Err(StateError::Oversize {
                wanted: record_len,
                limit: MAX_RECORD,
            });
        }
        let prefix_len = 2 * widths.device + 1 + 2 * widths.inode;
        Ok(Self {
            widths,
            prefix_len,
            record_len,
        })
    }

    pub fn widths(&self) -> FieldWidths {
        self.widths
    }

    /// Number of bytes of the identity part, `device:inode` without the trailing separator
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Append an encoded record to `out`
    pub fn encode_into(
        &self,
        identity: Identity,
        offset: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), StateError> {
        let values = [identity.device, identity.inode, offset];
        for ((value, width), separator) in values
            .into_iter()
            .zip(self.widths.as_array())
            .zip(SEPARATORS)
        {
            let digits = 2 * width;
            let start = out.len();
            write!(out, "{value:0digits$x}")?;
            if out.len() - start != digits {
                out.truncate(start);
                return Err(StateError::FieldOverflow { value, width });
            }
            out.push(separator);
        }
        Ok(())
    }

    pub fn encode(&self, identity: Identity, offset: u64) -> Result<Vec<u8>, StateError> {
        let mut out = Vec::with_capacity(self.record_len);
        self.encode_into(identity, offset, &mut out)?;
        Ok(out)
    }

    /// Encoded identity prefix used to find the record of a file
    pub fn encode_key(&self, identity: Identity) -> Result<Vec<u8>, StateError> {
        let mut record = self.encode(identity, 0)?;
        record.truncate(self.prefix_len);
        Ok(record)
    }

    /// Parse the offset field of a single record
    pub fn decode_offset(&self, record: &[u8]) -> Option<u64> {
        let field = record.get(self.prefix_len + 1..self.record_len - 1)?;
        if record.get(self.record_len - 1) != Some(&b'\n') {
            return None;
        }
        parse_hex(field)
    }

    /// Parse a complete record
    pub fn decode(&self, record: &[u8]) -> Option<(Identity, u64)> {
        let device_end = 2 * self.widths.device;
        let device = parse_hex(record.get(..device_end)?)?;
        let inode = parse_hex(record.get(device_end + 1..self.prefix_len)?)?;
        let offset = self.decode_offset(record)?;
        Some((Identity { device, inode }, offset))
    }

    /// Iterate over `(byte offset, record)` pairs of a verified buffer
    pub fn records<'a>(&self, buffer: &'a [u8]) -> impl Iterator<Item = (usize, &'a [u8])> {
        let len = self.record_len;
        buffer
            .chunks_exact(len)
            .enumerate()
            .map(move |(index, record)| (index * len, record))
    }
}

fn parse_hex(field: &[u8]) -> Option<u64> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(field).ok()?;
    u64::from_str_radix(text, 16).ok()
}

/// Infer field widths from the first record of `buffer`.
///
/// Every byte up to the third separator must be a hex digit or the expected separator, and each
/// field must hold an even number of digits.
pub fn scan_widths(buffer: &[u8], path: &Path) -> Result<FieldWidths, StateError> {
    let mut widths = [0usize; 3];
    let mut field = 0;
    let mut field_start = 0;

    for (i, &byte) in buffer.iter().enumerate() {
        if field == 3 {
            break;
        }
        if byte.is_ascii_hexdigit() {
            continue;
        }
        if byte != SEPARATORS[field] {
            return Err(StateError::Corrupt {
                path: path.to_path_buf(),
                offset: i,
            });
        }
        let digits = i - field_start;
        if digits % 2 != 0 {
            return Err(StateError::OddField {
                path: path.to_path_buf(),
                digits,
            });
        }
        widths[field] = digits / 2;
        field += 1;
        field_start = i + 1;
    }

    if field < 3 {
        return Err(StateError::Truncated {
            path: path.to_path_buf(),
            len: buffer.len(),
        });
    }

    Ok(FieldWidths::new(widths[0], widths[1], widths[2]))
}

/// Check that every record of `buffer` matches `format`, reporting the first offending byte
pub fn verify_records(
    buffer: &[u8],
    format: &RecordFormat,
    path: &Path,
) -> Result<(), StateError> {
    let corrupt = |offset| StateError::Corrupt {
        path: path.to_path_buf(),
        offset,
    };
    let widths = format.widths().as_array();

    let mut position = 0;
    while position < buffer.len() {
        for (width, separator) in widths.iter().zip(SEPARATORS) {
            let end = position + 2 * width;
            for at in position..end {
                match buffer.get(at) {
                    Some(byte) if byte.is_ascii_hexdigit() => {}
                    Some(_) => return Err(corrupt(at)),
                    None => {
                        return Err(StateError::Truncated {
                            path: path.to_path_buf(),
                            len: buffer.len(),
                        })
                    }
                }
            }
            match buffer.get(end) {
                Some(&byte) if byte == separator => {}
                Some(_) => return Err(corrupt(end)),
                None => {
                    return Err(StateError::Truncated {
                        path: path.to_path_buf(),
                        len: buffer.len(),
                    })
                }
            }
            position = end + 1;
        }
    }
    Ok(())
}

/// Re-encode every record of `buffer` from widths `from` to the wider `to`, zero padding on
/// the left. Values are copied digit for digit, never reparsed.
pub fn widen_records(
    buffer: &[u8],
    from: FieldWidths,
    to: FieldWidths,
    path: &Path,
) -> Result<Vec<u8>, StateError> {
    let wanted = to.record_len();
    if wanted >= MAX_RECORD {
        return Err(StateError::Oversize {
            wanted,
            limit: MAX_RECORD,
        });
    }

    let have = from.as_array();
    let pad: Vec<usize> = to
        .as_array()
        .iter()
        .zip(have)
        .map(|(to, from)| 2 * to.saturating_sub(from))
        .collect();
    let source_len = from.record_len();

    let mut out = Vec::with_capacity(buffer.len() / source_len.max(1) * wanted);
    for (index, record) in buffer.chunks(source_len).enumerate() {
        let base = index * source_len;
        let mut cursor = 0;
        for field in 0..3 {
            let digits = 2 * have[field];
            let end = cursor + digits;
            if record.get(end) != Some(&SEPARATORS[field]) {
                return Err(StateError::Corrupt {
                    path: path.to_path_buf(),
                    offset: base + end.min(record.len()),
                });
            }
            out.resize(out.len() + pad[field], b'0');
            out.extend_from_slice(&record[cursor..end]);
            out.push(SEPARATORS[field]);
            cursor = end + 1;
        }
    }
    Ok(out)
}
