//! Hex dump formatting for relayed chunks.
//!
//! ```text
//! [14:02:11]
//! 0000: 48 65 6C 6C 6F 2C 20 77  H e l l o ,   w
//! 0008: 6F 72 6C 64 0A           o r l d .
//! ```

use std::fmt;

use chrono::{DateTime, Local};

/// Bytes shown per dump line.
pub const BYTES_PER_LINE: usize = 8;

/// Returns the printable form of a byte.
pub fn display_char(byte: u8) -> char {
    if (32..=126).contains(&byte) {
        byte as char
    } else {
        '.'
    }
}

/// One line of a dump: up to [`BYTES_PER_LINE`] bytes at a decimal offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpLine<'a> {
    /// Offset of the first byte within the chunk.
    pub offset: usize,
    /// Bytes on this line.
    pub bytes: &'a [u8],
}

impl<'a> DumpLine<'a> {
    /// Four-digit decimal offset.
    pub fn offset_label(&self) -> String {
        format!("{:04}", self.offset)
    }

    /// `0xNN` cells, padded with empty strings to a full line.
    pub fn hex_cells(&self) -> Vec<String> {
        let mut cells: Vec<String> = self.bytes.iter().map(|b| format!("0x{:02X}", b)).collect();
        cells.resize(BYTES_PER_LINE, String::new());
        cells
    }

    /// Display characters, each followed by a space.
    pub fn chars(&self) -> String {
        let mut out = String::with_capacity(self.bytes.len() * 2);
        for &b in self.bytes {
            out.push(display_char(b));
            out.push(' ');
        }
        out
    }
}

impl fmt::Display for DumpLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.offset_label())?;
        for b in self.bytes {
            write!(f, "{:02X} ", b)?;
        }
        for _ in self.bytes.len()..BYTES_PER_LINE {
            f.write_str("   ")?;
        }
        write!(f, " {}", self.chars().trim_end())
    }
}

/// Splits a chunk into dump lines.
pub fn lines(data: &[u8]) -> impl Iterator<Item = DumpLine<'_>> {
    data.chunks(BYTES_PER_LINE)
        .enumerate()
        .map(|(i, bytes)| DumpLine {
            offset: i * BYTES_PER_LINE,
            bytes,
        })
}

/// Formats a chunk with a `[HH:MM:SS]` header.
pub fn format_dump(data: &[u8], at: DateTime<Local>) -> String {
    let mut out = format!("[{}]\n", at.format("%H:%M:%S"));
    for line in lines(data) {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}
