//! Payload text rendering
//!
//! Verbose payloads are a sequence of typed arguments, each introduced by a
//! 32-bit type info word. Rendering stops quietly at the first argument that
//! is truncated or of an unsupported type; whatever was decoded up to that
//! point is returned.

use crate::types::Endianness;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

// Type info bits
const TYLE_MASK: u32 = 0x0000_000F;
const TYPE_BOOL: u32 = 0x0000_0010;
const TYPE_SINT: u32 = 0x0000_0020;
const TYPE_UINT: u32 = 0x0000_0040;
const TYPE_FLOA: u32 = 0x0000_0080;
const TYPE_STRG: u32 = 0x0000_0200;
const TYPE_RAWD: u32 = 0x0000_0400;
const TYPE_VARI: u32 = 0x0000_0800;
const TYPE_FIXP: u32 = 0x0000_1000;

/// Replace non-printable bytes with '.'
pub fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
        .collect()
}

/// Render a non-verbose payload as `[message-id] printable-bytes`
pub fn render_non_verbose(payload: &[u8], endianness: Endianness) -> String {
    if payload.len() < 4 {
        return printable(payload);
    }
    let message_id = endianness.read_u32(payload);
    format!("[{}] {}", message_id, printable(&payload[4..])).trim_end().to_string()
}

/// Render `argument_count` verbose arguments separated by spaces
pub fn render_verbose(payload: &[u8], argument_count: u8, endianness: Endianness) -> String {
    let mut reader = Reader { buf: payload, pos: 0, endianness };
    let mut parts = Vec::with_capacity(usize::from(argument_count));

    for _ in 0..argument_count {
        match reader.argument() {
            Some(text) => parts.push(text),
            None => break,
        }
    }
    parts.join(" ")
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(self.endianness.read_u16(bytes))
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(self.endianness.read_u32(bytes))
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        Some(match self.endianness {
            Endianness::Little => LittleEndian::read_u64(bytes),
            Endianness::Big => BigEndian::read_u64(bytes),
        })
    }

    fn argument(&mut self) -> Option<String> {
        let type_info = self.u32()?;
        let width = match type_info & TYLE_MASK {
            1 => 1,
            2 => 2,
            3 => 4,
            4 => 8,
            5 => 16,
            _ => 0,
        };

        if type_info & TYPE_FIXP != 0 {
            return None;
        }

        if type_info & TYPE_STRG != 0 {
            let len = usize::from(self.u16()?);
            if type_info & TYPE_VARI != 0 {
                let name_len = usize::from(self.u16()?);
                self.take(name_len)?;
            }
            let bytes = self.take(len)?;
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            return Some(String::from_utf8_lossy(&bytes[..end]).into_owned());
        }

        if type_info & TYPE_RAWD != 0 {
            let len = usize::from(self.u16()?);
            if type_info & TYPE_VARI != 0 {
                let name_len = usize::from(self.u16()?);
                self.take(name_len)?;
            }
            let bytes = self.take(len)?;
            return Some(bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(""));
        }

        let numeric = TYPE_BOOL | TYPE_SINT | TYPE_UINT | TYPE_FLOA;
        if type_info & numeric == 0 || width == 0 {
            return None;
        }

        if type_info & TYPE_VARI != 0 {
            let name_len = usize::from(self.u16()?);
            let unit_len = if type_info & TYPE_BOOL == 0 { usize::from(self.u16()?) } else { 0 };
            self.take(name_len + unit_len)?;
        }

        if type_info & TYPE_BOOL != 0 {
            let value = self.take(width)?;
            return Some(if value.iter().any(|b| *b != 0) { "true" } else { "false" }.to_string());
        }

        if type_info & TYPE_FLOA != 0 {
            return match width {
                4 => Some(f32::from_bits(self.u32()?).to_string()),
                8 => Some(f64::from_bits(self.u64()?).to_string()),
                _ => None,
            };
        }

        let signed = type_info & TYPE_SINT != 0;
        let text = match width {
            1 => {
                let v = self.take(1)?[0];
                if signed { (v as i8).to_string() } else { v.to_string() }
            }
            2 => {
                let v = self.u16()?;
                if signed { (v as i16).to_string() } else { v.to_string() }
            }
            4 => {
                let v = self.u32()?;
                if signed { (v as i32).to_string() } else { v.to_string() }
            }
            8 => {
                let v = self.u64()?;
                if signed { (v as i64).to_string() } else { v.to_string() }
            }
            16 => {
                let bytes = self.take(16)?;
                bytes.iter().map(|b| format!("{:02x}", b)).collect()
            }
            _ => return None,
        };
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_arg(text: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TYPE_STRG.to_le_bytes());
        out.extend_from_slice(&((text.len() + 1) as u16).to_le_bytes());
        out.extend_from_slice(text.as_bytes());
        out.push(0);
        out
    }

    #[test]
    fn test_render_string_and_int() {
        let mut payload = string_arg("engine started");
        payload.extend_from_slice(&(TYPE_SINT | 3).to_le_bytes());
        payload.extend_from_slice(&(-42i32).to_le_bytes());

        assert_eq!(render_verbose(&payload, 2, Endianness::Little), "engine started -42");
    }

    #[test]
    fn test_render_big_endian_uint() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(TYPE_UINT | 2).to_be_bytes());
        payload.extend_from_slice(&513u16.to_be_bytes());
        assert_eq!(render_verbose(&payload, 1, Endianness::Big), "513");
    }

    #[test]
    fn test_truncated_argument_stops_rendering() {
        let mut payload = string_arg("ok");
        payload.extend_from_slice(&(TYPE_UINT | 3).to_le_bytes());
        payload.push(1);
        assert_eq!(render_verbose(&payload, 2, Endianness::Little), "ok");
    }

    #[test]
    fn test_non_verbose_and_printable() {
        let mut payload = 1234u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"ab\x01c");
        assert_eq!(render_non_verbose(&payload, Endianness::Little), "[1234] ab.c");
        assert_eq!(printable(b"\x00x"), ".x");
    }
}
