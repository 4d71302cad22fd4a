//! Lens correction (.cor) file decoding.
//!
//! Two on-disk formats exist: the newer one labelled `LMC1COR_1.0` stores
//! the grid as doubles, the legacy one as 32-bit integers. Both decode to
//! the same 65x65 table of (dx, dy) words that is streamed to the board
//! with `WriteCorTable` / `WriteCorLine`.

use std::fs;
use std::io;
use std::path::Path;

pub const COR_TABLE_DIM: usize = 65;
pub const COR_TABLE_CELLS: usize = COR_TABLE_DIM * COR_TABLE_DIM;

const FLOAT_LABEL: &str = "LMC1COR_1.0";
const LABEL_LEN: usize = 0x16;
const FLOAT_HEADER_LEN: usize = 0x1FA;
const INT_HEADER_LEN: usize = 0xE;

/// A decoded 65x65 correction grid in row-major order.
#[derive(Clone, Debug)]
pub struct CorTable {
    entries: Vec<(u16, u16)>,
}

impl CorTable {
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < LABEL_LEN {
            return Err(truncated());
        }
        let entries = if is_float_label(&bytes[..LABEL_LEN]) {
            read_float_table(&bytes[LABEL_LEN + FLOAT_HEADER_LEN..])?
        } else {
            read_int_table(&bytes[LABEL_LEN + INT_HEADER_LEN..])?
        };
        Ok(CorTable { entries })
    }

    /// Row-major (dx, dy) cells, always exactly 65x65 of them.
    pub fn entries(&self) -> &[(u16, u16)] {
        &self.entries
    }
}

/// Extract the field scale recorded in a correction file.
pub fn scale_from_file(path: impl AsRef<Path>) -> io::Result<f64> {
    let bytes = fs::read(path)?;
    if bytes.len() < LABEL_LEN {
        return Err(truncated());
    }
    if is_float_label(&bytes[..LABEL_LEN]) {
        // 63 doubles follow a 2-byte gap; the scale is the 44th.
        let offset = LABEL_LEN + 2 + 43 * 8;
        read_f64(&bytes, offset)
    } else {
        read_f64(&bytes, LABEL_LEN + 6)
    }
}

fn is_float_label(raw: &[u8]) -> bool {
    let mut units = [0u16; LABEL_LEN / 2];
    for (i, unit) in units.iter_mut().enumerate() {
        *unit = u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
    }
    String::from_utf16(&units).is_ok_and(|label| label == FLOAT_LABEL)
}

fn read_float_table(body: &[u8]) -> io::Result<Vec<(u16, u16)>> {
    if body.len() < COR_TABLE_CELLS * 16 {
        return Err(truncated());
    }
    let mut entries = Vec::with_capacity(COR_TABLE_CELLS);
    for cell in 0..COR_TABLE_CELLS {
        let dx = read_f64(body, cell * 16)?.round() as i64;
        let dy = read_f64(body, cell * 16 + 8)?.round() as i64;
        entries.push((fold(dx), fold(dy)));
    }
    Ok(entries)
}

fn read_int_table(body: &[u8]) -> io::Result<Vec<(u16, u16)>> {
    if body.len() < COR_TABLE_CELLS * 8 {
        return Err(truncated());
    }
    let mut entries = Vec::with_capacity(COR_TABLE_CELLS);
    for cell in 0..COR_TABLE_CELLS {
        let dx = read_i32(body, cell * 8) as i64;
        let dy = read_i32(body, cell * 8 + 4) as i64;
        entries.push((fold(dx), fold(dy)));
    }
    Ok(entries)
}

/// Negative offsets are encoded as magnitude + 0x8000.
fn fold(v: i64) -> u16 {
    let folded = if v >= 0 { v } else { -v + 0x8000 };
    (folded & 0xFFFF) as u16
}

fn read_f64(raw: &[u8], offset: usize) -> io::Result<f64> {
    let slice = raw.get(offset..offset + 8).ok_or_else(truncated)?;
    Ok(f64::from_le_bytes(slice.try_into().unwrap()))
}

fn read_i32(raw: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap())
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "correction file truncated")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_label_bytes() -> Vec<u8> {
        FLOAT_LABEL
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect()
    }

    #[test]
    fn decodes_int_format() {
        let mut bytes = vec![0u8; LABEL_LEN + INT_HEADER_LEN];
        for cell in 0..COR_TABLE_CELLS as i32 {
            bytes.extend_from_slice(&cell.to_le_bytes());
            bytes.extend_from_slice(&(-2i32).to_le_bytes());
        }
        let table = CorTable::from_bytes(&bytes).unwrap();
        assert_eq!(table.entries().len(), COR_TABLE_CELLS);
        assert_eq!(table.entries()[5], (5, 0x8002));
    }

    #[test]
    fn decodes_float_format() {
        let mut bytes = float_label_bytes();
        bytes.extend(std::iter::repeat_n(0u8, FLOAT_HEADER_LEN));
        for _ in 0..COR_TABLE_CELLS {
            bytes.extend_from_slice(&3.6f64.to_le_bytes());
            bytes.extend_from_slice(&(-1.2f64).to_le_bytes());
        }
        let table = CorTable::from_bytes(&bytes).unwrap();
        assert_eq!(table.entries()[0], (4, 0x8001));
        assert_eq!(table.entries()[COR_TABLE_CELLS - 1], (4, 0x8001));
    }

    #[test]
    fn truncated_file_is_an_error() {
        let bytes = vec![0u8; 100];
        assert!(CorTable::from_bytes(&bytes).is_err());
    }

    #[test]
    fn scale_lives_at_fixed_offsets() {
        // int format: one double after a 6-byte gap
        let mut bytes = vec![0u8; LABEL_LEN + 6];
        bytes.extend_from_slice(&0.04f64.to_le_bytes());
        let dir = std::env::temp_dir().join("lmc_galvo_cor_scale_test.cor");
        std::fs::write(&dir, &bytes).unwrap();
        assert_eq!(scale_from_file(&dir).unwrap(), 0.04);
        let _ = std::fs::remove_file(&dir);
    }
}
