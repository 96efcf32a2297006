//! Decoding table from matrix coordinates to key codes.
//!
//! The table is built from the compact `linux,keymap` encoding: one 32-bit word per key, with
//! the row in bits 31-24, the column in bits 23-16 and the key code in bits 15-0.
use log::debug;
use thiserror::Error;

/// Logical identifier of a key, as understood by input event consumers.
pub type KeyCode = u16;

/// Sentinel for positions without a key.
pub const KEY_RESERVED: KeyCode = 0;

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum ConstructionError {
    #[error("keymap entry out of range: row {row}, col {col}")]
    OutOfRange { row: usize, col: usize },
    #[error("keymap data of {0} bytes is not made of 32-bit words")]
    Truncated(usize),
}

/// Packs a key map entry.
pub const fn encode(row: u8, col: u8, code: KeyCode) -> u32 {
    ((row as u32) << 24) | ((col as u32) << 16) | code as u32
}

/// Unpacks a key map entry into `(row, col, code)`.
pub const fn decode(entry: u32) -> (usize, usize, KeyCode) {
    let row = (entry >> 24) as usize;
    let col = ((entry >> 16) & 0xFF) as usize;
    let code = (entry & 0xFFFF) as KeyCode;
    (row, col, code)
}

/// Splits a raw property blob into big-endian 32-bit entries.
pub fn decode_be_words(bytes: &[u8]) -> Result<Vec<u32>, ConstructionError> {
    if bytes.len() % 4 != 0 {
        return Err(ConstructionError::Truncated(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

/// Immutable `(col, row)` to [KeyCode] table for a `ROWS` × `COLS` matrix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyMap<const ROWS: usize, const COLS: usize> {
    codes: [[KeyCode; ROWS]; COLS],
}

impl<const ROWS: usize, const COLS: usize> KeyMap<ROWS, COLS> {
    /// Builds the table from encoded entries.
    ///
    /// Later entries for the same position replace earlier ones. Positions without an entry
    /// decode to [KEY_RESERVED].
    ///
    /// # Errors
    /// - `ConstructionError::OutOfRange` for the first entry outside the matrix.
    pub fn build(entries: &[u32]) -> Result<Self, ConstructionError> {
        let mut codes = [[KEY_RESERVED; ROWS]; COLS];

        for &entry in entries {
            let (row, col, code) = decode(entry);
            if row >= ROWS || col >= COLS {
                return Err(ConstructionError::OutOfRange { row, col });
            }

            debug!("Keymap entry row {} col {} -> {:#06X}", row, col, code);
            codes[col][row] = code;
        }

        Ok(Self { codes })
    }

    /// Builds the table from a raw property blob of big-endian 32-bit words.
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, ConstructionError> {
        Self::build(&decode_be_words(bytes)?)
    }

    /// Gets the key code at the given position, or [KEY_RESERVED] if there is none.
    pub fn lookup(&self, col: usize, row: usize) -> KeyCode {
        self.codes
            .get(col)
            .and_then(|column| column.get(row))
            .copied()
            .unwrap_or(KEY_RESERVED)
    }

    /// Iterates over mapped positions as `(row, col, code)`, row by row.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, KeyCode)> + '_ {
        (0..ROWS)
            .flat_map(move |row| (0..COLS).map(move |col| (row, col, self.codes[col][row])))
            .filter(|&(_, _, code)| code != KEY_RESERVED)
    }

    /// Gets every distinct mapped key code, in ascending order.
    pub fn codes(&self) -> Vec<KeyCode> {
        let mut codes = self.iter().map(|(_, _, code)| code).collect::<Vec<_>>();
        codes.sort_unstable();
        codes.dedup();
        codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Map = KeyMap<4, 4>;

    #[test]
    fn unmapped_positions_decode_to_sentinel() {
        let map = Map::build(&[encode(2, 1, 0x1E)]).unwrap();
        assert_eq!(map.lookup(1, 2), 0x1E);
        assert_eq!(map.lookup(2, 1), KEY_RESERVED);
        assert_eq!(map.lookup(0, 0), KEY_RESERVED);
        assert_eq!(map.lookup(9, 9), KEY_RESERVED);
    }

    #[test]
    fn later_entries_win() {
        let map = Map::build(&[encode(0, 0, 2), encode(0, 0, 3)]).unwrap();
        assert_eq!(map.lookup(0, 0), 3);
    }

    #[test]
    fn out_of_range_aborts_build() {
        assert_eq!(
            Map::build(&[encode(0, 0, 2), encode(4, 0, 3)]),
            Err(ConstructionError::OutOfRange { row: 4, col: 0 })
        );
        assert_eq!(
            Map::build(&[encode(1, 7, 3)]),
            Err(ConstructionError::OutOfRange { row: 1, col: 7 })
        );
    }

    #[test]
    fn decodes_property_blob() {
        let bytes = [0x02, 0x01, 0x00, 0x1E, 0x03, 0x03, 0x00, 0x20];
        let map = Map::from_be_bytes(&bytes).unwrap();
        assert_eq!(map.lookup(1, 2), 0x1E);
        assert_eq!(map.lookup(3, 3), 0x20);
        assert_eq!(Map::from_be_bytes(&bytes[..6]), Err(ConstructionError::Truncated(6)));
    }

    #[test]
    fn iterates_row_by_row() {
        let map = Map::build(&[encode(1, 0, 5), encode(0, 3, 4), encode(0, 1, 4)]).unwrap();
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(0, 1, 4), (0, 3, 4), (1, 0, 5)]);
        assert_eq!(map.codes(), vec![4, 5]);
    }

    proptest! {
        #[test]
        fn build_then_lookup(
            entries in prop::collection::vec((0u8..4, 0u8..4, 1u16..=u16::MAX), 0..32)
        ) {
            let words = entries.iter().map(|&(r, c, k)| encode(r, c, k)).collect::<Vec<_>>();
            let map = Map::build(&words).unwrap();
            for row in 0..4u8 {
                for col in 0..4u8 {
                    let expected = entries
                        .iter()
                        .rev()
                        .find(|&&(r, c, _)| r == row && c == col)
                        .map(|&(_, _, k)| k)
                        .unwrap_or(KEY_RESERVED);
                    prop_assert_eq!(map.lookup(col as usize, row as usize), expected);
                }
            }
        }

        #[test]
        fn out_of_range_never_builds(
            row in 0u8..=255,
            col in 0u8..=255,
            code in any::<u16>(),
        ) {
            prop_assume!(row >= 4 || col >= 4);
            let words = [encode(0, 0, 1), encode(row, col, code)];
            prop_assert_eq!(
                Map::build(&words),
                Err(ConstructionError::OutOfRange { row: row as usize, col: col as usize })
            );
        }
    }
}
