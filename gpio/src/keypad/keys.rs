use crate::keypad::keymap::{KeyCode, encode};

/// Represents the keys on a standard 4x4 membrane keypad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeypadKey {
    /// The `1` key.
    Key1,
    /// The `2` key.
    Key2,
    /// The `3` key.
    Key3,
    /// The `4` key.
    Key4,
    /// The `5` key.
    Key5,
    /// The `6` key.
    Key6,
    /// The `7` key.
    Key7,
    /// The `8` key.
    Key8,
    /// The `9` key.
    Key9,
    /// The `0` key.
    Key0,
    /// The `*` key.
    KeyAsterisk,
    /// The `#` key.
    KeyHash,
    /// The `A` key.
    KeyA,
    /// The `B` key.
    KeyB,
    /// The `C` key.
    KeyC,
    /// The `D` key.
    KeyD,
}

impl KeypadKey {
    const LAYOUT: [[KeypadKey; 4]; 4] = {
        use KeypadKey::*;
        [
            [ Key1, Key2, Key3, KeyA, ],
            [ Key4, Key5, Key6, KeyB, ],
            [ Key7, Key8, Key9, KeyC, ],
            [ KeyAsterisk, Key0, KeyHash, KeyD, ],
        ]
    };

    const ALL: [KeypadKey; 16] = {
        use KeypadKey::*;
        [
            Key1, Key2, Key3, Key4, Key5, Key6, Key7, Key8,
            Key9, Key0, KeyAsterisk, KeyHash, KeyA, KeyB, KeyC, KeyD,
        ]
    };

    /// Converts a position tuple (row, column) to a [KeypadKey], following the printed layout.
    pub fn from_position(pos: (u8, u8)) -> Option<KeypadKey> {
        if pos.0 < 4 && pos.1 < 4 {
            Some(Self::LAYOUT[pos.0 as usize][pos.1 as usize])
        } else {
            None
        }
    }

    /// Gets the Linux input key code reported for this key.
    pub fn code(self) -> KeyCode {
        use KeypadKey::*;

        match self {
            Key1 => 2,
            Key2 => 3,
            Key3 => 4,
            Key4 => 5,
            Key5 => 6,
            Key6 => 7,
            Key7 => 8,
            Key8 => 9,
            Key9 => 10,
            Key0 => 11,
            KeyA => 30,
            KeyB => 48,
            KeyC => 46,
            KeyD => 32,
            KeyAsterisk => 0x20A,
            KeyHash => 0x20B,
        }
    }

    /// Finds the key reported with the given code.
    pub fn from_code(code: KeyCode) -> Option<KeypadKey> {
        Self::ALL.into_iter().find(|key| key.code() == code)
    }

    /// Converts the [KeypadKey] to its corresponding character.
    pub fn to_char(self) -> char {
        use KeypadKey::*;

        match self {
            Key1 => '1',
            Key2 => '2',
            Key3 => '3',
            Key4 => '4',
            Key5 => '5',
            Key6 => '6',
            Key7 => '7',
            Key8 => '8',
            Key9 => '9',
            Key0 => '0',
            KeyAsterisk => '*',
            KeyHash => '#',
            KeyA => 'A',
            KeyB => 'B',
            KeyC => 'C',
            KeyD => 'D',
        }
    }

    /// Gets the encoded key map of the printed layout.
    pub fn default_keymap() -> Vec<u32> {
        let mut entries = Vec::with_capacity(16);
        for row in 0..4u8 {
            for col in 0..4u8 {
                let key = Self::LAYOUT[row as usize][col as usize];
                entries.push(encode(row, col, key.code()));
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypad::KeyMap;

    #[test]
    fn codes_round_trip_through_legend() {
        for key in KeypadKey::ALL {
            assert_eq!(KeypadKey::from_code(key.code()), Some(key));
        }
        assert_eq!(KeypadKey::from_code(0), None);
    }

    #[test]
    fn default_keymap_follows_layout() {
        let map = KeyMap::<4, 4>::build(&KeypadKey::default_keymap()).unwrap();
        assert_eq!(map.codes().len(), 16);
        // Row 2, column 3 is `C`, row 0, column 3 is `A`.
        assert_eq!(KeypadKey::from_code(map.lookup(3, 2)).map(KeypadKey::to_char), Some('C'));
        assert_eq!(map.lookup(3, 0), 0x1E);
        assert_eq!(KeypadKey::from_position((3, 0)), Some(KeypadKey::KeyAsterisk));
        assert_eq!(KeypadKey::from_position((4, 0)), None);
    }
}
