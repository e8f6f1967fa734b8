//! Single-byte OEM code pages for short names.
//!
//! Names are stored in a short directory entry in the OEM code page that the
//! system is configured for at the time the directory entry is created. Long
//! names are always UTF-16LE and never go through these tables.
//!
//! A [`CodePage`] is a bidirectional map between the 256 byte values and
//! their Unicode characters, plus a precomputed uppercase-character-to-byte
//! lookup used when folding names for 8.3 storage. Tables are immutable once
//! built and shared through a process-wide, insert-only registry keyed by
//! code-page id, so readers need no coordination beyond the registry lock.

use alloc::string::String;
use alloc::sync::Arc;

use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::Mutex;

/// The default OEM code page, IBM PC code page 437.
pub const DEFAULT_CODE_PAGE: u16 = 437;

/// Characters 0x80..=0xFF of IBM-437. The low half is ASCII.
const IBM437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{a0}',
];

/// A single-byte OEM encoding table.
pub struct CodePage {
    id: u16,
    to_char: [char; 256],
    from_char: HashMap<char, u8>,
    /// Maps a character (either case) to the byte of its uppercase form,
    /// when the uppercase form exists in the table.
    upper_to_byte: HashMap<char, u8>,
}

impl CodePage {
    fn build(id: u16, high: &[char; 128]) -> Self {
        let mut to_char = ['\0'; 256];
        for (b, slot) in to_char.iter_mut().enumerate() {
            *slot = if b < 0x80 {
                b as u8 as char
            } else {
                high[b - 0x80]
            };
        }

        let mut from_char = HashMap::with_capacity(256);
        for (b, &c) in to_char.iter().enumerate() {
            // First mapping wins if a table repeats a character.
            from_char.entry(c).or_insert(b as u8);
        }

        let mut upper_to_byte = HashMap::with_capacity(512);
        for &c in to_char.iter() {
            let mut upper = c.to_uppercase();
            let folded = match (upper.next(), upper.next()) {
                (Some(u), None) => u,
                _ => c,
            };
            // A table character whose uppercase form is outside the table
            // keeps its own byte, matching OEM per-byte case folding.
            if let Some(&b) = from_char.get(&folded).or_else(|| from_char.get(&c)) {
                upper_to_byte.entry(c).or_insert(b);
            }
        }

        Self {
            id,
            to_char,
            from_char,
            upper_to_byte,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Decode one stored byte.
    pub fn decode(&self, byte: u8) -> char {
        self.to_char[byte as usize]
    }

    /// Encode a character exactly, without case folding.
    pub fn encode(&self, c: char) -> Option<u8> {
        self.from_char.get(&c).copied()
    }

    /// Encode the uppercase form of a character, via the precomputed lookup.
    ///
    /// Characters outside the table (or whose uppercase form is outside the
    /// table) are unencodable and return `None`.
    pub fn encode_upper(&self, c: char) -> Option<u8> {
        self.upper_to_byte.get(&c).copied()
    }

    /// Uppercase a character through the table where possible.
    pub fn upper(&self, c: char) -> char {
        if let Some(b) = self.encode_upper(c) {
            return self.decode(b);
        }
        let mut it = c.to_uppercase();
        match (it.next(), it.next()) {
            (Some(u), None) => u,
            _ => c,
        }
    }

    /// OEM-uppercase a name for use as an index key.
    pub fn upper_str(&self, s: &str) -> String {
        s.chars().map(|c| self.upper(c)).collect()
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<u16, Arc<CodePage>>> = Mutex::new(HashMap::new());
}

/// Register a code page from its high half (0x80..=0xFF). The low half is
/// always ASCII. Returns the installed table; a page id is never replaced.
pub fn install(id: u16, high: &[char; 128]) -> Arc<CodePage> {
    let mut registry = REGISTRY.lock();
    if let Some(existing) = registry.get(&id) {
        return Arc::clone(existing);
    }
    let page = Arc::new(CodePage::build(id, high));
    registry.insert(id, Arc::clone(&page));
    page
}

/// Look up a code page by id. IBM-437 is always available.
pub fn get(id: u16) -> Option<Arc<CodePage>> {
    if id == DEFAULT_CODE_PAGE {
        return Some(install(DEFAULT_CODE_PAGE, &IBM437_HIGH));
    }
    REGISTRY.lock().get(&id).map(Arc::clone)
}

/// The default table, IBM-437.
pub fn ibm437() -> Arc<CodePage> {
    install(DEFAULT_CODE_PAGE, &IBM437_HIGH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trip() {
        let cp = ibm437();
        for b in 0x20u8..0x7F {
            assert_eq!(cp.encode(cp.decode(b)), Some(b));
        }
    }

    #[test]
    fn high_half_round_trip() {
        let cp = ibm437();
        assert_eq!(cp.decode(0x82), 'é');
        assert_eq!(cp.encode('é'), Some(0x82));
        assert_eq!(cp.decode(0xE1), 'ß');
    }

    #[test]
    fn uppercase_folding_through_table() {
        let cp = ibm437();
        assert_eq!(cp.encode_upper('a'), Some(b'A'));
        assert_eq!(cp.encode_upper('A'), Some(b'A'));
        // é uppercases to É, which is 0x90 in 437.
        assert_eq!(cp.encode_upper('é'), Some(0x90));
        // Box-drawing characters have no case but are still encodable.
        assert_eq!(cp.encode_upper('─'), Some(0xC4));
        // Outside the table entirely.
        assert_eq!(cp.encode_upper('✨'), None);
    }

    #[test]
    fn registry_is_insert_only() {
        let first = ibm437();
        let again = get(DEFAULT_CODE_PAGE).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn custom_page_installs_once() {
        let mut high = IBM437_HIGH;
        high[0] = 'Ъ';
        let page = install(60855, &high);
        assert_eq!(page.decode(0x80), 'Ъ');
        let again = install(60855, &IBM437_HIGH);
        assert!(Arc::ptr_eq(&page, &again));
    }
}
