//! ZSCII text codec
//!
//! Strings are sequences of 16-bit words, each packing three 5-bit
//! Z-characters; the top bit of a word ends the string. Decoding runs a
//! shift-state machine over the characters (alphabet shifts, abbreviation
//! expansion, 10-bit ZSCII literals). Encoding packs raw input bytes into
//! the fixed-length form dictionary entries use.

use crate::fault::Fault;
use crate::memory::MemoryImage;
use bitreader::BitReader;
use log::debug;

/// Pad character for dictionary encoding, and the A2 shift in v3+.
pub const PAD_ZCHAR: u8 = 5;

/// Abbreviation expansion depth guard; abbreviations must not nest.
const MAX_ABBREV_DEPTH: u8 = 3;

const ALPHABET_A0: &str = "abcdefghijklmnopqrstuvwxyz";
const ALPHABET_A1: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
// Rows for Z-characters 6..=31; index 0 is the ZSCII-escape slot.
const ALPHABET_A2: &str = "?\n0123456789.,!?_#'\"/\\-:()";
const ALPHABET_A2_V1: &str = "?0123456789.,!?_#'\"/\\<-:()";

lazy_static! {
    /// ZSCII 155..=223: the fixed Latin-1-extended output table. Codes
    /// beyond it decode to nothing.
    static ref EXTRA_CHARS: Vec<char> =
        "äöüÄÖÜß»«ëïÿËÏáéíóúýÁÉÍÓÚÝàèìòùÀÈÌÒÙâêîôûÂÊÎÔÛåÅøØãñõÃÑÕæÆçÇþðÞÐ£œŒ¡¿"
            .chars()
            .collect();
}

/// Map a ZSCII output code to a printable character, if it has one.
pub fn zscii_to_char(code: u16) -> Option<char> {
    match code {
        0 => None,
        9 => Some('\t'),
        13 => Some('\n'),
        32..=126 => Some(code as u8 as char),
        155..=223 => EXTRA_CHARS.get(code as usize - 155).copied(),
        _ => None,
    }
}

/// Map an input character to its ZSCII code.
pub fn char_to_zscii(c: char) -> Option<u8> {
    match c {
        '\n' | '\r' => Some(13),
        ' '..='~' => Some(c as u8),
        _ => EXTRA_CHARS
            .iter()
            .position(|&e| e == c)
            .map(|index| (index + 155) as u8),
    }
}

/// The three decoding alphabets, either built in per version or read from
/// the story's custom alphabet table (v5+).
pub struct AlphabetSet {
    rows: [Vec<char>; 3],
}

impl AlphabetSet {
    pub fn builtin(version: u8) -> AlphabetSet {
        let a2 = if version == 1 {
            ALPHABET_A2_V1
        } else {
            ALPHABET_A2
        };
        AlphabetSet {
            rows: [
                ALPHABET_A0.chars().collect(),
                ALPHABET_A1.chars().collect(),
                a2.chars().collect(),
            ],
        }
    }

    /// Alphabets for a loaded story, honouring a custom table when the
    /// header names one.
    pub fn for_story(mem: &MemoryImage) -> AlphabetSet {
        let table = mem.header().alphabet_table;
        if mem.version() < 5 || table == 0 {
            return AlphabetSet::builtin(mem.version());
        }
        let mut rows = [Vec::new(), Vec::new(), Vec::new()];
        for (row, slot) in rows.iter_mut().enumerate() {
            let mut chars = Vec::with_capacity(26);
            for n in 0..26 {
                let code = mem.read_byte(table + row * 26 + n).unwrap_or(b'?') as u16;
                chars.push(zscii_to_char(code).unwrap_or('?'));
            }
            *slot = chars;
        }
        // A2 positions 6 and 7 stay escape and newline even with a custom
        // table
        rows[2][0] = '?';
        rows[2][1] = '\n';
        AlphabetSet { rows }
    }

    /// Printable character for a Z-character in 6..=31, or None for the A2
    /// escape slot.
    fn char_at(&self, alphabet: usize, zchar: u8) -> Option<char> {
        if alphabet == 2 && zchar == 6 {
            return None;
        }
        self.rows[alphabet].get(zchar as usize - 6).copied()
    }

    /// Reverse lookup for encoding: alphabet row and Z-character.
    fn find(&self, c: char) -> Option<(usize, u8)> {
        for (alphabet, row) in self.rows.iter().enumerate() {
            for (n, &entry) in row.iter().enumerate() {
                if alphabet == 2 && n == 0 {
                    continue;
                }
                if entry == c {
                    return Some((alphabet, (n + 6) as u8));
                }
            }
        }
        None
    }
}

/// Unpack one string word into its end flag and three Z-characters.
fn split_word(word: u16) -> (bool, [u8; 3]) {
    let bytes = word.to_be_bytes();
    let mut reader = BitReader::new(&bytes);
    let last = reader.read_bool().unwrap_or(true);
    let mut chars = [0u8; 3];
    for c in chars.iter_mut() {
        *c = reader.read_u8(5).unwrap_or(0);
    }
    (last, chars)
}

/// Decode the string at `addr`. Returns the text and the number of bytes
/// consumed.
pub fn decode_string(mem: &MemoryImage, addr: usize) -> Result<(String, usize), Fault> {
    decode_with_depth(mem, addr, &AlphabetSet::for_story(mem), 0)
}

fn decode_with_depth(
    mem: &MemoryImage,
    addr: usize,
    alphabets: &AlphabetSet,
    depth: u8,
) -> Result<(String, usize), Fault> {
    if depth > MAX_ABBREV_DEPTH {
        return Err(Fault::Load(format!(
            "abbreviation recursion too deep at {:#06x}",
            addr
        )));
    }

    let version = mem.version();
    let mut zchars = Vec::new();
    let mut offset = addr;
    loop {
        let word = mem.read_word(offset)?;
        offset += 2;
        let (last, chars) = split_word(word);
        zchars.extend_from_slice(&chars);
        if last {
            break;
        }
    }

    let mut text = String::new();
    // Current locked alphabet, and a pending one-shot shift
    let mut lock = 0usize;
    let mut shift: Option<usize> = None;
    // Pending abbreviation bank (1-based) and 10-bit literal state
    let mut abbrev_bank: Option<u8> = None;
    let mut literal_high: Option<u8> = None;
    let mut literal_pending = false;

    for &zc in &zchars {
        if let Some(bank) = abbrev_bank.take() {
            let index = (bank as usize - 1) * 32 + zc as usize;
            let entry = mem.header().abbrev_table + index * 2;
            let string_addr = mem.read_word(entry)? as usize * 2;
            let (expansion, _) = decode_with_depth(mem, string_addr, alphabets, depth + 1)?;
            text.push_str(&expansion);
            continue;
        }
        if literal_pending {
            if let Some(high) = literal_high.take() {
                let code = ((high as u16) << 5) | zc as u16;
                if let Some(c) = zscii_to_char(code) {
                    text.push(c);
                } else {
                    debug!("unmapped ZSCII literal {} dropped", code);
                }
                literal_pending = false;
            } else {
                literal_high = Some(zc);
            }
            continue;
        }

        let alphabet = shift.take().unwrap_or(lock);
        match zc {
            0 => text.push(' '),
            1 if version == 1 => text.push('\n'),
            1 => abbrev_bank = Some(1),
            2 | 3 if version >= 3 => abbrev_bank = Some(zc),
            2 | 3 => {
                // One-shot shift around the alphabet cycle
                shift = Some((alphabet + zc as usize - 1) % 3);
            }
            4 | 5 if version <= 2 => {
                // Shift lock
                lock = (alphabet + zc as usize - 3) % 3;
            }
            4 | 5 => shift = Some(zc as usize - 3),
            6 if alphabet == 2 => {
                literal_pending = true;
                literal_high = None;
            }
            _ => {
                if let Some(c) = alphabets.char_at(alphabet, zc) {
                    text.push(c);
                }
            }
        }
    }

    Ok((text, offset - addr))
}

/// Z-character resolution of a dictionary word for this version.
pub fn encoded_length(version: u8) -> usize {
    if version <= 3 {
        6
    } else {
        9
    }
}

/// Encode raw input bytes as a fixed-length dictionary word: 6 or 9
/// Z-characters packed into 4 or 6 bytes, padded with Z-character 5, end
/// bit set on the final word.
pub fn encode_word(word: &[u8], version: u8, alphabets: &AlphabetSet) -> Vec<u8> {
    let resolution = encoded_length(version);
    let mut zchars = Vec::with_capacity(resolution);

    for &b in word {
        if zchars.len() >= resolution {
            break;
        }
        let c = (b as char).to_ascii_lowercase();
        match alphabets.find(c) {
            Some((0, zc)) => zchars.push(zc),
            Some((alphabet, zc)) => {
                zchars.push(shift_for(alphabet, version));
                zchars.push(zc);
            }
            None => {
                // Out-of-alphabet byte: ZSCII escape through A2 position 6
                zchars.push(shift_for(2, version));
                zchars.push(6);
                zchars.push((b >> 5) & 0x1F);
                zchars.push(b & 0x1F);
            }
        }
    }

    zchars.truncate(resolution);
    while zchars.len() < resolution {
        zchars.push(PAD_ZCHAR);
    }

    let words = resolution / 3;
    let mut encoded = Vec::with_capacity(words * 2);
    for (n, chunk) in zchars.chunks(3).enumerate() {
        let mut packed = ((chunk[0] as u16) << 10) | ((chunk[1] as u16) << 5) | (chunk[2] as u16);
        if n == words - 1 {
            packed |= 0x8000;
        }
        encoded.push((packed >> 8) as u8);
        encoded.push(packed as u8);
    }
    encoded
}

/// The shift Z-character reaching the given alphabet from A0.
fn shift_for(alphabet: usize, version: u8) -> u8 {
    if version <= 2 {
        1 + alphabet as u8
    } else {
        3 + alphabet as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_extracts_five_bit_chars() {
        // 0x8000 | (4 << 10) | (13 << 5) | 10
        let (last, chars) = split_word(0x91AA);
        assert!(last);
        assert_eq!(chars, [4, 13, 10]);
        let (last, _) = split_word(0x11AA);
        assert!(!last);
    }

    #[test]
    fn extra_chars_table_is_complete() {
        assert_eq!(EXTRA_CHARS.len(), 69);
        assert_eq!(zscii_to_char(155), Some('ä'));
        assert_eq!(zscii_to_char(219), Some('£'));
        assert_eq!(zscii_to_char(223), Some('¿'));
        assert_eq!(zscii_to_char(224), None);
        assert_eq!(zscii_to_char(154), None);
    }

    #[test]
    fn zscii_round_trip_for_ascii() {
        for c in ['a', 'Z', '0', '!', ' '] {
            assert_eq!(zscii_to_char(char_to_zscii(c).unwrap() as u16), Some(c));
        }
    }

    #[test]
    fn v1_alphabet_has_no_newline_row() {
        let v1 = AlphabetSet::builtin(1);
        let v3 = AlphabetSet::builtin(3);
        assert_eq!(v1.char_at(2, 7), Some('0'));
        assert_eq!(v3.char_at(2, 7), Some('\n'));
        assert_eq!(v1.char_at(2, 27), Some('<'));
    }

    #[test]
    fn encoding_resolution_by_version() {
        assert_eq!(encoded_length(3), 6);
        assert_eq!(encoded_length(4), 9);
        let alphabets = AlphabetSet::builtin(3);
        assert_eq!(encode_word(b"hello", 3, &alphabets).len(), 4);
        let alphabets = AlphabetSet::builtin(5);
        assert_eq!(encode_word(b"hello", 5, &alphabets).len(), 6);
    }

    #[test]
    fn short_words_pad_with_fives() {
        let alphabets = AlphabetSet::builtin(3);
        let encoded = encode_word(b"a", 3, &alphabets);
        // 'a' = 6, then pads: [6, 5, 5] [5, 5, 5] with end bit
        assert_eq!(encoded, vec![0x18, 0xA5, 0x94, 0xA5]);
    }
}
