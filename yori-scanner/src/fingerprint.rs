//! Content fingerprinting used to recognise structurally similar DOM states.
//!
//! A DOM snapshot is reduced to a list of element tokens, the tokens are
//! shingled into overlapping pairs, every shingle is hashed with CRC-32 and the
//! hashes vote bit by bit into a single 32-bit simhash. Two snapshots are then
//! compared with a Jaccard-style ratio over their set bits.

const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Reflected CRC-32 of `text`, one character at a time.
///
/// Each character contributes its code point truncated to the low byte, so
/// ASCII input produces the standard IEEE checksum.
pub fn crc32(text: &str) -> u32 {
    let crc = text.chars().fold(0xFFFF_FFFFu32, |crc, c| {
        (crc >> 8) ^ CRC32_TABLE[((crc ^ c as u32) & 0xFF) as usize]
    });
    crc ^ 0xFFFF_FFFF
}

/// Number of set bits.
pub fn hamming_weight(n: u32) -> u32 {
    n.count_ones()
}

/// Overlapping windows of `width` consecutive tokens joined by a space.
///
/// Inputs shorter than `width` are returned unchanged.
pub fn shingle<S: AsRef<str>>(tokens: &[S], width: usize) -> Vec<String> {
    if width == 0 || tokens.len() < width {
        return tokens.iter().map(|t| t.as_ref().to_string()).collect();
    }

    tokens
        .windows(width)
        .map(|window| {
            window
                .iter()
                .map(|t| t.as_ref())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

pub fn hash_tokens<S: AsRef<str>>(tokens: &[S]) -> Vec<u32> {
    tokens.iter().map(|t| crc32(t.as_ref())).collect()
}

/// 32-bit similarity hash of a token list built from 2-token shingles.
pub fn simhash<S: AsRef<str>>(tokens: &[S]) -> u32 {
    let features = hash_tokens(&shingle(tokens, 2));
    let mut votes = [0i64; 32];

    for hash in features {
        for (bit, vote) in votes.iter_mut().enumerate() {
            if hash & (1 << bit) == 0 {
                *vote -= 1;
            } else {
                *vote += 1;
            }
        }
    }

    votes
        .iter()
        .enumerate()
        .filter(|(_, vote)| **vote > 0)
        .fold(0u32, |acc, (bit, _)| acc | (1 << bit))
}

/// Ratio of bits set in both hashes to bits set in either.
///
/// Two empty hashes are considered identical.
pub fn similarity(x: u32, y: u32) -> f64 {
    let union = hamming_weight(x | y);
    if union == 0 {
        return 1.0;
    }
    f64::from(hamming_weight(x & y)) / f64::from(union)
}
