//! Text-safe encodings for embedding arbitrary bytes inside a JSON record.
//!
//! Three schemes are supported: Ascii85 (`a85`, the default — densest of the
//! three), standard base64 (`b64`), and hexadecimal (`hex`). Ascii85 is
//! implemented here directly: it uses the offset-33 alphabet `!`..`u`, the
//! `z` shorthand for an all-zero group, and `u`-padding on a partial tail
//! group. The decoder skips ASCII whitespace and accepts the `y` shorthand
//! for a four-space group for compatibility with fold-spaces encoders.

use crate::error::{Result, ShardsetError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// A text-safe byte encoding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Ascii85: 5 characters per 4 bytes.
    A85,
    /// Standard base64 with padding.
    B64,
    /// Lowercase hexadecimal.
    Hex,
}

impl Encoding {
    /// The identifier stored in the shard footer.
    pub fn name(&self) -> &'static str {
        match self {
            Self::A85 => "a85",
            Self::B64 => "b64",
            Self::Hex => "hex",
        }
    }

    /// Parses a footer identifier.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Codec`] for an unknown scheme id.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "a85" => Ok(Self::A85),
            "b64" => Ok(Self::B64),
            "hex" => Ok(Self::Hex),
            other => Err(ShardsetError::Codec(format!(
                "unsupported encoding '{other}'"
            ))),
        }
    }

    /// Encodes bytes as text.
    pub fn encode(&self, data: &[u8]) -> String {
        match self {
            Self::A85 => a85_encode(data),
            Self::B64 => BASE64.encode(data),
            Self::Hex => hex::encode(data),
        }
    }

    /// Decodes text back to bytes.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Codec`] naming the scheme if the input is
    /// malformed.
    pub fn decode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Self::A85 => a85_decode(text),
            Self::B64 => BASE64
                .decode(text.trim())
                .map_err(|e| ShardsetError::Codec(format!("malformed b64 input: {e}"))),
            Self::Hex => hex::decode(text.trim())
                .map_err(|e| ShardsetError::Codec(format!("malformed hex input: {e}"))),
        }
    }
}

fn a85_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() / 4 * 5 + 5);
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let acc = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if acc == 0 {
            out.push('z');
        } else {
            push_group(&mut out, acc, 5);
        }
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut padded = [0u8; 4];
        padded[..tail.len()].copy_from_slice(tail);
        // A partial group is never z-compressed; emit tail.len()+1 chars.
        push_group(&mut out, u32::from_be_bytes(padded), tail.len() + 1);
    }
    out
}

fn push_group(out: &mut String, mut acc: u32, keep: usize) {
    let mut digits = [0u8; 5];
    for d in digits.iter_mut().rev() {
        *d = (acc % 85) as u8;
        acc /= 85;
    }
    for &d in &digits[..keep] {
        out.push((d + 33) as char);
    }
}

fn a85_decode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() / 5 * 4 + 4);
    let mut pending: [u32; 5] = [0; 5];
    let mut filled = 0usize;
    for c in text.chars() {
        match c {
            c if c.is_ascii_whitespace() => continue,
            'z' => {
                if filled != 0 {
                    return Err(ShardsetError::Codec(
                        "malformed a85 input: 'z' inside a group".into(),
                    ));
                }
                out.extend_from_slice(&[0, 0, 0, 0]);
            }
            'y' => {
                if filled != 0 {
                    return Err(ShardsetError::Codec(
                        "malformed a85 input: 'y' inside a group".into(),
                    ));
                }
                out.extend_from_slice(b"    ");
            }
            '!'..='u' => {
                pending[filled] = (c as u32) - 33;
                filled += 1;
                if filled == 5 {
                    let acc = fold_group(&pending)?;
                    out.extend_from_slice(&acc.to_be_bytes());
                    filled = 0;
                }
            }
            other => {
                return Err(ShardsetError::Codec(format!(
                    "malformed a85 input: invalid character '{other}'"
                )));
            }
        }
    }
    if filled == 1 {
        return Err(ShardsetError::Codec(
            "malformed a85 input: truncated final group".into(),
        ));
    }
    if filled > 1 {
        let missing = 5 - filled;
        for slot in pending.iter_mut().skip(filled) {
            *slot = 84; // pad with 'u'
        }
        let acc = fold_group(&pending)?;
        out.extend_from_slice(&acc.to_be_bytes()[..4 - missing]);
    }
    Ok(out)
}

fn fold_group(digits: &[u32; 5]) -> Result<u32> {
    let mut acc: u64 = 0;
    for &d in digits {
        acc = acc * 85 + u64::from(d);
    }
    u32::try_from(acc)
        .map_err(|_| ShardsetError::Codec("malformed a85 input: group overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a85_known_vectors() {
        assert_eq!(Encoding::A85.encode(b""), "");
        assert_eq!(Encoding::A85.encode(b"hello"), "BOu!rDZ");
        assert_eq!(Encoding::A85.encode(&[0, 0, 0, 0]), "z");
        assert_eq!(Encoding::A85.decode("BOu!rDZ").unwrap(), b"hello");
        assert_eq!(Encoding::A85.decode("z").unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn a85_round_trips_all_tail_lengths() {
        let data: Vec<u8> = (0..=255u8).collect();
        for take in [0, 1, 2, 3, 4, 5, 63, 255, 256] {
            let slice = &data[..take.min(data.len())];
            let encoded = Encoding::A85.encode(slice);
            assert_eq!(Encoding::A85.decode(&encoded).unwrap(), slice, "len {take}");
        }
    }

    #[test]
    fn a85_decoder_skips_whitespace_and_folded_spaces() {
        let encoded = Encoding::A85.encode(b"hello world");
        let spaced: String = encoded
            .chars()
            .flat_map(|c| [c, '\n'])
            .collect();
        assert_eq!(Encoding::A85.decode(&spaced).unwrap(), b"hello world");
        assert_eq!(Encoding::A85.decode("y").unwrap(), b"    ");
    }

    #[test]
    fn a85_rejects_garbage() {
        for bad in ["abc~", "ab\u{7f}", "!"] {
            assert!(matches!(
                Encoding::A85.decode(bad).unwrap_err(),
                ShardsetError::Codec(_)
            ));
        }
        // 'z' may only start a group
        assert!(Encoding::A85.decode("!z").is_err());
        // group value above 2^32 - 1
        assert!(Encoding::A85.decode("uuuuu").is_err());
    }

    #[test]
    fn b64_and_hex_round_trip() {
        assert_eq!(Encoding::B64.encode(b"hello"), "aGVsbG8=");
        assert_eq!(Encoding::Hex.encode(&[0xde, 0xad]), "dead");
        let data = b"\x00\x01binary\xffpayload".to_vec();
        for scheme in [Encoding::B64, Encoding::Hex] {
            let encoded = scheme.encode(&data);
            assert_eq!(scheme.decode(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn scheme_names_round_trip() {
        for scheme in [Encoding::A85, Encoding::B64, Encoding::Hex] {
            assert_eq!(Encoding::from_name(scheme.name()).unwrap(), scheme);
        }
        assert!(Encoding::from_name("base85").is_err());
    }
}
