use anyhow::{bail, Context, Result};
use serde::Serializer;

/// Parse hex bytes written as "00A40400", "00 A4 04 00", "0x00,0xA4" or
/// "00:A4-04". Empty input gives no bytes.
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits = strip_separators(text);
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in '{}'", text);
    }
    hex::decode(&digits).with_context(|| format!("Invalid hex string: '{text}'"))
}

fn strip_separators(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | ':' | '-'))
        .map(|token| {
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token)
        })
        .collect()
}

/// Parse a single byte such as a status word half ("90", "0x6A", "6a")
pub fn parse_byte(byte_str: &str) -> Result<u8> {
    match parse_hex(byte_str)?.as_slice() {
        [byte] => Ok(*byte),
        _ => bail!("Expected exactly one byte: '{}'", byte_str),
    }
}

/// Uppercase hex without separators, the form ATRs are logged and matched in
pub fn format_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Uppercase hex with one space between bytes, the form APDUs are echoed in
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Serialize bytes as an uppercase hex string
pub fn serialize_hex<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_hex(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELECT: [u8; 4] = [0x00, 0xA4, 0x04, 0x00];

    #[test]
    fn test_parse_apdu_notations() {
        for text in [
            "00A40400",
            "00 a4 04 00",
            "0x00,0xA4,0x04,0x00",
            "0X00 0XA4 0X04 0X00",
            "00:A4:04:00",
            "00-A4-04-00",
            "\t00A4\n0400\r\n",
        ] {
            assert_eq!(parse_hex(text).unwrap(), SELECT, "{text:?}");
        }
        assert!(parse_hex("").unwrap().is_empty());
        assert!(parse_hex("  ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_hex_rejects_garbage() {
        assert!(parse_hex("00A404").is_ok());
        assert!(parse_hex("00A4040").is_err());
        assert!(parse_hex("00G4").is_err());
        assert!(parse_hex("00@A4").is_err());
        assert!(parse_hex("invalid-hex").is_err());
    }

    #[test]
    fn test_parse_byte() {
        assert_eq!(parse_byte("90").unwrap(), 0x90);
        assert_eq!(parse_byte("6a").unwrap(), 0x6A);
        assert_eq!(parse_byte("0x00").unwrap(), 0x00);
        assert!(parse_byte("").is_err());
        assert!(parse_byte("9000").is_err());
        assert!(parse_byte("ZZ").is_err());
    }

    #[test]
    fn test_format_atr() {
        let atr = [0x3B, 0x8F, 0x80, 0x01];
        assert_eq!(format_hex(&atr), "3B8F8001");
        assert_eq!(format_hex_spaced(&atr), "3B 8F 80 01");
        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex_spaced(&[]), "");
    }

    #[test]
    fn test_serialize_hex() {
        let mut serializer = serde_json::Serializer::new(Vec::new());
        serialize_hex(&[0x3B, 0x8F, 0x80], &mut serializer).unwrap();
        assert_eq!(serializer.into_inner(), b"\"3B8F80\"".to_vec());
    }
}
