use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Renders bytes in the `\x0a1b` escape form databases use for bytea text output.
pub fn encode_bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn decode_bytea_hex(input: &str) -> Result<Vec<u8>, String> {
    let Some(digits) = input.trim().strip_prefix("\\x") else {
        return Err("bytea literal must start with \\x".to_string());
    };
    if digits.len() % 2 != 0 {
        return Err("bytea literal has an odd number of hex digits".to_string());
    }
    let mut out = Vec::with_capacity(digits.len() / 2);
    let raw = digits.as_bytes();
    for pair in raw.chunks_exact(2) {
        let hi = hex_value(pair[0])?;
        let lo = hex_value(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_value(ch: u8) -> Result<u8, String> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        b'A'..=b'F' => Ok(ch - b'A' + 10),
        _ => Err(format!("invalid hex digit '{}'", ch as char)),
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_bytea_hex, encode_base64, encode_bytea_hex};

    #[test]
    fn base64_matches_standard_alphabet() {
        assert_eq!(encode_base64(b"plume-runtime"), "cGx1bWUtcnVudGltZQ==");
        assert_eq!(encode_base64(b""), "");
    }

    #[test]
    fn bytea_hex_form() {
        assert_eq!(encode_bytea_hex(&[0x00, 0xde, 0xad]), "\\x00dead");
        assert_eq!(
            decode_bytea_hex("\\x00DEad").expect("decode hex"),
            vec![0x00, 0xde, 0xad]
        );
        assert!(decode_bytea_hex("00dead").is_err());
        assert!(decode_bytea_hex("\\x0").is_err());
    }
}
