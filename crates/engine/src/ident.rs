use crate::{EngineError, IdentifierKind};

pub const IDENTIFIER_MAX_BYTES: usize = 63;

/// The only gate that permits a string to reach generated SQL text.
/// Everything that fails here stays out of the renderer entirely.
pub fn validate_identifier(value: &str, kind: IdentifierKind) -> Result<(), EngineError> {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > IDENTIFIER_MAX_BYTES {
        return Err(EngineError::InvalidIdentifier {
            value: value.to_string(),
            kind,
        });
    }

    let head_ok = matches!(bytes[0], b'A'..=b'Z' | b'a'..=b'z' | b'_');
    let tail_ok = bytes[1..]
        .iter()
        .all(|b| matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_'));

    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(EngineError::InvalidIdentifier {
            value: value.to_string(),
            kind,
        })
    }
}

/// Double-quotes a validated identifier. The validator already rejects
/// embedded quotes; doubling them anyway keeps the renderer safe even if
/// a caller bypasses validation.
pub fn quote_ident(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_identifiers() {
        for value in ["widgets", "_private", "Table2", "a", "snake_case_name"] {
            validate_identifier(value, IdentifierKind::Table)
                .unwrap_or_else(|_| panic!("`{}` should be accepted", value));
        }
    }

    #[test]
    fn rejects_malformed_identifiers() {
        let bad = [
            "",
            "1starts_with_digit",
            "has space",
            "has-dash",
            "semi;colon",
            "quote\"inside",
            "drop table x--",
            "sch.ema",
            "emoji\u{1f600}",
        ];
        for value in bad {
            let err = validate_identifier(value, IdentifierKind::Column)
                .expect_err(&format!("`{}` should be rejected", value));
            match err {
                EngineError::InvalidIdentifier { value: v, kind } => {
                    assert_eq!(v, value);
                    assert_eq!(kind, IdentifierKind::Column);
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }
    }

    #[test]
    fn enforces_byte_length_limit() {
        let at_limit = "a".repeat(IDENTIFIER_MAX_BYTES);
        validate_identifier(&at_limit, IdentifierKind::Schema).expect("63 bytes should pass");

        let over_limit = "a".repeat(IDENTIFIER_MAX_BYTES + 1);
        assert!(validate_identifier(&over_limit, IdentifierKind::Schema).is_err());

        // Multibyte characters are rejected by the charset rule before the
        // length rule matters, but the limit counts bytes, not chars.
        let multibyte = "é".repeat(40);
        assert!(validate_identifier(&multibyte, IdentifierKind::Schema).is_err());
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("widgets"), "\"widgets\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
