//! Lenient AUD amount parsing and `$X,XXX.XX` formatting.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::CollectError;

/// Parse a published amount into an exact decimal.
///
/// Portal listings render amounts every which way: `$239,285`,
/// `A$42.00`, NBSP-padded cells, or with trailing notes like
/// `(GST inclusive)`. Strips currency symbols and comma separators, then
/// takes the first numeric token. Empty input is zero; input with no
/// numeric token at all is an error (callers on scrape paths treat that
/// as zero).
pub fn parse_money(raw: &str) -> Result<Decimal, CollectError> {
    let cleaned = raw
        .replace('\u{a0}', " ")
        .replace('$', "")
        .replace(',', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let mut token = String::new();
    let mut seen_digit = false;
    for ch in cleaned.chars() {
        if ch.is_ascii_digit() {
            seen_digit = true;
            token.push(ch);
        } else if ch == '-' && token.is_empty() {
            token.push(ch);
        } else if ch == '.' && seen_digit {
            token.push(ch);
        } else if seen_digit {
            break;
        } else {
            token.clear();
        }
    }

    if !seen_digit {
        return Err(CollectError::Decode(format!(
            "no numeric amount in {raw:?}"
        )));
    }

    Decimal::from_str(&token)
        .map_err(|err| CollectError::Decode(format!("amount {raw:?}: {err}")))
}

/// Format a decimal as `$X,XXX.XX` with comma thousands separators.
pub fn format_money(value: Decimal) -> String {
    let negative = value.is_sign_negative();
    let rounded = value.abs().round_dp(2);
    let rendered = format!("{rounded:.2}");
    let (int_part, frac_part) = rendered.split_once('.').unwrap_or((rendered.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if negative {
        format!("-${grouped}.{frac_part}")
    } else {
        format!("${grouped}.{frac_part}")
    }
}
