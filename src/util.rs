// src/util.rs — Small formatting helpers shared by notifications and reports

/// Cut a string to at most `max_len` bytes without splitting a UTF-8 character.
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Currency amount with two decimals.
pub fn format_amount(amount: f64) -> String {
    format!("{amount:.2}")
}

/// Ratio as a percentage, e.g. 0.853 -> "85.3%". Unbounded ratios print as "over limit".
pub fn format_pct(ratio: f64) -> String {
    if ratio.is_finite() {
        format!("{:.1}%", ratio * 100.0)
    } else {
        "over limit".into()
    }
}
