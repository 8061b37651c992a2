/// Split `text` into parts of at most `max_len` characters.
///
/// Each cut is made at the last newline inside the limit, or hard at the
/// limit when the window has none. Whitespace at the start of the next part
/// is dropped.
#[must_use]
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max_len {
        // Byte index just past the `max_len`-th char.
        let limit = rest
            .char_indices()
            .nth(max_len)
            .map_or(rest.len(), |(i, _)| i);
        let cut = match rest[..limit].rfind('\n') {
            Some(0) | None => limit,
            Some(i) => i,
        };
        parts.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}
