use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;

#[allow(clippy::expect_used)]
static HASHTAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w#])(#\w+)").expect("hashtag pattern is valid"));

/// Lower-cased `#tag` tokens found in `text`.
///
/// A tag must start at a word boundary, so `a#b` and `##b` do not count.
#[must_use]
pub fn extract_hashtags(text: &str) -> BTreeSet<String> {
    HASHTAG
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Lower-case a configured tag so it compares against message hashtags.
pub(crate) fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}
