use serde::{Deserialize, Deserializer, de::Error};
use std::{fmt::Display, str::FromStr};

/// Trims `value`, returning `None` if nothing is left.
#[must_use]
pub fn trimmed_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Cuts `text` after `max_chars` characters, marking the cut with an ellipsis.
#[must_use]
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}…", &text[..byte_index]),
        None => text.to_owned(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString<T> {
    Number(T),
    Text(String),
    Null,
}

/// Accepts a JSON number or a string holding one. `null` reads as zero.
///
/// Postgres `numeric` columns come back as strings from some backends, and
/// aggregates over no rows come back as `null`.
pub fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr + Default,
    <T as FromStr>::Err: Display,
{
    match NumberOrString::<T>::deserialize(deserializer)? {
        NumberOrString::Number(number) => Ok(number),
        NumberOrString::Null => Ok(T::default()),
        NumberOrString::Text(text) => text.trim().parse().map_err(D::Error::custom),
    }
}
