use url::form_urlencoded;

/// Splits an `application/x-www-form-urlencoded` string into ordered `(key, value)`
/// pairs.
///
/// Keys and values are percent-decoded with `+` read as a space. Source order and
/// repeated keys are preserved. Pairs with an empty value (`a=` or a bare `a`) are
/// dropped.
pub fn decompose(encoded: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(encoded.as_bytes())
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

/// Inverse of [`decompose`]: joins pairs as `key=value` with `&`, form-encoding both
/// sides.
pub fn encode<I, K, V>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key.as_ref(), value.as_ref());
    }
    serializer.finish()
}
