//! POSIX shell quoting.

/// Wrap `value` in single quotes so a POSIX shell passes it through as one
/// literal word. Embedded `'` becomes `'\''`.
///
/// Unlike escape-only-if-needed helpers this always quotes, so the output
/// shape does not depend on the input.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote each word and join them with spaces.
pub fn join_quoted<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|word| shell_quote(word.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
