use indexmap::{IndexMap, map::Entry};

/// Header map that keeps first-seen order, lets the last value win per name, and
/// compares names ASCII case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    // lowercased name -> (name as first seen, value)
    entries: IndexMap<String, (String, String)>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.entry(name.to_ascii_lowercase()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().1 = value,
            Entry::Vacant(vacant) => {
                vacant.insert((name, value));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    fn append_continuation(&mut self, lowercase_name: &str, continuation: &str) {
        if let Some((_, value)) = self.entries.get_mut(lowercase_name) {
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(continuation);
        }
    }
}

/// Best-effort view over a raw HTTP request.
///
/// Every field is always present: structurally odd input yields empty strings and an
/// empty header map rather than an error. The body is only reachable through
/// [`ParsedRequest::into_body`], which consumes the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest<'a> {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    body: &'a [u8],
}

impl<'a> ParsedRequest<'a> {
    pub fn user_agent(&self) -> &str {
        self.headers.get("user-agent").unwrap_or_default()
    }

    pub fn into_body(self) -> &'a [u8] {
        self.body
    }
}

pub fn parse(raw: &[u8]) -> ParsedRequest<'_> {
    let mut cursor = LineCursor::new(raw);

    let (method, path, version) = cursor
        .next_line()
        .map(parse_request_line)
        .unwrap_or_default();

    let mut headers = Headers::default();
    let mut last_key: Option<String> = None;
    while let Some(line) = cursor.next_line() {
        if line.is_empty() {
            return ParsedRequest {
                method,
                path,
                version,
                headers,
                body: cursor.remaining(),
            };
        }

        let line = String::from_utf8_lossy(line);
        if line.starts_with([' ', '\t']) {
            if let Some(key) = last_key.as_deref() {
                headers.append_continuation(key, line.trim());
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        headers.insert(name, value.trim());
        last_key = Some(name.to_ascii_lowercase());
    }

    ParsedRequest {
        method,
        path,
        version,
        headers,
        body: &[],
    }
}

fn parse_request_line(line: &[u8]) -> (String, String, String) {
    let line = String::from_utf8_lossy(line);
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [method, path, version] if version.starts_with("HTTP/") => (
            (*method).to_owned(),
            (*path).to_owned(),
            (*version).to_owned(),
        ),
        [method, path] => ((*method).to_owned(), (*path).to_owned(), String::new()),
        _ => {
            if !words.is_empty() {
                tracing::debug!(
                    words = words.len(),
                    "unrecognized request line in captured content"
                );
            }
            Default::default()
        }
    }
}

struct LineCursor<'a> {
    raw: &'a [u8],
    offset: usize,
}

impl<'a> LineCursor<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, offset: 0 }
    }

    /// Next line without its `\n` / `\r\n` terminator, or `None` at end of input.
    fn next_line(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.raw.len() {
            return None;
        }

        let rest = &self.raw[self.offset..];
        let (line, consumed) = match rest.iter().position(|byte| *byte == b'\n') {
            Some(idx) => (&rest[..idx], idx + 1),
            None => (rest, rest.len()),
        };
        self.offset += consumed;
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.raw[self.offset.min(self.raw.len())..]
    }
}
