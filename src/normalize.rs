use url::{Host, Url};

use crate::{
    model::{DerivedFields, ParameterKind, Protocol},
    params, raw_request,
};

/// Components of a captured URL. Anything that cannot be recovered is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: String,
}

/// Splits `full_url` into scheme, hostname, path and query.
///
/// Absolute URLs go through the WHATWG parser. Anything it rejects (relative
/// references, bad ports, stray characters) falls back to a plain split so that
/// whatever components are visible still come through.
pub fn url_parts(full_url: &str) -> UrlParts {
    match Url::parse(full_url) {
        Ok(url) => UrlParts {
            scheme: url.scheme().to_owned(),
            host: match url.host() {
                Some(Host::Domain(domain)) => domain.to_owned(),
                Some(Host::Ipv4(addr)) => addr.to_string(),
                Some(Host::Ipv6(addr)) => addr.to_string(),
                None => String::new(),
            },
            path: url.path().to_owned(),
            query: url.query().unwrap_or_default().to_owned(),
        },
        Err(err) => {
            tracing::debug!(error = %err, "captured URL is not absolute; splitting leniently");
            lenient_url_parts(full_url)
        }
    }
}

fn lenient_url_parts(full_url: &str) -> UrlParts {
    let full_url = full_url.trim();
    let without_fragment = full_url
        .split_once('#')
        .map_or(full_url, |(before, _)| before);
    let (before_query, query) = without_fragment
        .split_once('?')
        .unwrap_or((without_fragment, ""));

    let (scheme, rest) = match before_query.split_once("://") {
        Some((scheme, rest)) if is_scheme(scheme) => (scheme.to_ascii_lowercase(), Some(rest)),
        _ => match before_query.strip_prefix("//") {
            Some(rest) => (String::new(), Some(rest)),
            None => (String::new(), None),
        },
    };

    let (host, path) = match rest {
        Some(rest) => {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, ""),
            };
            (hostname_from_authority(authority), path.to_owned())
        }
        None => (String::new(), before_query.to_owned()),
    };

    UrlParts {
        scheme,
        host,
        path,
        query: query.to_owned(),
    }
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn hostname_from_authority(authority: &str) -> String {
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host_port)| host_port);
    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        bracketed.split_once(']').map_or("", |(host, _)| host)
    } else {
        host_port
            .split_once(':')
            .map_or(host_port, |(host, _)| host)
    };
    host.to_ascii_lowercase()
}

/// Fields derived before the request row is written.
pub fn pre_populate(full_url: &str, content: &str) -> DerivedFields {
    let parsed = raw_request::parse(content.as_bytes());
    derived_fields(&url_parts(full_url), &parsed)
}

fn derived_fields(url: &UrlParts, parsed: &raw_request::ParsedRequest<'_>) -> DerivedFields {
    DerivedFields {
        user_agent: parsed.user_agent().to_owned(),
        method: parsed.method.clone(),
        protocol: Protocol::from_scheme(&url.scheme),
        host: url.host.clone(),
        path: url.path.clone(),
    }
}

/// Decomposed parameters for a request, computed once the row has an id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Population {
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
}

impl Population {
    pub fn of_kind(&self, kind: ParameterKind) -> &[(String, String)] {
        match kind {
            ParameterKind::Query => &self.query,
            ParameterKind::Form => &self.form,
        }
    }
}

pub fn post_populate(full_url: &str, content: &str) -> Population {
    let parsed = raw_request::parse(content.as_bytes());
    population(&url_parts(full_url).query, parsed.into_body())
}

fn population(query: &str, body: &[u8]) -> Population {
    let body = String::from_utf8_lossy(body);
    Population {
        query: params::decompose(query),
        form: params::decompose(body.trim()),
    }
}

/// Both normalization phases for one request, from a single parse of its content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub derived: DerivedFields,
    pub population: Population,
}

/// Runs `pre_populate` and `post_populate` together. The store calls this before it
/// takes the SQLite write lock.
pub fn prepare(full_url: &str, content: &str) -> Normalized {
    let url = url_parts(full_url);
    let parsed = raw_request::parse(content.as_bytes());
    let derived = derived_fields(&url, &parsed);
    Normalized {
        derived,
        population: population(&url.query, parsed.into_body()),
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::{UrlParts, post_populate, pre_populate, prepare, url_parts};
    use crate::model::Protocol;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn derives_fields_from_url_and_content() {
        let derived = pre_populate(
            "http://x.test/a/b?x=1&y=2&x=3",
            "GET /a/b?x=1&y=2&x=3 HTTP/1.1\r\nHost: x.test\r\nUser-Agent: test-agent\r\n\r\n",
        );

        assert_eq!(derived.protocol, Some(Protocol::Http));
        assert_eq!(derived.host, "x.test");
        assert_eq!(derived.path, "/a/b");
        assert_eq!(derived.method, "GET");
        assert_eq!(derived.user_agent, "test-agent");
    }

    #[test]
    fn empty_content_yields_empty_method_and_agent() {
        let derived = pre_populate("https://x.test/", "");
        assert_eq!(derived.protocol, Some(Protocol::Https));
        assert_eq!(derived.method, "");
        assert_eq!(derived.user_agent, "");
    }

    #[test]
    fn derived_url_fields_match_direct_parse() {
        let urls = [
            "http://x.test/a/b?x=1",
            "https://Example.COM:8443/Path/To?q#frag",
            "http://user:pw@10.0.0.1/admin",
            "http://[::1]:8080/v6",
            "https://x.test",
        ];
        for raw in urls {
            let direct = Url::parse(raw).unwrap();
            let derived = pre_populate(raw, "");
            assert_eq!(
                derived.protocol.map(Protocol::as_str),
                Some(direct.scheme()),
                "url: {raw}"
            );
            assert_eq!(
                derived.host,
                direct
                    .host_str()
                    .unwrap()
                    .trim_start_matches('[')
                    .trim_end_matches(']'),
                "url: {raw}"
            );
            assert_eq!(derived.path, direct.path(), "url: {raw}");
        }
    }

    #[test]
    fn relative_and_malformed_urls_degrade_per_component() {
        assert_eq!(
            url_parts("/a/b?x=1#top"),
            UrlParts {
                scheme: String::new(),
                host: String::new(),
                path: "/a/b".to_owned(),
                query: "x=1".to_owned(),
            }
        );
        assert_eq!(
            url_parts("http://x.test:99999/p?q=1"),
            UrlParts {
                scheme: "http".to_owned(),
                host: "x.test".to_owned(),
                path: "/p".to_owned(),
                query: "q=1".to_owned(),
            }
        );
        assert_eq!(url_parts("//cdn.test/lib.js").host, "cdn.test");
        assert_eq!(url_parts(""), UrlParts::default());

        let derived = pre_populate("ftp://files.test/pub", "");
        assert_eq!(derived.protocol, None);
        assert_eq!(derived.host, "files.test");
    }

    #[test]
    fn post_populate_decomposes_query_and_trimmed_body() {
        let population = post_populate(
            "http://x.test/form?x=1&y=2&x=3",
            "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n  name=Ada+L&tag=a&tag=b\r\n",
        );
        assert_eq!(
            population.query,
            pairs(&[("x", "1"), ("y", "2"), ("x", "3")])
        );
        assert_eq!(
            population.form,
            pairs(&[("name", "Ada L"), ("tag", "a"), ("tag", "b")])
        );
    }

    #[test]
    fn post_populate_with_nothing_to_decompose_is_empty() {
        let population = post_populate("http://x.test/", "GET / HTTP/1.1\r\n\r\n");
        assert!(population.query.is_empty());
        assert!(population.form.is_empty());

        let population = post_populate("not a url", "");
        assert!(population.query.is_empty());
        assert!(population.form.is_empty());
    }

    #[test]
    fn prepare_matches_both_phases_run_separately() {
        let cases = [
            ("http://x.test/form?x=1&x=2", "POST /form HTTP/1.1\r\nUser-Agent: ua\r\n\r\na=1&b=2\r\n"),
            ("/relative?q=1", "GET /relative?q=1 HTTP/1.1\r\n\r\n"),
            ("not a url", ""),
        ];
        for (full_url, content) in cases {
            let normalized = prepare(full_url, content);
            assert_eq!(normalized.derived, pre_populate(full_url, content), "url: {full_url}");
            assert_eq!(
                normalized.population,
                post_populate(full_url, content),
                "url: {full_url}"
            );
        }
    }
}
