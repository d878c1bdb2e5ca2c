use std::{
    fmt,
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::params;

pub fn now_unix_ms() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time before unix epoch")?;
    Ok(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct App {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub created_at_unix_ms: i64,
    pub modified_at_unix_ms: i64,
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Client {
    pub id: i64,
    pub app_id: i64,
    pub app_code: String,
    pub username: String,
    pub created_at_unix_ms: i64,
    pub modified_at_unix_ms: i64,
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.username, self.app_code)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClientSession {
    pub id: i64,
    pub app_id: i64,
    pub app_code: String,
    pub key: String,
    pub client_id: Option<i64>,
    pub created_at_unix_ms: i64,
    pub modified_at_unix_ms: i64,
}

impl fmt::Display for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.key, self.app_code)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if scheme.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Fields computed from `full_url` and `content` on every save.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DerivedFields {
    pub method: String,
    pub protocol: Option<Protocol>,
    pub host: String,
    pub path: String,
    pub user_agent: String,
}

/// A captured request as stored. Derived fields are read-only: the only way to
/// change them is to edit `full_url` or `content` and save again.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClientRequest {
    pub id: i64,
    pub session_id: i64,
    pub remote_addr: IpAddr,
    pub full_url: String,
    pub content: String,
    #[serde(flatten)]
    derived: DerivedFields,
    pub created_at_unix_ms: i64,
    pub modified_at_unix_ms: i64,
}

impl ClientRequest {
    pub(crate) fn from_parts(
        id: i64,
        session_id: i64,
        remote_addr: IpAddr,
        full_url: String,
        content: String,
        derived: DerivedFields,
        timestamps: (i64, i64),
    ) -> Self {
        Self {
            id,
            session_id,
            remote_addr,
            full_url,
            content,
            derived,
            created_at_unix_ms: timestamps.0,
            modified_at_unix_ms: timestamps.1,
        }
    }

    pub fn derived(&self) -> &DerivedFields {
        &self.derived
    }

    pub fn method(&self) -> &str {
        &self.derived.method
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.derived.protocol
    }

    pub fn host(&self) -> &str {
        &self.derived.host
    }

    pub fn path(&self) -> &str {
        &self.derived.path
    }

    pub fn user_agent(&self) -> &str {
        &self.derived.user_agent
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.remote_addr, self.full_url)
    }
}

/// Input for saving a request. `id = None` inserts a new row; `Some` rewrites an
/// existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDraft {
    pub id: Option<i64>,
    pub session_id: i64,
    pub remote_addr: IpAddr,
    pub full_url: String,
    pub content: String,
}

impl From<ClientRequest> for RequestDraft {
    fn from(request: ClientRequest) -> Self {
        Self {
            id: Some(request.id),
            session_id: request.session_id,
            remote_addr: request.remote_addr,
            full_url: request.full_url,
            content: request.content,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    Query,
    Form,
}

impl ParameterKind {
    pub const ALL: [Self; 2] = [Self::Query, Self::Form];

    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Query => "query_parameters",
            Self::Form => "form_parameters",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Form => "form",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RequestParameter {
    pub id: i64,
    pub request_id: i64,
    pub kind: ParameterKind,
    pub key: String,
    pub value: String,
    pub position: u32,
    pub created_at_unix_ms: i64,
    pub modified_at_unix_ms: i64,
}

impl fmt::Display for RequestParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The parameters of one kind attached to a request, in position order.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ParameterList(Vec<RequestParameter>);

impl ParameterList {
    pub(crate) fn new(mut parameters: Vec<RequestParameter>) -> Self {
        parameters.sort_by_key(|parameter| (parameter.position, parameter.created_at_unix_ms));
        Self(parameters)
    }

    pub fn as_slice(&self) -> &[RequestParameter] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.0
            .iter()
            .map(|parameter| (parameter.key.as_str(), parameter.value.as_str()))
            .collect()
    }

    pub fn to_url_encoded(&self) -> String {
        params::encode(self.pairs())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RequestDetail {
    pub request: ClientRequest,
    pub query_params: ParameterList,
    pub form_params: ParameterList,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RequestSummary {
    pub id: i64,
    pub session_id: i64,
    pub method: String,
    pub full_url: String,
    pub created_at_unix_ms: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerResponse {
    pub id: i64,
    pub request_id: i64,
    pub status_code: u16,
    pub content: String,
    pub created_at_unix_ms: i64,
    pub modified_at_unix_ms: i64,
}

impl fmt::Display for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.request_id, self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::{ParameterKind, ParameterList, Protocol, RequestParameter};

    fn parameter(position: u32, key: &str, value: &str) -> RequestParameter {
        RequestParameter {
            id: i64::from(position) + 1,
            request_id: 1,
            kind: ParameterKind::Query,
            key: key.to_owned(),
            value: value.to_owned(),
            position,
            created_at_unix_ms: 0,
            modified_at_unix_ms: 0,
        }
    }

    #[test]
    fn parameter_list_orders_by_position_and_encodes() {
        let list = ParameterList::new(vec![
            parameter(2, "x", "3"),
            parameter(0, "x", "1"),
            parameter(1, "y", "a b"),
        ]);

        assert_eq!(list.pairs(), vec![("x", "1"), ("y", "a b"), ("x", "3")]);
        assert_eq!(list.to_url_encoded(), "x=1&y=a+b&x=3");
        assert_eq!(list.as_slice()[0].to_string(), "x=1");
    }

    #[test]
    fn protocol_accepts_only_http_schemes() {
        assert_eq!(Protocol::from_scheme("http"), Some(Protocol::Http));
        assert_eq!(Protocol::from_scheme("HTTPS"), Some(Protocol::Https));
        assert_eq!(Protocol::from_scheme("ftp"), None);
        assert_eq!(Protocol::from_scheme(""), None);
    }
}
