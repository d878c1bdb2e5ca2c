use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension as _, Row, Transaction,
    TransactionBehavior, params, types::Type,
};
use crate::{
    config::Config,
    model::{
        self, App, Client, ClientRequest, ClientSession, DerivedFields, ParameterKind,
        ParameterList, Protocol, RequestDetail, RequestDraft, RequestParameter, RequestSummary,
        ServerResponse,
    },
    normalize::{self, Normalized, Population},
};

const SCHEMA_VERSION: i32 = 1;
const MIN_STATUS_CODE: u16 = 100;
const MAX_STATUS_CODE: u16 = 999;

#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    InvalidInput(String),
    ConstraintViolation(String),
    NotFound(String),
    ResponseConflict(i64),
    /// The request row was written but its parameters were not replaced.
    PartialPopulation {
        request_id: i64,
        message: String,
    },
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(message)
            | Self::ConstraintViolation(message)
            | Self::NotFound(message)
            | Self::Internal(message) => f.write_str(message),
            Self::ResponseConflict(request_id) => {
                write!(f, "request {request_id} already has a response")
            }
            Self::PartialPopulation {
                request_id,
                message,
            } => write!(
                f,
                "request {request_id} was saved but its parameters are stale: {message}"
            ),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::NotFound(_) => "not_found",
            Self::ResponseConflict(_) => "response_conflict",
            Self::PartialPopulation { .. } => "partial_population",
            Self::Internal(_) => "internal",
        }
    }
}

fn sql_error(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |err| match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => {
            StoreError::ConstraintViolation(format!("{context}: {err}"))
        }
        _ => StoreError::Internal(format!("{context}: {err}")),
    }
}

fn now_unix_ms() -> Result<i64, StoreError> {
    model::now_unix_ms().map_err(|err| StoreError::Internal(format!("{err:#}")))
}

/// One captured request as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub app_code: String,
    pub session_key: String,
    pub client_username: Option<String>,
    pub remote_addr: IpAddr,
    pub full_url: String,
    pub raw_content: String,
}

impl Storage {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(config.storage.path.clone())
    }

    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let storage = Self { db_path };
        let mut conn = open_connection(&storage.db_path)?;
        migrate(&mut conn)?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn run_blocking<T, F>(&self, label: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)
                .map_err(|err| StoreError::Internal(format!("{err:#}")))?;
            op(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Internal(format!("join {label} task: {err}")))?
    }

    pub async fn create_app(&self, code: &str, name: &str) -> Result<App, StoreError> {
        let code = code.to_owned();
        let name = name.to_owned();
        self.run_blocking("create_app", move |conn| {
            create_app_blocking(conn, &code, &name)
        })
        .await
    }

    pub async fn get_app_by_code(&self, code: &str) -> Result<Option<App>, StoreError> {
        let code = code.to_owned();
        self.run_blocking("get_app_by_code", move |conn| {
            find_app_by_code(conn, &code)
        })
        .await
    }

    pub async fn create_client(&self, app_code: &str, username: &str) -> Result<Client, StoreError> {
        let app_code = app_code.to_owned();
        let username = username.to_owned();
        self.run_blocking("create_client", move |conn| {
            create_client_blocking(conn, &app_code, &username)
        })
        .await
    }

    /// Creates a session, rejecting an `(app, key)` pair that already exists.
    pub async fn create_session(
        &self,
        app_code: &str,
        key: &str,
        client_username: Option<&str>,
    ) -> Result<ClientSession, StoreError> {
        let app_code = app_code.to_owned();
        let key = key.to_owned();
        let client_username = client_username.map(ToOwned::to_owned);
        self.run_blocking("create_session", move |conn| {
            create_session_blocking(conn, &app_code, &key, client_username.as_deref())
        })
        .await
    }

    pub async fn get_session(&self, id: i64) -> Result<Option<ClientSession>, StoreError> {
        self.run_blocking("get_session", move |conn| find_session(conn, id))
            .await
    }

    pub async fn link_sessions(&self, first: i64, second: i64) -> Result<(), StoreError> {
        self.run_blocking("link_sessions", move |conn| {
            link_sessions_blocking(conn, first, second)
        })
        .await
    }

    pub async fn linked_sessions(&self, id: i64) -> Result<Vec<ClientSession>, StoreError> {
        self.run_blocking("linked_sessions", move |conn| {
            linked_sessions_blocking(conn, id)
        })
        .await
    }

    /// Resolves app, client and session for a capture and saves a new request.
    pub async fn capture_request(&self, capture: CaptureRequest) -> Result<i64, StoreError> {
        self.run_blocking("capture_request", move |conn| {
            capture_request_blocking(conn, capture)
        })
        .await
    }

    /// Derives fields, writes the row, then replaces its parameters, all in one
    /// transaction.
    pub async fn save_request(&self, draft: RequestDraft) -> Result<ClientRequest, StoreError> {
        self.run_blocking("save_request", move |conn| {
            save_request_blocking(conn, draft)
        })
        .await
    }

    /// Re-runs only the parameter step for an already stored request.
    pub async fn repopulate_request(&self, id: i64) -> Result<RequestDetail, StoreError> {
        self.run_blocking("repopulate_request", move |conn| {
            repopulate_request_blocking(conn, id)
        })
        .await
    }

    pub async fn get_request(&self, id: i64) -> Result<Option<RequestDetail>, StoreError> {
        self.run_blocking("get_request", move |conn| {
            get_request_detail_blocking(conn, id)
        })
        .await
    }

    pub async fn latest_request(
        &self,
        session_id: Option<i64>,
    ) -> Result<Option<ClientRequest>, StoreError> {
        self.run_blocking("latest_request", move |conn| {
            latest_request_blocking(conn, session_id)
        })
        .await
    }

    pub async fn list_requests(
        &self,
        session_id: Option<i64>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RequestSummary>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let (offset, limit) = validate_pagination(offset, limit)?;
        self.run_blocking("list_requests", move |conn| {
            list_requests_blocking(conn, session_id, offset, limit)
        })
        .await
    }

    pub async fn record_response(
        &self,
        request_id: i64,
        status_code: u16,
        content: &str,
    ) -> Result<ServerResponse, StoreError> {
        let content = content.to_owned();
        self.run_blocking("record_response", move |conn| {
            record_response_blocking(conn, request_id, status_code, &content)
        })
        .await
    }

    pub async fn get_response(&self, request_id: i64) -> Result<Option<ServerResponse>, StoreError> {
        self.run_blocking("get_response", move |conn| {
            find_response(conn, request_id)
        })
        .await
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set PRAGMA foreign_keys=ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("begin schema transaction")?;
            tx.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS apps (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  code TEXT NOT NULL UNIQUE,
                  name TEXT NOT NULL,
                  created_at_unix_ms INTEGER NOT NULL,
                  modified_at_unix_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS clients (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  app_id INTEGER NOT NULL REFERENCES apps(id),
                  username TEXT NOT NULL,
                  created_at_unix_ms INTEGER NOT NULL,
                  modified_at_unix_ms INTEGER NOT NULL,
                  UNIQUE (app_id, username),
                  UNIQUE (app_id, id)
                );

                CREATE INDEX IF NOT EXISTS clients_username_idx ON clients(username);

                CREATE TABLE IF NOT EXISTS client_sessions (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  app_id INTEGER NOT NULL REFERENCES apps(id),
                  key TEXT NOT NULL,
                  client_id INTEGER,
                  created_at_unix_ms INTEGER NOT NULL,
                  modified_at_unix_ms INTEGER NOT NULL,
                  UNIQUE (app_id, key),
                  FOREIGN KEY (app_id, client_id) REFERENCES clients(app_id, id)
                );

                CREATE INDEX IF NOT EXISTS client_sessions_key_idx ON client_sessions(key);

                CREATE TABLE IF NOT EXISTS session_links (
                  low_session_id INTEGER NOT NULL REFERENCES client_sessions(id),
                  high_session_id INTEGER NOT NULL REFERENCES client_sessions(id),
                  created_at_unix_ms INTEGER NOT NULL,
                  PRIMARY KEY (low_session_id, high_session_id),
                  CHECK (low_session_id < high_session_id)
                );

                CREATE TABLE IF NOT EXISTS client_requests (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  session_id INTEGER NOT NULL REFERENCES client_sessions(id),
                  remote_addr TEXT NOT NULL,
                  full_url TEXT NOT NULL,
                  content TEXT NOT NULL,
                  method TEXT NOT NULL,
                  protocol TEXT NOT NULL CHECK (protocol IN ('', 'http', 'https')),
                  host TEXT NOT NULL,
                  path TEXT NOT NULL,
                  user_agent TEXT NOT NULL,
                  created_at_unix_ms INTEGER NOT NULL,
                  modified_at_unix_ms INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS client_requests_session_idx
                  ON client_requests(session_id, created_at_unix_ms DESC, id DESC);
                CREATE INDEX IF NOT EXISTS client_requests_created_idx
                  ON client_requests(created_at_unix_ms DESC, id DESC);
                CREATE INDEX IF NOT EXISTS client_requests_remote_addr_idx
                  ON client_requests(remote_addr);
                CREATE INDEX IF NOT EXISTS client_requests_host_idx ON client_requests(host);
                CREATE INDEX IF NOT EXISTS client_requests_path_idx ON client_requests(path);

                CREATE TABLE IF NOT EXISTS query_parameters (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  request_id INTEGER NOT NULL REFERENCES client_requests(id),
                  key TEXT NOT NULL,
                  value TEXT NOT NULL,
                  position INTEGER NOT NULL CHECK (position >= 0),
                  created_at_unix_ms INTEGER NOT NULL,
                  modified_at_unix_ms INTEGER NOT NULL,
                  UNIQUE (request_id, position)
                );

                CREATE TABLE IF NOT EXISTS form_parameters (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  request_id INTEGER NOT NULL REFERENCES client_requests(id),
                  key TEXT NOT NULL,
                  value TEXT NOT NULL,
                  position INTEGER NOT NULL CHECK (position >= 0),
                  created_at_unix_ms INTEGER NOT NULL,
                  modified_at_unix_ms INTEGER NOT NULL,
                  UNIQUE (request_id, position)
                );

                CREATE TABLE IF NOT EXISTS server_responses (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  request_id INTEGER NOT NULL UNIQUE REFERENCES client_requests(id),
                  content TEXT NOT NULL,
                  status_code INTEGER NOT NULL,
                  created_at_unix_ms INTEGER NOT NULL,
                  modified_at_unix_ms INTEGER NOT NULL
                );
                "#,
            )
            .context("create sqlite schema v1")?;
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            tx.commit().context("commit schema transaction")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported history database schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn validate_app_code(code: &str) -> Result<(), StoreError> {
    if code.is_empty() {
        return Err(StoreError::InvalidInput(
            "app code cannot be empty".to_owned(),
        ));
    }
    if !code
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_'))
    {
        return Err(StoreError::InvalidInput(format!(
            "app code `{code}` may only contain ASCII letters, digits, `-` and `_`"
        )));
    }
    Ok(())
}

fn validate_required(value: &str, field_name: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidInput(format!(
            "{field_name} cannot be empty"
        )));
    }
    Ok(())
}

fn validate_pagination(offset: usize, limit: usize) -> Result<(i64, i64), StoreError> {
    let offset = i64::try_from(offset).map_err(|_| {
        StoreError::InvalidInput("pagination offset exceeds sqlite range".to_owned())
    })?;
    let limit = i64::try_from(limit)
        .map_err(|_| StoreError::InvalidInput("pagination limit exceeds sqlite range".to_owned()))?;
    Ok((offset, limit))
}

fn begin_immediate(conn: &mut Connection) -> Result<Transaction<'_>, StoreError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sql_error("begin immediate transaction"))
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        created_at_unix_ms: row.get(3)?,
        modified_at_unix_ms: row.get(4)?,
    })
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        app_id: row.get(1)?,
        app_code: row.get(2)?,
        username: row.get(3)?,
        created_at_unix_ms: row.get(4)?,
        modified_at_unix_ms: row.get(5)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ClientSession> {
    Ok(ClientSession {
        id: row.get(0)?,
        app_id: row.get(1)?,
        app_code: row.get(2)?,
        key: row.get(3)?,
        client_id: row.get(4)?,
        created_at_unix_ms: row.get(5)?,
        modified_at_unix_ms: row.get(6)?,
    })
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<ClientRequest> {
    let remote_addr = row.get::<_, String>(2)?;
    let remote_addr = remote_addr
        .parse::<IpAddr>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?;
    let protocol = row.get::<_, String>(6)?;

    Ok(ClientRequest::from_parts(
        row.get(0)?,
        row.get(1)?,
        remote_addr,
        row.get(3)?,
        row.get(4)?,
        DerivedFields {
            method: row.get(5)?,
            protocol: Protocol::from_scheme(&protocol),
            host: row.get(7)?,
            path: row.get(8)?,
            user_agent: row.get(9)?,
        },
        (row.get(10)?, row.get(11)?),
    ))
}

fn response_from_row(row: &Row<'_>) -> rusqlite::Result<ServerResponse> {
    Ok(ServerResponse {
        id: row.get(0)?,
        request_id: row.get(1)?,
        status_code: row.get(2)?,
        content: row.get(3)?,
        created_at_unix_ms: row.get(4)?,
        modified_at_unix_ms: row.get(5)?,
    })
}

const SESSION_COLUMNS: &str = r#"
    s.id, s.app_id, a.code, s.key, s.client_id, s.created_at_unix_ms, s.modified_at_unix_ms
"#;

const REQUEST_COLUMNS: &str = r#"
    id, session_id, remote_addr, full_url, content, method, protocol, host, path, user_agent,
    created_at_unix_ms, modified_at_unix_ms
"#;

fn find_app_by_code(conn: &Connection, code: &str) -> Result<Option<App>, StoreError> {
    conn.query_row(
        r#"
        SELECT id, code, name, created_at_unix_ms, modified_at_unix_ms
        FROM apps
        WHERE code = ?1
        "#,
        params![code],
        app_from_row,
    )
    .optional()
    .map_err(sql_error("select app by code"))
}

fn require_app(conn: &Connection, code: &str) -> Result<App, StoreError> {
    find_app_by_code(conn, code)?
        .ok_or_else(|| StoreError::ConstraintViolation(format!("app `{code}` does not exist")))
}

fn find_client(conn: &Connection, app_id: i64, username: &str) -> Result<Option<Client>, StoreError> {
    conn.query_row(
        r#"
        SELECT c.id, c.app_id, a.code, c.username, c.created_at_unix_ms, c.modified_at_unix_ms
        FROM clients c
        JOIN apps a ON a.id = c.app_id
        WHERE c.app_id = ?1 AND c.username = ?2
        "#,
        params![app_id, username],
        client_from_row,
    )
    .optional()
    .map_err(sql_error("select client by username"))
}

fn find_session(conn: &Connection, id: i64) -> Result<Option<ClientSession>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {SESSION_COLUMNS} FROM client_sessions s JOIN apps a ON a.id = s.app_id WHERE s.id = ?1"
        ),
        params![id],
        session_from_row,
    )
    .optional()
    .map_err(sql_error("select session by id"))
}

fn find_session_by_key(
    conn: &Connection,
    app_id: i64,
    key: &str,
) -> Result<Option<ClientSession>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {SESSION_COLUMNS} FROM client_sessions s JOIN apps a ON a.id = s.app_id WHERE s.app_id = ?1 AND s.key = ?2"
        ),
        params![app_id, key],
        session_from_row,
    )
    .optional()
    .map_err(sql_error("select session by key"))
}

fn find_request(conn: &Connection, id: i64) -> Result<Option<ClientRequest>, StoreError> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM client_requests WHERE id = ?1"),
        params![id],
        request_from_row,
    )
    .optional()
    .map_err(sql_error("select request by id"))
}

fn find_response(conn: &Connection, request_id: i64) -> Result<Option<ServerResponse>, StoreError> {
    conn.query_row(
        r#"
        SELECT id, request_id, status_code, content, created_at_unix_ms, modified_at_unix_ms
        FROM server_responses
        WHERE request_id = ?1
        "#,
        params![request_id],
        response_from_row,
    )
    .optional()
    .map_err(sql_error("select response by request id"))
}

fn insert_app(conn: &Connection, code: &str, name: &str, now: i64) -> Result<App, StoreError> {
    conn.execute(
        r#"
        INSERT INTO apps (code, name, created_at_unix_ms, modified_at_unix_ms)
        VALUES (?1, ?2, ?3, ?3)
        "#,
        params![code, name, now],
    )
    .map_err(sql_error("insert app"))?;

    Ok(App {
        id: conn.last_insert_rowid(),
        code: code.to_owned(),
        name: name.to_owned(),
        created_at_unix_ms: now,
        modified_at_unix_ms: now,
    })
}

fn insert_client(conn: &Connection, app: &App, username: &str, now: i64) -> Result<Client, StoreError> {
    conn.execute(
        r#"
        INSERT INTO clients (app_id, username, created_at_unix_ms, modified_at_unix_ms)
        VALUES (?1, ?2, ?3, ?3)
        "#,
        params![app.id, username, now],
    )
    .map_err(sql_error("insert client"))?;

    Ok(Client {
        id: conn.last_insert_rowid(),
        app_id: app.id,
        app_code: app.code.clone(),
        username: username.to_owned(),
        created_at_unix_ms: now,
        modified_at_unix_ms: now,
    })
}

fn insert_session(
    conn: &Connection,
    app: &App,
    key: &str,
    client_id: Option<i64>,
    now: i64,
) -> Result<ClientSession, StoreError> {
    conn.execute(
        r#"
        INSERT INTO client_sessions (app_id, key, client_id, created_at_unix_ms, modified_at_unix_ms)
        VALUES (?1, ?2, ?3, ?4, ?4)
        "#,
        params![app.id, key, client_id, now],
    )
    .map_err(sql_error("insert session"))?;

    Ok(ClientSession {
        id: conn.last_insert_rowid(),
        app_id: app.id,
        app_code: app.code.clone(),
        key: key.to_owned(),
        client_id,
        created_at_unix_ms: now,
        modified_at_unix_ms: now,
    })
}

fn create_app_blocking(conn: &mut Connection, code: &str, name: &str) -> Result<App, StoreError> {
    validate_app_code(code)?;
    validate_required(name, "app name")?;
    let now = now_unix_ms()?;
    let app = insert_app(conn, code, name, now)?;
    tracing::info!(app_id = app.id, app_code = %app.code, "app created");
    Ok(app)
}

fn create_client_blocking(
    conn: &mut Connection,
    app_code: &str,
    username: &str,
) -> Result<Client, StoreError> {
    validate_required(username, "client username")?;
    let now = now_unix_ms()?;
    let tx = begin_immediate(conn)?;
    let app = require_app(&tx, app_code)?;
    let client = insert_client(&tx, &app, username, now)?;
    tx.commit().map_err(sql_error("commit create client"))?;
    Ok(client)
}

fn create_session_blocking(
    conn: &mut Connection,
    app_code: &str,
    key: &str,
    client_username: Option<&str>,
) -> Result<ClientSession, StoreError> {
    validate_required(key, "session key")?;
    let now = now_unix_ms()?;
    let tx = begin_immediate(conn)?;
    let app = require_app(&tx, app_code)?;
    let client_id = match client_username {
        Some(username) => Some(
            find_client(&tx, app.id, username)?
                .ok_or_else(|| {
                    StoreError::ConstraintViolation(format!(
                        "client `{username}` does not exist in app `{app_code}`"
                    ))
                })?
                .id,
        ),
        None => None,
    };
    let session = insert_session(&tx, &app, key, client_id, now)?;
    tx.commit().map_err(sql_error("commit create session"))?;
    tracing::debug!(session_id = session.id, app_code, "session created");
    Ok(session)
}

fn link_sessions_blocking(conn: &mut Connection, first: i64, second: i64) -> Result<(), StoreError> {
    if first == second {
        return Err(StoreError::InvalidInput(format!(
            "session {first} cannot be linked to itself"
        )));
    }

    let now = now_unix_ms()?;
    let tx = begin_immediate(conn)?;
    let (low, high) = (first.min(second), first.max(second));
    let low_session = find_session(&tx, low)?
        .ok_or_else(|| StoreError::ConstraintViolation(format!("session {low} does not exist")))?;
    let high_session = find_session(&tx, high)?
        .ok_or_else(|| StoreError::ConstraintViolation(format!("session {high} does not exist")))?;
    if low_session.app_id != high_session.app_id {
        return Err(StoreError::ConstraintViolation(format!(
            "sessions {low} and {high} belong to different apps"
        )));
    }

    tx.execute(
        r#"
        INSERT INTO session_links (low_session_id, high_session_id, created_at_unix_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (low_session_id, high_session_id) DO NOTHING
        "#,
        params![low, high, now],
    )
    .map_err(sql_error("insert session link"))?;
    tx.commit().map_err(sql_error("commit session link"))
}

fn linked_sessions_blocking(conn: &mut Connection, id: i64) -> Result<Vec<ClientSession>, StoreError> {
    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM session_links l
            JOIN client_sessions s ON s.id = CASE
              WHEN l.low_session_id = ?1 THEN l.high_session_id
              ELSE l.low_session_id
            END
            JOIN apps a ON a.id = s.app_id
            WHERE l.low_session_id = ?1 OR l.high_session_id = ?1
            ORDER BY s.id
            "#
        ))
        .map_err(sql_error("prepare linked sessions"))?;

    let sessions = stmt
        .query_map(params![id], session_from_row)
        .map_err(sql_error("query linked sessions"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error("read linked sessions"))?;
    Ok(sessions)
}

/// Looks up or creates the app, client and session named by a capture. An anonymous
/// session is claimed by the first client that shows up with it.
fn resolve_capture_session(
    tx: &Transaction<'_>,
    capture: &CaptureRequest,
    now: i64,
) -> Result<ClientSession, StoreError> {
    let app = match find_app_by_code(tx, &capture.app_code)? {
        Some(app) => app,
        None => insert_app(tx, &capture.app_code, &capture.app_code, now)?,
    };

    let client = match capture.client_username.as_deref() {
        Some(username) => Some(match find_client(tx, app.id, username)? {
            Some(client) => client,
            None => insert_client(tx, &app, username, now)?,
        }),
        None => None,
    };
    let client_id = client.as_ref().map(|client| client.id);

    let Some(session) = find_session_by_key(tx, app.id, &capture.session_key)? else {
        return insert_session(tx, &app, &capture.session_key, client_id, now);
    };

    match (session.client_id, client_id) {
        (None, Some(client_id)) => {
            tx.execute(
                r#"
                UPDATE client_sessions
                SET client_id = ?1, modified_at_unix_ms = ?2
                WHERE id = ?3
                "#,
                params![client_id, now, session.id],
            )
            .map_err(sql_error("attach client to session"))?;
            Ok(ClientSession {
                client_id: Some(client_id),
                modified_at_unix_ms: now,
                ..session
            })
        }
        (Some(existing), Some(requested)) if existing != requested => {
            Err(StoreError::ConstraintViolation(format!(
                "session `{}` in app `{}` belongs to another client",
                session.key, session.app_code
            )))
        }
        _ => Ok(session),
    }
}

fn capture_request_blocking(
    conn: &mut Connection,
    capture: CaptureRequest,
) -> Result<i64, StoreError> {
    validate_app_code(&capture.app_code)?;
    validate_required(&capture.session_key, "session key")?;
    if let Some(username) = capture.client_username.as_deref() {
        validate_required(username, "client username")?;
    }

    let normalized = normalize::prepare(&capture.full_url, &capture.raw_content);
    let now = now_unix_ms()?;
    let mut tx = begin_immediate(conn)?;
    let session = resolve_capture_session(&tx, &capture, now)?;
    let draft = RequestDraft {
        id: None,
        session_id: session.id,
        remote_addr: capture.remote_addr,
        full_url: capture.full_url,
        content: capture.raw_content,
    };
    let (request, populated) = save_request_in(&mut tx, draft, normalized, now)?;
    tx.commit().map_err(sql_error("commit capture"))?;

    populated.map(|()| request.id)
}

fn save_request_blocking(
    conn: &mut Connection,
    draft: RequestDraft,
) -> Result<ClientRequest, StoreError> {
    let normalized = normalize::prepare(&draft.full_url, &draft.content);
    let now = now_unix_ms()?;
    let mut tx = begin_immediate(conn)?;
    let (request, populated) = save_request_in(&mut tx, draft, normalized, now)?;
    tx.commit().map_err(sql_error("commit save request"))?;

    populated.map(|()| request)
}

/// Writes the request row and replaces its parameters inside `tx`. `normalized`
/// must come from `draft`'s own url and content.
///
/// A failure writing the row is returned as the outer error and leaves `tx` to be
/// rolled back. A failure replacing parameters is rolled back to a savepoint and
/// returned as the inner result so the caller can still commit the row.
fn save_request_in(
    tx: &mut Transaction<'_>,
    draft: RequestDraft,
    normalized: Normalized,
    now: i64,
) -> Result<(ClientRequest, Result<(), StoreError>), StoreError> {
    let Normalized {
        derived,
        population,
    } = normalized;
    let protocol = derived.protocol.map(Protocol::as_str).unwrap_or_default();
    let remote_addr = draft.remote_addr.to_string();

    let (id, created_at_unix_ms) = match draft.id {
        None => {
            tx.execute(
                r#"
                INSERT INTO client_requests (
                  session_id,
                  remote_addr,
                  full_url,
                  content,
                  method,
                  protocol,
                  host,
                  path,
                  user_agent,
                  created_at_unix_ms,
                  modified_at_unix_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                "#,
                params![
                    draft.session_id,
                    remote_addr,
                    draft.full_url,
                    draft.content,
                    derived.method,
                    protocol,
                    derived.host,
                    derived.path,
                    derived.user_agent,
                    now,
                ],
            )
            .map_err(sql_error("insert request"))?;
            (tx.last_insert_rowid(), now)
        }
        Some(id) => {
            let created_at_unix_ms = tx
                .query_row(
                    "SELECT created_at_unix_ms FROM client_requests WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(sql_error("select request for update"))?
                .ok_or_else(|| StoreError::NotFound(format!("request {id} was not found")))?;
            tx.execute(
                r#"
                UPDATE client_requests
                SET session_id = ?1,
                    remote_addr = ?2,
                    full_url = ?3,
                    content = ?4,
                    method = ?5,
                    protocol = ?6,
                    host = ?7,
                    path = ?8,
                    user_agent = ?9,
                    modified_at_unix_ms = ?10
                WHERE id = ?11
                "#,
                params![
                    draft.session_id,
                    remote_addr,
                    draft.full_url,
                    draft.content,
                    derived.method,
                    protocol,
                    derived.host,
                    derived.path,
                    derived.user_agent,
                    now,
                    id,
                ],
            )
            .map_err(sql_error("update request"))?;
            (id, created_at_unix_ms)
        }
    };

    let populated = replace_all_parameters(tx, id, &population, now).map_err(|err| {
        tracing::warn!(request_id = id, error = %err, "request saved without parameter refresh");
        StoreError::PartialPopulation {
            request_id: id,
            message: err.to_string(),
        }
    });
    if populated.is_ok() {
        tracing::info!(
            request_id = id,
            query_params = population.query.len(),
            form_params = population.form.len(),
            "request saved"
        );
    }

    let request = ClientRequest::from_parts(
        id,
        draft.session_id,
        draft.remote_addr,
        draft.full_url,
        draft.content,
        derived,
        (created_at_unix_ms, now),
    );
    Ok((request, populated))
}

/// Deletes and reinserts both parameter tables for one request as a single unit.
fn replace_all_parameters(
    tx: &mut Transaction<'_>,
    request_id: i64,
    population: &Population,
    now: i64,
) -> rusqlite::Result<()> {
    let savepoint = tx.savepoint()?;
    for kind in ParameterKind::ALL {
        let table = kind.table();
        savepoint.execute(
            &format!("DELETE FROM {table} WHERE request_id = ?1"),
            params![request_id],
        )?;

        let mut insert = savepoint.prepare(&format!(
            r#"
            INSERT INTO {table} (
              request_id, key, value, position, created_at_unix_ms, modified_at_unix_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#
        ))?;
        for (position, (key, value)) in population.of_kind(kind).iter().enumerate() {
            insert.execute(params![request_id, key, value, position as i64, now])?;
        }
    }
    savepoint.commit()
}

fn repopulate_request_blocking(conn: &mut Connection, id: i64) -> Result<RequestDetail, StoreError> {
    let not_found = || StoreError::NotFound(format!("request {id} was not found"));
    let request = find_request(conn, id)?.ok_or_else(not_found)?;
    let mut population = normalize::post_populate(&request.full_url, &request.content);

    let now = now_unix_ms()?;
    let mut tx = begin_immediate(conn)?;
    let current = find_request(&tx, id)?.ok_or_else(not_found)?;
    if current.full_url != request.full_url || current.content != request.content {
        population = normalize::post_populate(&current.full_url, &current.content);
    }
    replace_all_parameters(&mut tx, id, &population, now).map_err(|err| {
        StoreError::PartialPopulation {
            request_id: id,
            message: err.to_string(),
        }
    })?;
    tx.commit().map_err(sql_error("commit repopulate"))?;
    tracing::info!(request_id = id, "request parameters repopulated");

    get_request_detail_blocking(conn, id)?.ok_or_else(not_found)
}

fn load_parameters(
    conn: &Connection,
    kind: ParameterKind,
    request_id: i64,
) -> Result<ParameterList, StoreError> {
    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT id, request_id, key, value, position, created_at_unix_ms, modified_at_unix_ms
            FROM {}
            WHERE request_id = ?1
            ORDER BY position, created_at_unix_ms
            "#,
            kind.table()
        ))
        .map_err(sql_error("prepare select parameters"))?;

    let parameters = stmt
        .query_map(params![request_id], |row| {
            Ok(RequestParameter {
                id: row.get(0)?,
                request_id: row.get(1)?,
                kind,
                key: row.get(2)?,
                value: row.get(3)?,
                position: row.get(4)?,
                created_at_unix_ms: row.get(5)?,
                modified_at_unix_ms: row.get(6)?,
            })
        })
        .map_err(sql_error("query parameters"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error("read parameters"))?;
    Ok(ParameterList::new(parameters))
}

fn get_request_detail_blocking(
    conn: &mut Connection,
    id: i64,
) -> Result<Option<RequestDetail>, StoreError> {
    let Some(request) = find_request(conn, id)? else {
        return Ok(None);
    };

    Ok(Some(RequestDetail {
        query_params: load_parameters(conn, ParameterKind::Query, id)?,
        form_params: load_parameters(conn, ParameterKind::Form, id)?,
        request,
    }))
}

fn latest_request_blocking(
    conn: &mut Connection,
    session_id: Option<i64>,
) -> Result<Option<ClientRequest>, StoreError> {
    conn.query_row(
        &format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM client_requests
            WHERE (?1 IS NULL OR session_id = ?1)
            ORDER BY created_at_unix_ms DESC, id DESC
            LIMIT 1
            "#
        ),
        params![session_id],
        request_from_row,
    )
    .optional()
    .map_err(sql_error("select latest request"))
}

fn list_requests_blocking(
    conn: &mut Connection,
    session_id: Option<i64>,
    offset: i64,
    limit: i64,
) -> Result<Vec<RequestSummary>, StoreError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, session_id, method, full_url, created_at_unix_ms
            FROM client_requests
            WHERE (?1 IS NULL OR session_id = ?1)
            ORDER BY created_at_unix_ms DESC, id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .map_err(sql_error("prepare list requests"))?;

    let summaries = stmt
        .query_map(params![session_id, limit, offset], |row| {
            Ok(RequestSummary {
                id: row.get(0)?,
                session_id: row.get(1)?,
                method: row.get(2)?,
                full_url: row.get(3)?,
                created_at_unix_ms: row.get(4)?,
            })
        })
        .map_err(sql_error("query list requests"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error("read list requests"))?;
    Ok(summaries)
}

fn record_response_blocking(
    conn: &mut Connection,
    request_id: i64,
    status_code: u16,
    content: &str,
) -> Result<ServerResponse, StoreError> {
    if !(MIN_STATUS_CODE..=MAX_STATUS_CODE).contains(&status_code) {
        return Err(StoreError::InvalidInput(format!(
            "status code {status_code} is outside {MIN_STATUS_CODE}..={MAX_STATUS_CODE}"
        )));
    }

    let now = now_unix_ms()?;
    let tx = begin_immediate(conn)?;
    if find_request(&tx, request_id)?.is_none() {
        return Err(StoreError::NotFound(format!(
            "request {request_id} was not found"
        )));
    }

    let inserted = tx.execute(
        r#"
        INSERT INTO server_responses (
          request_id, content, status_code, created_at_unix_ms, modified_at_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?4)
        "#,
        params![request_id, content, status_code, now],
    );
    match inserted {
        Ok(_) => {}
        Err(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
            return Err(StoreError::ResponseConflict(request_id));
        }
        Err(err) => return Err(sql_error("insert response")(err)),
    }

    let response = ServerResponse {
        id: tx.last_insert_rowid(),
        request_id,
        status_code,
        content: content.to_owned(),
        created_at_unix_ms: now,
        modified_at_unix_ms: now,
    };
    tx.commit().map_err(sql_error("commit response"))?;
    tracing::info!(request_id, status_code, "response recorded");
    Ok(response)
}
