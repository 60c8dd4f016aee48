use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::error::UploadError;
use super::RowSink;
use crate::store::UploadRow;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum Protocol {
    /// line protocol over a TCP session, whole pages batched per flush
    Ilp,
    /// row-at-a-time SQL inserts over the HTTP query endpoint
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EndpointConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote session for one replication run, released when the run ends.
pub enum Session {
    Ilp(IlpSession),
    Http(HttpSession),
}

impl Session {
    /// Probe candidates in order with a lightweight liveness check; the
    /// first that answers fixes both the endpoint and the wire protocol.
    pub async fn connect(
        endpoints: &[EndpointConfig],
        table: &str,
        probe_timeout: Duration,
    ) -> Result<Session, UploadError> {
        for endpoint in endpoints {
            let probed = match endpoint.protocol {
                Protocol::Ilp => IlpSession::connect(endpoint, table, probe_timeout)
                    .await
                    .map(Session::Ilp),
                Protocol::Http => HttpSession::connect(endpoint, table, probe_timeout)
                    .await
                    .map(Session::Http),
            };
            match probed {
                Ok(session) => {
                    info!("using {:?} endpoint {}", endpoint.protocol, endpoint.addr());
                    return Ok(session);
                }
                Err(e) => warn!("endpoint {} unreachable: {e}", endpoint.addr()),
            }
        }
        Err(UploadError::NoEndpoint)
    }
}

impl RowSink for Session {
    async fn send(&mut self, rows: &[UploadRow]) -> Result<(), UploadError> {
        match self {
            Session::Ilp(session) => session.send(rows).await,
            Session::Http(session) => session.send(rows).await,
        }
    }
}

pub struct IlpSession {
    stream: TcpStream,
    table: String,
}

impl IlpSession {
    async fn connect(
        endpoint: &EndpointConfig,
        table: &str,
        probe_timeout: Duration,
    ) -> Result<Self, UploadError> {
        let stream = tokio::time::timeout(probe_timeout, TcpStream::connect(endpoint.addr()))
            .await
            .map_err(|_| {
                UploadError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })??;
        Ok(Self { stream, table: table.to_string() })
    }

    /// Batch the whole page into one buffered write and flush.
    async fn send(&mut self, rows: &[UploadRow]) -> Result<(), UploadError> {
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&escape_symbol(&self.table));
            buf.push_str(",sensor=");
            buf.push_str(&escape_symbol(&row.sensor));
            buf.push_str(",entity=");
            buf.push_str(&escape_symbol(&row.entity));
            buf.push_str(" state=\"");
            buf.push_str(&escape_field(&row.state));
            buf.push_str("\" ");
            buf.push_str(&(row.created.as_microsecond() * 1000).to_string());
            buf.push('\n');
        }
        self.stream.write_all(buf.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    base: String,
    table: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpSession {
    async fn connect(
        endpoint: &EndpointConfig,
        table: &str,
        probe_timeout: Duration,
    ) -> Result<Self, UploadError> {
        let session = Self {
            client: reqwest::Client::builder().timeout(probe_timeout).build()?,
            base: format!("http://{}", endpoint.addr()),
            table: table.to_string(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
        };
        session.exec("SELECT 1").await?;
        Ok(session)
    }

    async fn exec(&self, query: &str) -> Result<(), UploadError> {
        let mut request = self
            .client
            .get(format!("{}/exec", self.base))
            .query(&[("query", query)]);
        if let Some(ref username) = self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Some(message) = error_message(&body) {
                warn!("remote rejected query: {message}");
            }
            return Err(UploadError::Rejected(status.as_u16()));
        }
        Ok(())
    }

    /// Every row must report a successful write or the run aborts.
    async fn send(&mut self, rows: &[UploadRow]) -> Result<(), UploadError> {
        for row in rows {
            let query = format!(
                "INSERT INTO {} VALUES (cast({} as timestamp), '{}', '{}', '{}')",
                self.table,
                row.created.as_microsecond(),
                escape_quoted(&row.sensor),
                escape_quoted(&row.entity),
                escape_quoted(&row.state),
            );
            self.exec(&query).await?;
        }
        Ok(())
    }
}

/// The query endpoint reports failures as a JSON body with an `error` key.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    Some(value.get("error")?.as_str()?.to_string())
}

fn escape_symbol(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ' ' | ',' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_quoted(s: &str) -> String {
    s.replace('\'', "''")
}
