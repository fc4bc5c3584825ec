//! Minimal NNTP session implementing [`RemoteSequenceClient`].
//!
//! Only the commands the backfill engine needs are spoken: the greeting,
//! `AUTHINFO USER/PASS`, `XFEATURE COMPRESS GZIP` for compressed sessions,
//! `GROUP`, `XHDR Date` and `QUIT`. Article bodies and overview data are the
//! scan processor's business.

use crate::remote::client::{
    CompressionMode, RemoteConnector, RemoteError, RemoteSequenceClient, SequenceRange,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const CODE_POSTING_ALLOWED: u16 = 200;
const CODE_NO_POSTING: u16 = 201;
const CODE_CLOSING: u16 = 205;
const CODE_GROUP_SELECTED: u16 = 211;
const CODE_HEADERS_FOLLOW: u16 = 221;
const CODE_AUTH_ACCEPTED: u16 = 281;
const CODE_FEATURE_ENABLED: u16 = 290;
const CODE_PASSWORD_REQUIRED: u16 = 381;
const CODE_NO_SUCH_GROUP: u16 = 411;
const CODE_NO_SUCH_ARTICLE: u16 = 423;
const CODE_NO_ARTICLE_WITH_ID: u16 = 430;

/// Where and how to reach the news server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NntpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Hands out fresh [`NntpClient`] sessions.
#[derive(Debug, Clone)]
pub struct NntpConnector {
    settings: Arc<NntpSettings>,
}

impl NntpConnector {
    pub fn new(settings: NntpSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &NntpSettings {
        &self.settings
    }
}

impl RemoteConnector for NntpConnector {
    fn connect(
        &self,
        mode: CompressionMode,
    ) -> BoxFuture<'_, Result<Box<dyn RemoteSequenceClient>, RemoteError>> {
        Box::pin(async move {
            let client = NntpClient::connect(self.settings.clone(), mode).await?;
            Ok(Box::new(client) as Box<dyn RemoteSequenceClient>)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Response {
    code: u16,
    text: String,
}

pub struct NntpClient {
    settings: Arc<NntpSettings>,
    mode: CompressionMode,
    stream: Option<BufReader<TcpStream>>,
}

impl NntpClient {
    pub async fn connect(
        settings: Arc<NntpSettings>,
        mode: CompressionMode,
    ) -> Result<Self, RemoteError> {
        let mut client = Self {
            settings,
            mode,
            stream: None,
        };
        client.open_session().await?;
        Ok(client)
    }

    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    async fn open_session(&mut self) -> Result<(), RemoteError> {
        let address = (self.settings.host.as_str(), self.settings.port);
        let socket = TcpStream::connect(address)
            .await
            .map_err(|err| RemoteError::Connect {
                detail: format!(
                    "{}:{}: {err}",
                    self.settings.host, self.settings.port
                ),
            })?;
        self.stream = Some(BufReader::new(socket));

        let greeting = self.read_response("greeting").await?;
        if greeting.code != CODE_POSTING_ALLOWED && greeting.code != CODE_NO_POSTING {
            self.stream = None;
            return Err(RemoteError::Connect {
                detail: format!("unexpected greeting {} {}", greeting.code, greeting.text),
            });
        }

        if let Some(user) = self.settings.username.clone() {
            self.authenticate(&user).await?;
        }

        if self.mode.is_compressed() {
            let reply = self.command("XFEATURE COMPRESS GZIP", "xfeature").await?;
            if reply.code != CODE_FEATURE_ENABLED {
                tracing::warn!(
                    code = reply.code,
                    reply = %reply.text,
                    "server refused header compression; continuing uncompressed"
                );
            }
        }

        tracing::debug!(
            host = %self.settings.host,
            port = self.settings.port,
            mode = %self.mode,
            "nntp session ready"
        );
        Ok(())
    }

    async fn authenticate(&mut self, user: &str) -> Result<(), RemoteError> {
        let reply = self
            .command(&format!("AUTHINFO USER {user}"), "authinfo")
            .await?;
        let reply = match reply.code {
            CODE_AUTH_ACCEPTED => return Ok(()),
            CODE_PASSWORD_REQUIRED => {
                let password = self.settings.password.clone().unwrap_or_default();
                self.command(&format!("AUTHINFO PASS {password}"), "authinfo")
                    .await?
            }
            _ => reply,
        };

        if reply.code == CODE_AUTH_ACCEPTED {
            Ok(())
        } else {
            self.stream = None;
            Err(RemoteError::Connect {
                detail: format!("authentication rejected ({} {})", reply.code, reply.text),
            })
        }
    }

    async fn command(&mut self, line: &str, operation: &'static str) -> Result<Response, RemoteError> {
        let stream = self.stream.as_mut().ok_or(RemoteError::ConnectionReset {
            operation,
            detail: "session is closed".to_owned(),
        })?;
        stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|err| io_error(operation, err))?;
        self.read_response(operation).await
    }

    async fn read_response(&mut self, operation: &'static str) -> Result<Response, RemoteError> {
        let line = self.read_line(operation).await?;
        parse_response(&line).ok_or_else(|| RemoteError::Session {
            operation,
            detail: format!("malformed response line {line:?}"),
        })
    }

    async fn read_line(&mut self, operation: &'static str) -> Result<String, RemoteError> {
        let stream = self.stream.as_mut().ok_or(RemoteError::ConnectionReset {
            operation,
            detail: "session is closed".to_owned(),
        })?;
        let mut line = String::new();
        let read = stream
            .read_line(&mut line)
            .await
            .map_err(|err| io_error(operation, err))?;
        if read == 0 {
            self.stream = None;
            return Err(RemoteError::ConnectionReset {
                operation,
                detail: "server closed the connection".to_owned(),
            });
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }

    /// Reads a dot-terminated multi-line block.
    async fn read_block(&mut self, operation: &'static str) -> Result<Vec<String>, RemoteError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line(operation).await?;
            if line == "." {
                return Ok(lines);
            }
            match line.strip_prefix("..") {
                Some(rest) => lines.push(format!(".{rest}")),
                None => lines.push(line),
            }
        }
    }

    async fn group(&mut self, name: &str) -> Result<SequenceRange, RemoteError> {
        const OPERATION: &str = "select_feed";
        let reply = self.command(&format!("GROUP {name}"), OPERATION).await?;
        match reply.code {
            CODE_GROUP_SELECTED => parse_group_reply(&reply.text).ok_or_else(|| {
                RemoteError::Session {
                    operation: OPERATION,
                    detail: format!("malformed GROUP reply {:?}", reply.text),
                }
            }),
            CODE_NO_SUCH_GROUP => Err(RemoteError::UnknownFeed {
                feed: name.to_owned(),
            }),
            code => Err(RemoteError::Protocol {
                operation: OPERATION,
                code,
                message: reply.text,
            }),
        }
    }

    async fn header_date(&mut self, sequence: u64) -> Result<DateTime<Utc>, RemoteError> {
        const OPERATION: &str = "fetch_date";
        let reply = self
            .command(&format!("XHDR Date {sequence}"), OPERATION)
            .await?;
        match reply.code {
            CODE_HEADERS_FOLLOW => {
                let lines = self.read_block(OPERATION).await?;
                lines
                    .iter()
                    .find_map(|line| parse_xhdr_date(line, sequence))
                    .ok_or(RemoteError::DateUnavailable { sequence })
            }
            CODE_NO_SUCH_ARTICLE | CODE_NO_ARTICLE_WITH_ID => {
                Err(RemoteError::DateUnavailable { sequence })
            }
            code => Err(RemoteError::Protocol {
                operation: OPERATION,
                code,
                message: reply.text,
            }),
        }
    }

    async fn quit(&mut self) -> Result<(), RemoteError> {
        if self.stream.is_none() {
            return Ok(());
        }
        let reply = self.command("QUIT", "close").await;
        self.stream = None;
        match reply {
            Ok(response) if response.code != CODE_CLOSING => {
                tracing::debug!(code = response.code, "unexpected QUIT reply");
                Ok(())
            }
            Ok(_) => Ok(()),
            // The server may hang up before answering QUIT.
            Err(RemoteError::ConnectionReset { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl RemoteSequenceClient for NntpClient {
    fn select_feed<'a>(
        &'a mut self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<SequenceRange, RemoteError>> {
        Box::pin(self.group(name))
    }

    fn fetch_date(&mut self, sequence: u64) -> BoxFuture<'_, Result<DateTime<Utc>, RemoteError>> {
        Box::pin(self.header_date(sequence))
    }

    fn reconnect(&mut self, mode: CompressionMode) -> BoxFuture<'_, Result<(), RemoteError>> {
        Box::pin(async move {
            // The old session failed or hung, so no QUIT: its reply could
            // block the dial or arrive on a later read.
            self.stream = None;
            self.mode = mode;
            self.open_session().await
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), RemoteError>> {
        Box::pin(self.quit())
    }
}

fn io_error(operation: &'static str, err: io::Error) -> RemoteError {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => RemoteError::ConnectionReset {
            operation,
            detail: err.to_string(),
        },
        _ => RemoteError::Session {
            operation,
            detail: err.to_string(),
        },
    }
}

fn parse_response(line: &str) -> Option<Response> {
    let code = line.get(..3)?.parse::<u16>().ok()?;
    let text = line.get(3..).unwrap_or_default().trim().to_owned();
    Some(Response { code, text })
}

/// `211 <count> <low> <high> <group>` without the status code.
fn parse_group_reply(text: &str) -> Option<SequenceRange> {
    let mut fields = text.split_whitespace();
    let _count = fields.next()?;
    let low = fields.next()?.parse::<u64>().ok()?;
    let high = fields.next()?.parse::<u64>().ok()?;
    Some(SequenceRange::new(low, high))
}

fn parse_xhdr_date(line: &str, sequence: u64) -> Option<DateTime<Utc>> {
    let (number, value) = line.split_once(' ')?;
    if number.trim().parse::<u64>().ok()? != sequence {
        return None;
    }
    parse_header_date(value.trim())
}

/// Parses an RFC 5322 `Date:` header value into UTC.
pub fn parse_header_date(value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() || value == "(none)" {
        return None;
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
