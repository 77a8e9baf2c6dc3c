//! Health-check targets reached through a proxy tunnel
//!
//! What counts as a healthy response is configuration: an HTTP status, an
//! SMTP greeting, or any banner with a known prefix.

use std::io;

use egress_common::{incoming, outgoing};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::TargetAddr;

/// Longest response line read from a target
const MAX_LINE: u64 = 4096;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Target closed the connection without responding")]
    ConnectionClosed,

    #[error("Malformed HTTP status line: {0}")]
    MalformedStatus(String),

    #[error("Target answered with HTTP status {0}")]
    HttpStatus(u16),

    #[error("Expected a response starting with '{expected}', got '{received}'")]
    UnexpectedResponse { expected: String, received: String },
}

fn default_http_path() -> String {
    "/".to_string()
}

/// How a target proves it was reached
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum Probe {
    /// `GET path` must answer with a 2xx status
    Http {
        #[serde(default = "default_http_path")]
        path: String,
    },
    /// The first line must be a `220` greeting
    SmtpGreeting,
    /// The first line must start with `expect`
    Banner { expect: String },
}

impl Default for Probe {
    fn default() -> Self {
        Self::Http {
            path: default_http_path(),
        }
    }
}

fn default_host() -> String {
    "ifconfig.me".to_string()
}

const fn default_port() -> u16 {
    80
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthCheckTarget {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub probe: Probe,
}

impl Default for HealthCheckTarget {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            probe: Probe::default(),
        }
    }
}

impl HealthCheckTarget {
    #[must_use]
    pub fn target_addr(&self) -> TargetAddr {
        TargetAddr::new(&self.host, self.port)
    }

    /// Run the probe over an already tunnelled stream.
    ///
    /// # Errors
    ///
    /// Any IO failure, early close, or response that does not match the probe.
    pub async fn check<S>(&self, stream: &mut S) -> Result<(), ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match &self.probe {
            Probe::Http { path } => {
                let request = format!(
                    "GET {path} HTTP/1.1\r\nHost: {}\r\nUser-Agent: egress-verifier\r\nAccept: */*\r\nConnection: close\r\n\r\n",
                    self.host
                );
                outgoing!("GET {path} to {}", self.host);
                stream.write_all(request.as_bytes()).await?;
                stream.flush().await?;

                let status = http_status(&read_line(stream).await?)?;
                if (200..300).contains(&status) {
                    Ok(())
                } else {
                    Err(ProbeError::HttpStatus(status))
                }
            }
            Probe::SmtpGreeting => {
                let greeting = read_line(stream).await?;
                expect_prefix(&greeting, "220")?;

                outgoing!("QUIT");
                // The probe already passed; a failed QUIT changes nothing.
                let _ = stream.write_all(b"QUIT\r\n").await;
                Ok(())
            }
            Probe::Banner { expect } => expect_prefix(&read_line(stream).await?, expect),
        }
    }
}

async fn read_line<S>(stream: &mut S) -> Result<String, ProbeError>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream.take(MAX_LINE));
    let mut line = String::new();

    if reader.read_line(&mut line).await? == 0 {
        return Err(ProbeError::ConnectionClosed);
    }

    let line = line.trim_end().to_string();
    incoming!("{line}");
    Ok(line)
}

fn expect_prefix(line: &str, expected: &str) -> Result<(), ProbeError> {
    if line.starts_with(expected) {
        Ok(())
    } else {
        Err(ProbeError::UnexpectedResponse {
            expected: expected.to_string(),
            received: line.to_string(),
        })
    }
}

fn http_status(line: &str) -> Result<u16, ProbeError> {
    let mut parts = line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| ProbeError::MalformedStatus(line.to_string())),
        _ => Err(ProbeError::MalformedStatus(line.to_string())),
    }
}
