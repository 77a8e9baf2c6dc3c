//! Minimal SOCKS5 client (RFC 1928) with username/password auth (RFC 1929)
//!
//! Every connection takes its proxy as a [`ProxyConfig`] argument. There is no
//! process-wide proxy setting, so concurrent tunnels through different
//! proxies are independent.

use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use egress_common::{incoming, outgoing};
use egress_registry::IpAddress;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::instrument;

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply field of a failed CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unassigned(u8),
}

impl From<u8> for ReplyCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::GeneralFailure,
            0x02 => Self::NotAllowed,
            0x03 => Self::NetworkUnreachable,
            0x04 => Self::HostUnreachable,
            0x05 => Self::ConnectionRefused,
            0x06 => Self::TtlExpired,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::AddressTypeNotSupported,
            other => Self::Unassigned(other),
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeneralFailure => f.write_str("general SOCKS server failure"),
            Self::NotAllowed => f.write_str("connection not allowed by ruleset"),
            Self::NetworkUnreachable => f.write_str("network unreachable"),
            Self::HostUnreachable => f.write_str("host unreachable"),
            Self::ConnectionRefused => f.write_str("connection refused"),
            Self::TtlExpired => f.write_str("TTL expired"),
            Self::CommandNotSupported => f.write_str("command not supported"),
            Self::AddressTypeNotSupported => f.write_str("address type not supported"),
            Self::Unassigned(code) => write!(f, "unassigned reply code {code:#04x}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Proxy spoke SOCKS version {0}, expected 5")]
    UnsupportedVersion(u8),

    #[error("Proxy accepted none of the offered authentication methods")]
    NoAcceptableMethod,

    #[error("Proxy selected authentication method {0:#04x} which was not offered")]
    UnexpectedMethod(u8),

    #[error("Proxy rejected the username/password (status {0:#04x})")]
    AuthenticationFailed(u8),

    #[error("{0} must be between 1 and 255 bytes")]
    FieldLength(&'static str),

    #[error("Proxy refused the connection: {0}")]
    Reply(ReplyCode),

    #[error("Proxy replied with unknown address type {0:#04x}")]
    InvalidAddressType(u8),

    #[error("Invalid proxy endpoint: {0}")]
    InvalidProxy(String),
}

/// Username/password for RFC 1929 sub-negotiation
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The proxy a single connection is opened through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub addr: SocketAddr,
    pub credentials: Option<Credentials>,
}

impl ProxyConfig {
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            credentials: None,
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Proxy endpoint of a proxy-pool address.
    ///
    /// Credentials are used only when both username and password are set.
    ///
    /// # Errors
    ///
    /// Fails if the stored `ipv4` or `proxy_port` cannot form a socket address.
    pub fn from_address(address: &IpAddress) -> Result<Self, Socks5Error> {
        let ip: Ipv4Addr = address.ipv4.trim().parse().map_err(|_| {
            Socks5Error::InvalidProxy(format!("'{}' is not an IPv4 address", address.ipv4))
        })?;
        let port = u16::try_from(address.proxy_port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                Socks5Error::InvalidProxy(format!("port {} is out of range", address.proxy_port))
            })?;

        let config = Self::new(SocketAddr::new(IpAddr::V4(ip), port));
        Ok(match address.proxy_credentials() {
            Some((username, password)) => config.with_credentials(username, password),
            None => config,
        })
    }
}

/// Destination requested from the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// An IP target when `host` parses as one, a domain target otherwise.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        host.parse::<IpAddr>().map_or_else(
            |_| Self::Domain(host.to_string(), port),
            |ip| Self::Ip(SocketAddr::new(ip, port)),
        )
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), Socks5Error> {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(field_len("domain", domain.as_bytes())?);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }

        Ok(())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

fn field_len(field: &'static str, value: &[u8]) -> Result<u8, Socks5Error> {
    u8::try_from(value.len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or(Socks5Error::FieldLength(field))
}

/// Open a TCP connection to `proxy` and tunnel it to `target`.
///
/// The returned stream carries application bytes to and from `target`.
///
/// # Errors
///
/// Any connect, negotiation or CONNECT failure.
#[instrument(skip(proxy), fields(proxy = %proxy.addr))]
pub async fn connect(proxy: &ProxyConfig, target: &TargetAddr) -> Result<TcpStream, Socks5Error> {
    let mut stream = TcpStream::connect(proxy.addr).await?;
    handshake(&mut stream, proxy.credentials.as_ref(), target).await?;
    Ok(stream)
}

/// Run the client side of the SOCKS5 handshake over an established stream.
///
/// # Errors
///
/// Any IO failure or protocol violation, or a non-success CONNECT reply.
pub async fn handshake<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    target: &TargetAddr,
) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, credentials).await?;
    request_connect(stream, target).await
}

async fn negotiate_method<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[VERSION, 2, METHOD_NONE, METHOD_PASSWORD]
    } else {
        &[VERSION, 1, METHOD_NONE]
    };
    outgoing!("SOCKS greeting {greeting:02x?}");
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    incoming!("SOCKS method selection {reply:02x?}");

    if reply[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(reply[0]));
    }

    match (reply[1], credentials) {
        (METHOD_NONE, _) => Ok(()),
        (METHOD_PASSWORD, Some(credentials)) => authenticate(stream, credentials).await,
        (METHOD_UNACCEPTABLE, _) => Err(Socks5Error::NoAcceptableMethod),
        (method, _) => Err(Socks5Error::UnexpectedMethod(method)),
    }
}

async fn authenticate<S>(stream: &mut S, credentials: &Credentials) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = credentials.username.as_bytes();
    let password = credentials.password.as_bytes();

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_VERSION);
    request.push(field_len("username", username)?);
    request.extend_from_slice(username);
    request.push(field_len("password", password)?);
    request.extend_from_slice(password);

    outgoing!("SOCKS username/password for {}", credentials.username);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    incoming!("SOCKS auth status {reply:02x?}");

    match reply {
        [AUTH_VERSION, 0x00] => Ok(()),
        [AUTH_VERSION, status] => Err(Socks5Error::AuthenticationFailed(status)),
        [version, _] => Err(Socks5Error::UnsupportedVersion(version)),
    }
}

async fn request_connect<S>(stream: &mut S, target: &TargetAddr) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    target.encode(&mut request)?;

    outgoing!("SOCKS CONNECT {target}");
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    incoming!("SOCKS reply {header:02x?}");

    if header[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]));
    }

    if header[1] != 0x00 {
        return Err(Socks5Error::Reply(ReplyCode::from(header[1])));
    }

    let bound = read_bound_address(stream, header[3]).await?;
    tracing::trace!(bound = %bound, "SOCKS tunnel established");

    Ok(())
}

async fn read_bound_address<S>(stream: &mut S, atyp: u8) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let bound = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; usize::from(len)];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Domain(String::from_utf8_lossy(&domain).into_owned(), port)
        }
        other => return Err(Socks5Error::InvalidAddressType(other)),
    };

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use egress_registry::PoolType;
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    use super::*;

    fn proxy_address(port: i32, username: Option<&str>, password: Option<&str>) -> IpAddress {
        IpAddress {
            id: 1,
            pool_id: 1,
            pool_type: PoolType::Proxy,
            ipv4: "192.0.2.10".to_string(),
            ipv6: None,
            hostname: "proxy.example.com".to_string(),
            priority: 100,
            proxy_port: port,
            proxy_username: username.map(str::to_string),
            proxy_password: password.map(str::to_string),
            verified_at: None,
            verification_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_target_from_host() {
        assert_eq!(
            TargetAddr::new("192.0.2.1", 80),
            TargetAddr::Ip("192.0.2.1:80".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::new("::1", 25),
            TargetAddr::Ip("[::1]:25".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::new("ifconfig.me", 80),
            TargetAddr::Domain("ifconfig.me".to_string(), 80)
        );
    }

    #[test]
    fn test_encode_domain_target() {
        let mut buf = Vec::new();
        TargetAddr::new("a.io", 443).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![ATYP_DOMAIN, 4, b'a', b'.', b'i', b'o', 0x01, 0xbb]);
    }

    #[test]
    fn test_overlong_domain_is_rejected() {
        let mut buf = Vec::new();
        let err = TargetAddr::Domain("a".repeat(256), 80)
            .encode(&mut buf)
            .unwrap_err();
        assert!(matches!(err, Socks5Error::FieldLength("domain")));
    }

    #[test]
    fn test_config_from_address() {
        let config = ProxyConfig::from_address(&proxy_address(1080, Some("u"), Some("p"))).unwrap();
        assert_eq!(config.addr, "192.0.2.10:1080".parse().unwrap());
        assert_eq!(
            config.credentials,
            Some(Credentials {
                username: "u".to_string(),
                password: "p".to_string()
            })
        );

        let anonymous = ProxyConfig::from_address(&proxy_address(1080, Some("u"), None)).unwrap();
        assert_eq!(anonymous.credentials, None);

        assert!(ProxyConfig::from_address(&proxy_address(70_000, None, None)).is_err());
        assert!(ProxyConfig::from_address(&proxy_address(0, None, None)).is_err());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let config = ProxyConfig::new("192.0.2.10:1080".parse().unwrap())
            .with_credentials("user", "hunter2");
        let debug = format!("{config:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_handshake_without_auth() {
        let (mut client, mut server) = duplex(256);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION, 1, METHOD_NONE]);
            server.write_all(&[VERSION, METHOD_NONE]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [VERSION, CMD_CONNECT, 0, ATYP_IPV4, 192, 0, 2, 1, 0, 80]);
            server
                .write_all(&[VERSION, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        handshake(&mut client, None, &TargetAddr::new("192.0.2.1", 80))
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_with_auth() {
        let (mut client, mut server) = duplex(256);
        let credentials = Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION, 2, METHOD_NONE, METHOD_PASSWORD]);
            server.write_all(&[VERSION, METHOD_PASSWORD]).await.unwrap();

            let mut auth = [0u8; 11];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x04pass");
            server.write_all(&[AUTH_VERSION, 0]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[VERSION, 0, 0, ATYP_DOMAIN, 1, b'x', 0, 25])
                .await
                .unwrap();
        });

        handshake(
            &mut client,
            Some(&credentials),
            &TargetAddr::new("192.0.2.1", 80),
        )
        .await
        .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let (mut client, mut server) = duplex(256);
        let credentials = Credentials {
            username: "user".to_string(),
            password: "wrong".to_string(),
        };

        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[VERSION, METHOD_PASSWORD]).await.unwrap();
            let mut auth = [0u8; 12];
            server.read_exact(&mut auth).await.unwrap();
            server.write_all(&[AUTH_VERSION, 1]).await.unwrap();
        });

        let err = handshake(
            &mut client,
            Some(&credentials),
            &TargetAddr::new("192.0.2.1", 80),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Socks5Error::AuthenticationFailed(1)));
    }

    #[tokio::test]
    async fn test_password_method_without_credentials_is_unexpected() {
        let (mut client, mut server) = duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[VERSION, METHOD_PASSWORD]).await.unwrap();
        });

        let err = handshake(&mut client, None, &TargetAddr::new("192.0.2.1", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::UnexpectedMethod(METHOD_PASSWORD)));
    }

    #[tokio::test]
    async fn test_connect_failure_reply() {
        let (mut client, mut server) = duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[VERSION, METHOD_NONE]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[VERSION, 0x05, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = handshake(&mut client, None, &TargetAddr::new("192.0.2.1", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::Reply(ReplyCode::ConnectionRefused)));
        assert_eq!(
            err.to_string(),
            "Proxy refused the connection: connection refused"
        );
    }

    #[tokio::test]
    async fn test_wrong_version_is_rejected() {
        let (mut client, mut server) = duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x04, METHOD_NONE]).await.unwrap();
        });

        let err = handshake(&mut client, None, &TargetAddr::new("192.0.2.1", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::UnsupportedVersion(4)));
    }
}
