//! Loopback SOCKS5 proxy and health-check targets for verifier tests
//!
//! The proxy speaks just enough RFC 1928/1929 to accept a CONNECT, optionally
//! demanding a username and password, and then splices the client onto the
//! requested target. Targets answer with a fixed response, or never answer.
#![allow(dead_code)] // Test utility module - not all helpers used in every test

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// A SOCKS5 proxy bound to an ephemeral loopback port
pub struct MockProxy {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockProxy {
    /// Proxy that accepts clients offering no authentication.
    pub async fn open() -> Self {
        Self::start(None).await
    }

    /// Proxy that insists on username/password authentication.
    pub async fn with_credentials(username: &str, password: &str) -> Self {
        Self::start(Some((username.to_string(), password.to_string()))).await
    }

    async fn start(credentials: Option<(String, String)>) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let credentials = Arc::new(credentials);

        let counter = Arc::clone(&connections);
        let handle = tokio::spawn(async move {
            while let Ok((client, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let credentials = Arc::clone(&credentials);
                tokio::spawn(async move {
                    let _ = serve(client, (*credentials).as_ref()).await;
                });
            }
        });

        Self {
            addr,
            connections,
            handle,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Client connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut client: TcpStream,
    credentials: Option<&(String, String)>,
) -> std::io::Result<()> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    let mut methods = vec![0u8; usize::from(header[1])];
    client.read_exact(&mut methods).await?;

    match credentials {
        Some((username, password)) => {
            if !methods.contains(&0x02) {
                client.write_all(&[0x05, 0xff]).await?;
                return Ok(());
            }
            client.write_all(&[0x05, 0x02]).await?;

            let offered_user = read_field(&mut client, true).await?;
            let offered_pass = read_field(&mut client, false).await?;
            if offered_user != *username || offered_pass != *password {
                client.write_all(&[0x01, 0x01]).await?;
                return Ok(());
            }
            client.write_all(&[0x01, 0x00]).await?;
        }
        None => client.write_all(&[0x05, 0x00]).await?,
    }

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        0x04 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        _ => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let port = client.read_u16().await?;

    let Ok(mut upstream) = TcpStream::connect((host.as_str(), port)).await else {
        reply(&mut client, REPLY_CONNECTION_REFUSED).await?;
        return Ok(());
    };

    reply(&mut client, REPLY_SUCCEEDED).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Read one RFC 1929 length-prefixed field, skipping the version byte first.
async fn read_field(client: &mut TcpStream, leading_version: bool) -> std::io::Result<String> {
    if leading_version {
        client.read_u8().await?;
    }
    let len = client.read_u8().await?;
    let mut field = vec![0u8; usize::from(len)];
    client.read_exact(&mut field).await?;
    Ok(String::from_utf8_lossy(&field).into_owned())
}

async fn reply(client: &mut TcpStream, code: u8) -> std::io::Result<()> {
    client
        .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

/// A health-check target bound to an ephemeral loopback port
pub struct MockTarget {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockTarget {
    /// Reads whatever the client sends first, then answers with `response`
    /// and closes.
    pub async fn responding(response: &'static str) -> Self {
        Self::start(move |mut stream| async move {
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        })
        .await
    }

    /// Writes `greeting` as soon as the client connects.
    pub async fn greeting(greeting: &'static str) -> Self {
        Self::start(move |mut stream| async move {
            let _ = stream.write_all(greeting.as_bytes()).await;
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        })
        .await
    }

    /// Accepts and never writes a byte.
    pub async fn silent() -> Self {
        Self::start(|mut stream| async move {
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        })
        .await
    }

    async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handler(stream));
            }
        });

        Self { addr, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for MockTarget {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A loopback port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}
