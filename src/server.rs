use crate::commands::CommandRegistry;
use crate::config::Settings;
use crate::identity::server_identity;
use crate::session::Session;

use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Accepts connections and runs one independent session task per connection.
pub struct SinkServer {
    settings: Settings,
    fqdn: String,
    registry: Arc<CommandRegistry>,
    tls_acceptor: Option<TlsAcceptor>,
}

/// A bound listening socket, plain or implicit TLS.
pub struct Bound {
    listener: TcpListener,
    tls: bool,
}

impl Bound {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl SinkServer {
    pub fn new(settings: Settings) -> Result<Self> {
        let tls_acceptor = if settings.tls_ports.is_empty() {
            None
        } else {
            let (cert_path, key_path) = match (&settings.tls_cert, &settings.tls_key) {
                (Some(cert), Some(key)) => (cert, key),
                _ => return Err(anyhow!("TLS ports configured without certificate and key")),
            };
            Some(load_tls(cert_path, key_path)?)
        };

        let fqdn = server_identity(settings.hostname.as_deref());
        info!(%fqdn, mode = %settings.sink.mode, timeout = ?settings.sink.timeout,
              delay = ?settings.sink.delay, "Server identity resolved");

        let registry = CommandRegistry::standard();
        info!(commands = registry.len(), "Command table built");

        Ok(Self {
            settings,
            fqdn,
            registry: Arc::new(registry),
            tls_acceptor,
        })
    }

    #[cfg(test)]
    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// Binds every configured port up front so a bad port fails startup.
    pub async fn bind(&self) -> Result<Vec<Bound>> {
        let plain = self.settings.ports.iter().map(|&port| (port, false));
        let tls = self.settings.tls_ports.iter().map(|&port| (port, true));

        let mut bound = Vec::new();
        for (port, tls) in plain.chain(tls) {
            let addr = format!("{}:{}", self.settings.address, port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind to {}", addr))?;
            let bound_port = Bound { listener, tls };
            info!(addr = %bound_port.local_addr()?, tls, "Listening");
            bound.push(bound_port);
        }
        Ok(bound)
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let bound = self.bind().await?;
        self.serve(bound).await
    }

    pub async fn serve(self: Arc<Self>, bound: Vec<Bound>) -> Result<()> {
        let mut handles = vec![];

        for Bound { listener, tls } in bound {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.accept_loop(listener, tls).await;
            }));
        }

        for handle in handles {
            handle.await?;
        }

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, tls: bool) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, tls, "New connection");
                    if tls {
                        self.spawn_tls(stream, peer);
                    } else {
                        self.spawn_session(stream, peer);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                }
            }
        }
    }

    fn spawn_session<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::new(
            stream,
            peer.to_string(),
            self.fqdn.clone(),
            self.settings.sink,
            Arc::clone(&self.registry),
        );
        tokio::spawn(session.run());
    }

    fn spawn_tls(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let acceptor = match &self.tls_acceptor {
            Some(acceptor) => acceptor.clone(),
            None => return,
        };
        let this = self.clone();
        let limit = self.settings.sink.timeout;
        tokio::spawn(async move {
            match time::timeout(limit, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => this.spawn_session(tls_stream, peer),
                Ok(Err(e)) => warn!(%peer, error = %e, "TLS handshake failed"),
                Err(_) => warn!(%peer, "TLS handshake timed out"),
            }
        });
    }
}

fn load_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let cert_chain: Vec<Certificate> = certs(&mut StdBufReader::new(cert_file))
        .map_err(|_| anyhow!("Failed to parse certificate"))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow!("No certificate found in {:?}", cert_path));
    }

    let read_key_file = || {
        std::fs::File::open(key_path)
            .map(StdBufReader::new)
            .with_context(|| format!("Failed to open private key: {:?}", key_path))
    };
    let mut keys = pkcs8_private_keys(&mut read_key_file()?)
        .map_err(|_| anyhow!("Failed to parse private key"))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut read_key_file()?)
            .map_err(|_| anyhow!("Failed to parse private key"))?;
    }
    if keys.is_empty() {
        return Err(anyhow!("No private key found in {:?}", key_path));
    }

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, PrivateKey(keys.remove(0)))
        .map_err(|e| anyhow!("Failed to build TLS config: {}", e))?;

    info!(cert = ?cert_path, "TLS enabled");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, SinkConfig};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    fn settings(mode: Mode) -> Settings {
        Settings {
            address: "127.0.0.1".to_string(),
            ports: vec![0],
            tls_ports: vec![],
            tls_cert: None,
            tls_key: None,
            hostname: Some("mx.sink.test".to_string()),
            sink: SinkConfig {
                timeout: Duration::from_secs(30),
                delay: Duration::ZERO,
                mode,
            },
            log_file: None,
            verbose: false,
            daemon: false,
            pid_file: PathBuf::from("/tmp/unused.pid"),
        }
    }

    async fn start(mode: Mode) -> SocketAddr {
        let server = Arc::new(SinkServer::new(settings(mode)).unwrap());
        assert_eq!(server.fqdn(), "mx.sink.test");
        let bound = server.bind().await.unwrap();
        let addr = bound[0].local_addr().unwrap();
        tokio::spawn(server.serve(bound));
        addr
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            let mut client = Self {
                reader: BufReader::new(reader),
                writer,
            };
            assert_eq!(client.line().await, "220 mx.sink.test ESMTP\r\n");
            client
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line
        }

        async fn command(&mut self, command: &str) -> String {
            self.writer
                .write_all(format!("{}\r\n", command).as_bytes())
                .await
                .unwrap();
            self.line().await
        }
    }

    #[tokio::test]
    async fn test_full_conversation_over_tcp() {
        let addr = start(Mode::Accept).await;
        let mut client = Client::connect(addr).await;

        client.writer.write_all(b"EHLO client.test\r\n").await.unwrap();
        let mut last = String::new();
        for _ in 0..9 {
            last = client.line().await;
        }
        assert_eq!(last, "250 DSN\r\n");

        assert_eq!(client.command("MAIL FROM:<a@b.test>").await, "250 2.1.0 OK\r\n");
        assert_eq!(client.command("RCPT TO:<c@d.test>").await, "250 2.1.5 OK\r\n");
        assert!(client.command("DATA").await.starts_with("354 "));
        client.writer.write_all(b"Subject: test\r\n\r\nhello\r\n").await.unwrap();
        let reply = client.command(".").await;
        assert!(reply.starts_with("250 2.0.0 OK: queued as <"));
        assert!(reply.ends_with("@mx.sink.test>\r\n"));
        assert_eq!(client.command("QUIT").await, "221 2.0.0 Goodbye\r\n");
        assert_eq!(client.line().await, "");
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let addr = start(Mode::Bounce).await;
        let mut idle = Client::connect(addr).await;
        let mut busy = Client::connect(addr).await;

        assert!(busy.command("DATA").await.starts_with("354 "));
        let reply = busy.command(".").await;
        assert!(reply.starts_with('4') || reply.starts_with('5'));
        assert_eq!(busy.command("QUIT").await, "221 2.0.0 Goodbye\r\n");

        assert_eq!(idle.command("NOOP").await, "250 2.0.0 OK\r\n");
    }

    #[test]
    fn test_missing_tls_material_is_fatal() {
        let mut settings = settings(Mode::Accept);
        settings.tls_ports = vec![0];
        assert!(SinkServer::new(settings.clone()).is_err());

        settings.tls_cert = Some(PathBuf::from("/nonexistent/cert.pem"));
        settings.tls_key = Some(PathBuf::from("/nonexistent/key.pem"));
        assert!(SinkServer::new(settings).is_err());
    }
}
