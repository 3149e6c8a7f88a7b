use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// A client that connects but never sends its request line gets this long
/// before the connection is dropped.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS material for one listener.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// One listener from the server configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub port: u16,
    /// Advisory worker parallelism; the async runtime schedules connection
    /// tasks over its own thread pool.
    pub threads: usize,
    /// Ceiling on concurrently served connections.
    pub max_connections: usize,
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 8008,
            threads: 4,
            max_connections: 32,
            tls: None,
        }
    }
}

/// A bound listener, ready to serve.
pub struct Listener {
    inner: tokio::net::TcpListener,
    local_addr: SocketAddr,
    max_connections: usize,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Bind the configured port with `SO_REUSEADDR` (and `SO_REUSEPORT`
    /// where the platform has it), loading TLS material if configured.
    pub fn bind(config: &ListenerConfig) -> std::io::Result<Listener> {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuseport(true)?;
        socket.bind(addr)?;

        let inner = socket.listen(1024)?;
        let local_addr = inner.local_addr()?;

        let tls = match &config.tls {
            Some(tls) => Some(load_tls(tls)?),
            None => None,
        };

        Ok(Listener {
            inner,
            local_addr,
            max_connections: config.max_connections.max(1),
            tls,
        })
    }

    /// The address actually bound, useful when the port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections until `cancel` fires.
    ///
    /// Each accepted connection holds one semaphore permit for its whole
    /// lifetime; with all permits out, new clients wait in the kernel
    /// backlog. Accept and handshake failures are logged and do not stop
    /// the loop. Cancellation stops accepting and lets in-flight
    /// connections drain.
    pub async fn serve(self, app: Router, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        tracing::info!(addr = %self.local_addr, tls = self.tls.is_some(), "listening");

        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            let app = app.clone();
            let tls = self.tls.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let _permit = permit;
                handle_connection(stream, peer, tls, app, cancel).await;
            });
        }

        tracing::info!(addr = %self.local_addr, "listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    app: Router,
    cancel: CancellationToken,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => drive(tls_stream, peer, app, cancel).await,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
            }
        },
        None => drive(stream, peer, app, cancel).await,
    }
}

/// Serve one connection with hyper's HTTP/1 driver. HTTP/2 is deliberately
/// not negotiated: the client-server API here speaks HTTP/1.0 and 1.1.
async fn drive<IO>(io: IO, peer: SocketAddr, app: Router, cancel: CancellationToken)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(app);

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(peer = %peer, error = %e, "connection error");
            }
        }
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }
}

/// Load PEM certificate chain and private key into a rustls acceptor.
fn load_tls(config: &TlsConfig) -> std::io::Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&config.cert)?;
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>()?;

    let key_file = std::fs::File::open(&config.key)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in key file")
    })?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
