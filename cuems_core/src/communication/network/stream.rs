/// Stream listeners and dialers behind an [`Endpoint`]
///
/// Hides the TCP / Unix-domain split from the bus socket and the
/// request/response channel.
use super::endpoint::{check_ipc_path, Endpoint};
use super::framing::{read_frame, write_frame};
use crate::error::{CuemsError, CuemsResult};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// One established stream, accepted or dialed
#[derive(Debug)]
pub enum Connection {
    Tcp { stream: TcpStream, peer: SocketAddr },
    #[cfg(unix)]
    Unix { stream: UnixStream },
}

impl Connection {
    /// Write one length-prefixed frame
    pub async fn send_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Connection::Tcp { stream, .. } => write_frame(stream, payload).await,
            #[cfg(unix)]
            Connection::Unix { stream } => write_frame(stream, payload).await,
        }
    }

    /// Read one frame; `None` once the peer has closed the stream
    pub async fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            Connection::Tcp { stream, .. } => read_frame(stream).await,
            #[cfg(unix)]
            Connection::Unix { stream } => read_frame(stream).await,
        }
    }
}

/// Bound listener for an endpoint
#[derive(Debug)]
pub enum StreamListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixBinding),
}

/// Unix listener that removes its socket file when dropped
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixBinding {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl Drop for UnixBinding {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl StreamListener {
    /// Bind-and-listen on the endpoint
    pub async fn bind(endpoint: &Endpoint) -> CuemsResult<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let bind_addr = format!("{}:{}", host_for_socket(host), port);
                let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
                    CuemsError::communication(format!("Failed to listen on {}: {}", endpoint, e))
                })?;
                Ok(StreamListener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Ipc { path } => {
                check_ipc_path(path)?;
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path).map_err(|e| {
                    CuemsError::communication(format!("Failed to listen on {}: {}", endpoint, e))
                })?;
                Ok(StreamListener::Unix(UnixBinding {
                    listener,
                    path: path.clone(),
                }))
            }
            #[cfg(not(unix))]
            Endpoint::Ipc { .. } => Err(CuemsError::config(
                "ipc:// endpoints require a Unix platform",
            )),
        }
    }

    /// Accept the next incoming stream
    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            StreamListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok(Connection::Tcp { stream, peer })
            }
            #[cfg(unix)]
            StreamListener::Unix(binding) => {
                let (stream, _addr) = binding.listener.accept().await?;
                Ok(Connection::Unix { stream })
            }
        }
    }

    /// The endpoint actually bound (resolves port 0)
    pub fn local_endpoint(&self, requested: &Endpoint) -> CuemsResult<Endpoint> {
        match self {
            StreamListener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            StreamListener::Unix(_) => Ok(requested.clone()),
        }
    }
}

/// Dial-and-connect to the endpoint
pub async fn dial(endpoint: &Endpoint) -> CuemsResult<Connection> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let target = format!("{}:{}", host_for_socket(host), port);
            let stream = TcpStream::connect(&target).await.map_err(|e| {
                CuemsError::communication(format!("Failed to dial {}: {}", endpoint, e))
            })?;
            let _ = stream.set_nodelay(true);
            let peer = stream.peer_addr()?;
            debug!("Dialed {} ({})", endpoint, peer);
            Ok(Connection::Tcp { stream, peer })
        }
        #[cfg(unix)]
        Endpoint::Ipc { path } => {
            check_ipc_path(path)?;
            let stream = UnixStream::connect(path).await.map_err(|e| {
                CuemsError::communication(format!("Failed to dial {}: {}", endpoint, e))
            })?;
            debug!("Dialed {}", endpoint);
            Ok(Connection::Unix { stream })
        }
        #[cfg(not(unix))]
        Endpoint::Ipc { .. } => Err(CuemsError::config(
            "ipc:// endpoints require a Unix platform",
        )),
    }
}

/// IPv6 literals need their brackets back for `host:port` socket strings
fn host_for_socket(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// A socket file left behind by a dead listener blocks `bind`; regular files are never touched
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> CuemsResult<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            debug!("Removed stale socket file {}", path.display());
            Ok(())
        }
        Ok(_) => Err(CuemsError::config(format!(
            "'{}' exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
