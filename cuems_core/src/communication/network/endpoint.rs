use crate::error::{CuemsError, CuemsResult};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Transport endpoint for bus and request/response sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP: "tcp://192.168.1.5:5555", "tcp://localhost:5555", "tcp://[::1]:5555"
    Tcp { host: String, port: u16 },

    /// Filesystem socket: "ipc:///tmp/cuems.sock"
    Ipc { path: PathBuf },
}

pub const TCP_SCHEME: &str = "tcp://";
pub const IPC_SCHEME: &str = "ipc://";

impl Endpoint {
    /// URL form of this endpoint, as accepted by [`parse_endpoint`]
    pub fn url(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => {
                if host.contains(':') {
                    format!("{}[{}]:{}", TCP_SCHEME, host, port)
                } else {
                    format!("{}{}:{}", TCP_SCHEME, host, port)
                }
            }
            Endpoint::Ipc { path } => format!("{}{}", IPC_SCHEME, path.display()),
        }
    }

    pub fn is_ipc(&self) -> bool {
        matches!(self, Endpoint::Ipc { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Parse a transport URL into an [`Endpoint`]
///
/// # Format:
/// - `"tcp://127.0.0.1:5555"` → TCP, IPv4
/// - `"tcp://[2001:db8::1]:5555"` → TCP, IPv6
/// - `"tcp://controller.local:5555"` → TCP, resolved at bind/dial time
/// - `"tcp://127.0.0.1:0"` → TCP, ephemeral port (listeners only)
/// - `"ipc:///run/cuems/bus.sock"` → Unix domain socket
pub fn parse_endpoint(input: &str) -> CuemsResult<Endpoint> {
    if let Some(path) = input.strip_prefix(IPC_SCHEME) {
        if path.is_empty() {
            return Err(CuemsError::config(format!(
                "Invalid address '{}': ipc path cannot be empty",
                input
            )));
        }
        return Ok(Endpoint::Ipc {
            path: PathBuf::from(path),
        });
    }

    let location = input.strip_prefix(TCP_SCHEME).ok_or_else(|| {
        CuemsError::config(format!(
            "Invalid address '{}': expected 'tcp://host:port' or 'ipc://path'",
            input
        ))
    })?;

    if location.is_empty() {
        return Err(CuemsError::config(format!(
            "Invalid address '{}': missing host",
            input
        )));
    }

    // IPv6 literals need brackets so the port separator is unambiguous
    if location.starts_with('[') {
        let bracket_end = location.find(']').ok_or_else(|| {
            CuemsError::config(format!("Missing closing bracket in IPv6 address '{}'", input))
        })?;
        let ipv6_str = &location[1..bracket_end];
        let host = ipv6_str.parse::<IpAddr>().map_err(|e| {
            CuemsError::config(format!("Invalid IPv6 address '{}': {}", ipv6_str, e))
        })?;

        let rest = &location[bracket_end + 1..];
        let port_str = rest.strip_prefix(':').ok_or_else(|| {
            CuemsError::config(format!("Missing port after IPv6 address in '{}'", input))
        })?;
        let port = parse_port(port_str)?;
        return Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        });
    }

    let colon_pos = location.rfind(':').ok_or_else(|| {
        CuemsError::config(format!("Invalid address '{}': missing port", input))
    })?;
    let host = &location[..colon_pos];
    let port = parse_port(&location[colon_pos + 1..])?;

    if host.is_empty() {
        return Err(CuemsError::config(format!(
            "Invalid address '{}': missing host",
            input
        )));
    }
    if host.contains(':') {
        return Err(CuemsError::config(format!(
            "Invalid address '{}': IPv6 hosts must be written as [addr]:port",
            input
        )));
    }

    Ok(Endpoint::Tcp {
        host: host.to_string(),
        port,
    })
}

fn parse_port(port_str: &str) -> CuemsResult<u16> {
    port_str
        .parse::<u16>()
        .map_err(|e| CuemsError::config(format!("Invalid port '{}': {}", port_str, e)))
}

/// Check that a filesystem socket path can be used before binding or dialing.
///
/// An existing path must be readable and writable. A missing path needs a
/// readable and writable parent directory.
pub fn check_ipc_path(path: &Path) -> CuemsResult<()> {
    if path.exists() {
        return check_access(path);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if !parent.exists() {
        return Err(CuemsError::config(format!(
            "Socket directory '{}' does not exist",
            parent.display()
        )));
    }
    if !parent.is_dir() {
        return Err(CuemsError::config(format!(
            "Socket parent '{}' is not a directory",
            parent.display()
        )));
    }
    check_access(&parent)
}

#[cfg(unix)]
fn check_access(path: &Path) -> CuemsResult<()> {
    use nix::unistd::{access, AccessFlags};

    access(path, AccessFlags::R_OK | AccessFlags::W_OK).map_err(|e| {
        CuemsError::config(format!(
            "No read/write permission on '{}': {}",
            path.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn check_access(path: &Path) -> CuemsResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        CuemsError::config(format!("Cannot stat '{}': {}", path.display(), e))
    })?;
    if metadata.permissions().readonly() {
        return Err(CuemsError::config(format!(
            "'{}' is read-only",
            path.display()
        )));
    }
    Ok(())
}
