//! Router addresses and socket dialing.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Error;

/// Read side of a dialed socket.
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write side of a dialed socket.
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the router listens.
///
/// Parsed from `unix:///path/to/socket` or `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Endpoint {
    /// A Unix domain socket path.
    Unix(PathBuf),
    /// A TCP `host:port` pair.
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = s.split_once("://") else {
            return Err(Error::InvalidInput(format!("not a URL: '{s}'")));
        };
        match scheme {
            "unix" if !rest.is_empty() => Ok(Self::Unix(PathBuf::from(rest))),
            "tcp" => {
                let authority = rest.trim_end_matches('/');
                match authority.rsplit_once(':') {
                    Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                        Ok(Self::Tcp(authority.to_owned()))
                    }
                    _ => Err(Error::InvalidInput(format!(
                        "tcp URL needs host:port, got '{s}'"
                    ))),
                }
            }
            "unix" => Err(Error::InvalidInput(format!(
                "unix URL needs a socket path, got '{s}'"
            ))),
            other => Err(Error::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl Endpoint {
    /// Opens a stream socket and splits it into owned halves.
    pub(crate) async fn dial(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => {
                let (r, w) = tokio::net::UnixStream::connect(path).await?.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            #[cfg(not(unix))]
            Self::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }
}
