use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The location of a unix domain socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnixPath {
    /// A socket backed by a filesystem path.
    Path(PathBuf),
    /// An abstract-namespace socket (`@name`), Linux only.
    Abstract(String),
}

impl fmt::Display for UnixPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

/// A parsed listen URL.
///
/// Supported schemes:
///
/// ```text
/// udp://host:port
/// tcp://host:port
/// unixgram:///path/to.sock     unixgram:@abstract-name
/// unix:///path/to.sock         unix:@abstract-name
/// grpc://host:port
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenAddr {
    /// UDP datagrams, one or more newline-delimited records each.
    Udp(String),
    /// A TCP stream framed by newlines.
    Tcp(String),
    /// Unix datagrams.
    UnixDatagram(UnixPath),
    /// A unix stream framed by newlines.
    UnixStream(UnixPath),
    /// A gRPC endpoint accepting both metric and span streams.
    Grpc(String),
}

impl ListenAddr {
    /// The URL scheme of this address.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Udp(_) => "udp",
            Self::Tcp(_) => "tcp",
            Self::UnixDatagram(_) => "unixgram",
            Self::UnixStream(_) => "unix",
            Self::Grpc(_) => "grpc",
        }
    }

    /// Returns `true` for datagram transports.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Self::Udp(_) | Self::UnixDatagram(_))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(authority) | Self::Tcp(authority) | Self::Grpc(authority) => {
                write!(f, "{}://{}", self.scheme(), authority)
            }
            Self::UnixDatagram(UnixPath::Abstract(name)) => write!(f, "unixgram:@{name}"),
            Self::UnixStream(UnixPath::Abstract(name)) => write!(f, "unix:@{name}"),
            Self::UnixDatagram(UnixPath::Path(path)) => {
                write!(f, "unixgram://{}", path.display())
            }
            Self::UnixStream(UnixPath::Path(path)) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// An error parsing a [`ListenAddr`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseListenAddrError {
    /// The URL has no `scheme:` part.
    #[error("listen address is missing a scheme: {0}")]
    MissingScheme(String),
    /// The scheme is not one of the supported transports.
    #[error("unsupported listen scheme: {0}")]
    UnsupportedScheme(String),
    /// The remainder of the URL is empty.
    #[error("listen address is missing a host or path")]
    MissingAddress,
}

fn parse_unix(rest: &str) -> Result<UnixPath, ParseListenAddrError> {
    if let Some(name) = rest.strip_prefix('@') {
        if name.is_empty() {
            return Err(ParseListenAddrError::MissingAddress);
        }
        return Ok(UnixPath::Abstract(name.to_owned()));
    }

    let path = rest.strip_prefix("//").unwrap_or(rest);
    if path.is_empty() {
        return Err(ParseListenAddrError::MissingAddress);
    }

    Ok(UnixPath::Path(PathBuf::from(path)))
}

impl FromStr for ListenAddr {
    type Err = ParseListenAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| ParseListenAddrError::MissingScheme(s.to_owned()))?;

        let authority = |rest: &str| {
            let authority = rest.strip_prefix("//").unwrap_or(rest);
            if authority.is_empty() {
                Err(ParseListenAddrError::MissingAddress)
            } else {
                Ok(authority.to_owned())
            }
        };

        match scheme {
            "udp" => Ok(Self::Udp(authority(rest)?)),
            "tcp" => Ok(Self::Tcp(authority(rest)?)),
            "grpc" => Ok(Self::Grpc(authority(rest)?)),
            "unixgram" => Ok(Self::UnixDatagram(parse_unix(rest)?)),
            "unix" => Ok(Self::UnixStream(parse_unix(rest)?)),
            other => Err(ParseListenAddrError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl Serialize for ListenAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ListenAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        string.parse().map_err(D::Error::custom)
    }
}
