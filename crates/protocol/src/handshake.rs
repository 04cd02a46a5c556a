//! Plugin startup handshake.
//!
//! Immediately after process start, and before producing any other output, a
//! plugin writes exactly one line to stdout announcing how the orchestrator
//! can reach its RPC endpoint:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS[|tls]
//! ```
//!
//! For example `2|1|tcp|127.0.0.1:41507` or `2|1|unix|/tmp/plugin-81.sock`.
//! The first line is authoritative: there is no partial-line retry, and a
//! plugin that prints anything else first never becomes usable.

use std::path::PathBuf;
use thiserror::Error;

/// The core protocol version this orchestrator implements.
///
/// A plugin advertising any other core version is rejected during the
/// handshake. This version only changes when the handshake line or the frame
/// format itself changes; application-level payload evolution is carried by
/// the separately advertised app version.
pub const CORE_PROTOCOL_VERSION: u32 = 2;

/// Field separator of the handshake line.
pub const HANDSHAKE_DELIMITER: char = '|';

/// Errors that can occur while establishing the plugin handshake.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The line could not be split into the expected fields.
    #[error("malformed handshake line: {reason}")]
    Malformed { reason: String },

    /// The plugin speaks a core protocol version we do not implement.
    #[error(
        "unsupported core protocol version {advertised} (supported: {CORE_PROTOCOL_VERSION})"
    )]
    UnsupportedVersion { advertised: u32 },

    /// No handshake line arrived within the bounded wait.
    #[error("plugin did not announce its endpoint within {waited_ms}ms")]
    Timeout { waited_ms: u64 },
}

/// The RPC endpoint a plugin announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP socket address, e.g. `127.0.0.1:41507`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

/// Parsed contents of a plugin's handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Core protocol version (handshake + framing).
    pub core_version: u32,
    /// Application protocol version (payload shapes).
    pub app_version: u32,
    /// Where to connect for the RPC channel.
    pub endpoint: Endpoint,
    /// Whether the plugin expects a TLS connection.
    pub tls: bool,
}

/// Parse a plugin's handshake line.
///
/// # Errors
///
/// Returns [`HandshakeError::Malformed`] if the line does not split into
/// 4 or 5 fields, a version field is not numeric, or the network kind is
/// unknown; [`HandshakeError::UnsupportedVersion`] if the advertised core
/// version is not [`CORE_PROTOCOL_VERSION`].
pub fn parse_handshake_line(line: &str) -> Result<Handshake, HandshakeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(HANDSHAKE_DELIMITER).collect();

    if fields.len() != 4 && fields.len() != 5 {
        return Err(HandshakeError::Malformed {
            reason: format!("expected 4 or 5 fields, got {}", fields.len()),
        });
    }

    let core_version: u32 = fields[0].parse().map_err(|_| HandshakeError::Malformed {
        reason: format!("core version is not a number: {:?}", fields[0]),
    })?;
    if core_version != CORE_PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion {
            advertised: core_version,
        });
    }

    let app_version: u32 = fields[1].parse().map_err(|_| HandshakeError::Malformed {
        reason: format!("app version is not a number: {:?}", fields[1]),
    })?;

    if fields[3].is_empty() {
        return Err(HandshakeError::Malformed {
            reason: "empty endpoint address".to_string(),
        });
    }

    let endpoint = match fields[2] {
        "tcp" => Endpoint::Tcp(fields[3].to_string()),
        "unix" => Endpoint::Unix(PathBuf::from(fields[3])),
        other => {
            return Err(HandshakeError::Malformed {
                reason: format!("unknown network kind: {other:?}"),
            })
        }
    };

    let tls = match fields.get(4) {
        None => false,
        Some(&"tls") => true,
        Some(other) => {
            return Err(HandshakeError::Malformed {
                reason: format!("unknown trailing marker: {other:?}"),
            })
        }
    };

    Ok(Handshake {
        core_version,
        app_version,
        endpoint,
        tls,
    })
}
