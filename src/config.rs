use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::ClientError;

/// Relay endpoint parsed from the server info file: a single `host:port`
/// line where host is an IPv4 dotted quad or the literal `localhost`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn load(path: &Path) -> Result<ServerAddress, ClientError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("couldn't open {}: {e}", path.display()))
        })?;
        let line = contents.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            return Err(ClientError::Config(format!(
                "couldn't read server address from {}",
                path.display()
            )));
        }
        ServerAddress::parse(line)
    }

    pub fn parse(info: &str) -> Result<ServerAddress, ClientError> {
        let (host, port) = info.split_once(':').ok_or_else(|| {
            ClientError::Config("server address is missing the ':' separator".into())
        })?;
        let host = host.trim();
        if !host.eq_ignore_ascii_case("localhost") && host.parse::<Ipv4Addr>().is_err() {
            return Err(ClientError::Config(format!(
                "invalid server IP address '{host}'"
            )));
        }
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| ClientError::Config(format!("invalid server port '{}'", port.trim())))?;
        if port == 0 {
            return Err(ClientError::Config("server port 0 is invalid".into()));
        }
        Ok(ServerAddress {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
