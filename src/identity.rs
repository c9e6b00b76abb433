use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::cryptography::RsaKeyPair;
use crate::error::ClientError;
use crate::protocol::ClientId;
use crate::CLIENT_NAME_SIZE;

/// The local user's identity: username, relay-assigned id and the long-term
/// RSA keypair. Created once on successful registration, loaded from the
/// identity file on every later startup, never mutated.
///
/// File layout, three logical records:
/// ```text
/// <username>
/// <32 hex chars of the client id>
/// <base64 private key, possibly wrapped across lines>
/// ```
pub struct Identity {
    pub id: ClientId,
    pub username: String,
    pub keys: RsaKeyPair,
}

impl Identity {
    pub fn load(path: &Path) -> Result<Identity, ClientError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("couldn't open {}: {e}", path.display())))?;
        let mut lines = contents.lines();

        let username = lines
            .next()
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if username.is_empty() || username.len() >= CLIENT_NAME_SIZE {
            return Err(ClientError::Config(format!(
                "invalid username read from {}",
                path.display()
            )));
        }

        let uuid_line = lines.next().map(str::trim).unwrap_or("");
        let id = ClientId::from_hex(uuid_line).ok_or_else(|| {
            ClientError::Config(format!(
                "couldn't parse client UUID from {}",
                path.display()
            ))
        })?;

        // All remaining lines decode and concatenate into one DER blob.
        let mut der = Vec::new();
        for line in lines {
            let decoded = BASE64.decode(line.trim()).map_err(|_| {
                ClientError::Config(format!(
                    "couldn't decode private key from {}",
                    path.display()
                ))
            })?;
            der.extend_from_slice(&decoded);
        }
        if der.is_empty() {
            return Err(ClientError::Config(format!(
                "couldn't read private key from {}",
                path.display()
            )));
        }
        let keys = RsaKeyPair::from_der(&der).map_err(|_| {
            ClientError::Config(format!(
                "couldn't parse private key from {}",
                path.display()
            ))
        })?;

        Ok(Identity { id, username, keys })
    }

    /// Overwrite the identity file in one truncate-and-write pass.
    pub fn store(&self, path: &Path) -> Result<(), ClientError> {
        let der = self.keys.private_der()?;
        let contents = format!(
            "{}\n{}\n{}\n",
            self.username,
            self.id.to_hex(),
            BASE64.encode(der)
        );
        fs::write(path, contents)
            .map_err(|e| ClientError::Persist(format!("couldn't write {}: {e}", path.display())))
    }
}
