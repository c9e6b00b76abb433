use std::fmt::{self, Write as _};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::config::ServerAddress;
use crate::cryptography::{self, RsaKeyPair};
use crate::directory::PeerDirectory;
use crate::error::ClientError;
use crate::identity::Identity;
use crate::protocol::{
    self, MessageType, PendingHeader, ResponseCode, ResponseHeader, LIST_ENTRY_SIZE,
    PENDING_HEADER_SIZE, RESPONSE_HEADER_SIZE,
};
use crate::transport::Transport;
use crate::{CLIENT_NAME_SIZE, PACKET_SIZE, SYMMETRIC_KEY_SIZE};

/// Outbound message, one variant per wire message type. Each variant
/// carries exactly the data its payload construction needs.
pub enum OutboundMessage {
    /// Ask the peer to send their symmetric key. No content.
    SymKeyRequest,
    /// Generate a fresh session key and send it RSA-encrypted under the
    /// peer's public key.
    SymKey,
    /// Text, AES-encrypted with the negotiated session key.
    Text(String),
    /// A file's contents, AES-encrypted with the negotiated session key.
    File(PathBuf),
}

impl OutboundMessage {
    fn message_type(&self) -> MessageType {
        match self {
            OutboundMessage::SymKeyRequest => MessageType::SymKeyRequest,
            OutboundMessage::SymKey => MessageType::SymKeySend,
            OutboundMessage::Text(_) => MessageType::Text,
            OutboundMessage::File(_) => MessageType::File,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            OutboundMessage::SymKeyRequest => "symmetric key request",
            OutboundMessage::SymKey => "symmetric key",
            OutboundMessage::Text(_) => "text message",
            OutboundMessage::File(_) => "file",
        }
    }
}

/// One decoded pending message.
pub struct IncomingMessage {
    pub from: String,
    pub message_id: u32,
    pub content: IncomingContent,
}

/// Decoded content of a pending message, one variant per message type plus
/// a variant for ciphertext the client has no key for.
#[derive(Debug, PartialEq)]
pub enum IncomingContent {
    SymKeyRequest,
    SymKeyAccepted,
    Text(String),
    File(PathBuf),
    Unreadable,
}

impl fmt::Display for IncomingContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncomingContent::SymKeyRequest => f.write_str("Request for symmetric key."),
            IncomingContent::SymKeyAccepted => f.write_str("symmetric key received"),
            IncomingContent::Text(text) => f.write_str(text),
            IncomingContent::File(path) => write!(f, "{}", path.display()),
            IncomingContent::Unreadable => f.write_str("can't decrypt message"),
        }
    }
}

/// The protocol engine. Owns the transport, the local identity and the peer
/// directory; every public operation is one blocking request-response
/// exchange against the relay.
///
/// Operations return the first error they hit. Work that can partially
/// succeed (fetching pending messages) additionally collects per-message
/// diagnostics into a last-error buffer the caller can read afterwards.
pub struct ClientEngine {
    transport: Transport,
    identity: Option<Identity>,
    directory: PeerDirectory,
    client_info: PathBuf,
    last_error: String,
}

impl ClientEngine {
    pub fn new(server: ServerAddress, client_info: PathBuf) -> ClientEngine {
        ClientEngine {
            transport: Transport::new(server),
            identity: None,
            directory: PeerDirectory::new(),
            client_info,
            last_error: String::new(),
        }
    }

    /// Load the identity file if it exists. Returns whether the client is
    /// registered; a missing file just means "not yet", a file that exists
    /// but doesn't parse is a configuration error.
    pub fn load_identity(&mut self) -> Result<bool, ClientError> {
        if !self.client_info.exists() {
            return Ok(false);
        }
        self.identity = Some(Identity::load(&self.client_info)?);
        Ok(true)
    }

    pub fn username(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.username.as_str())
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// Diagnostics accumulated by the last partially-successful operation.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    fn identity(&self) -> Result<&Identity, ClientError> {
        self.identity
            .as_ref()
            .ok_or_else(|| ClientError::State("you must register first".into()))
    }

    /// Register with the relay:
    ///     - validate the username (alphanumeric, shorter than the name field)
    ///     - generate a fresh RSA keypair
    ///     - exchange a registration request for the assigned client id
    ///     - persist the identity file
    /// A persist failure after the relay accepted the registration is
    /// surfaced but keeps the in-memory identity; the relay is not rolled
    /// back.
    pub fn register(&mut self, username: &str) -> Result<(), ClientError> {
        validate_username(username)?;

        let keys = RsaKeyPair::generate()?;
        let public_key = keys.public_wire()?;
        let request = protocol::encode_register(username, &public_key);
        let payload = self.exchange_fixed(&request, ResponseCode::Registered)?;
        let id = protocol::decode_registered(&payload)?;
        info!("registered as '{}' with id {}", username, id);

        let identity = Identity {
            id,
            username: username.to_string(),
            keys,
        };
        let stored = identity.store(&self.client_info);
        self.identity = Some(identity);
        stored
    }

    /// Fetch the user roster and rebuild the peer directory from it.
    /// Returns the usernames in alphabetical order; an empty list is not an
    /// error.
    pub fn request_clients_list(&mut self) -> Result<Vec<String>, ClientError> {
        let self_id = self.identity()?.id;
        let request = protocol::encode_list(self_id);
        let payload = self.exchange_variable(&request, ResponseCode::UserList)?;

        if payload.len() % LIST_ENTRY_SIZE != 0 {
            return Err(ClientError::Protocol(
                "clients list received is corrupted (invalid size)".into(),
            ));
        }

        let mut roster = Vec::with_capacity(payload.len() / LIST_ENTRY_SIZE);
        for chunk in payload.chunks_exact(LIST_ENTRY_SIZE) {
            let entry: &[u8; LIST_ENTRY_SIZE] = chunk
                .try_into()
                .map_err(|_| ClientError::Protocol("clients list entry is malformed".into()))?;
            let (id, name) = protocol::decode_list_entry(entry);
            if id == self_id {
                continue;
            }
            roster.push((id, name));
        }
        debug!("received {} roster entries", roster.len());
        self.directory.replace_all(roster);
        Ok(self.directory.sorted_usernames())
    }

    /// Fetch a peer's public key and store it in the directory. The relay's
    /// answer must echo the requested id.
    pub fn request_public_key(&mut self, username: &str) -> Result<(), ClientError> {
        let identity = self.identity()?;
        if username == identity.username {
            return Err(ClientError::State(format!(
                "{username}, your key is stored in the system already"
            )));
        }
        let target = self
            .directory
            .find_by_username(username)
            .ok_or_else(|| unknown_username(username))?
            .id;

        let request = protocol::encode_public_key_request(identity.id, target);
        let payload = self.exchange_fixed(&request, ResponseCode::PublicKey)?;
        let (id, key) = protocol::decode_public_key(&payload)?;
        if id != target {
            return Err(ClientError::Protocol(
                "unexpected client id was received".into(),
            ));
        }
        if !self.directory.set_public_key(&id, key) {
            return Err(ClientError::State(format!(
                "couldn't assign public key for user {username}, please request the clients list again"
            )));
        }
        Ok(())
    }

    /// Send one message to a peer. Returns the message id the relay
    /// assigned.
    ///
    /// Payload construction is type-specific: a key request has no content,
    /// a key send needs the peer's public key (a fresh session key is
    /// generated and stored before it is encrypted), text and files need an
    /// established session key.
    pub fn send_message(
        &mut self,
        username: &str,
        message: OutboundMessage,
    ) -> Result<u32, ClientError> {
        let identity = self.identity()?;
        if username == identity.username {
            return Err(ClientError::State(format!(
                "{username}, you can't send a {} to yourself",
                message.description()
            )));
        }
        let self_id = identity.id;
        let peer = self
            .directory
            .find_by_username(username)
            .ok_or_else(|| unknown_username(username))?
            .clone();

        let content = match &message {
            OutboundMessage::SymKeyRequest => Vec::new(),
            OutboundMessage::SymKey => {
                let public_key = peer.public_key.as_ref().ok_or_else(|| {
                    ClientError::State(format!("couldn't find {username}'s public key"))
                })?;
                let session_key = cryptography::generate_symmetric_key();
                if !self.directory.set_session_key(&peer.id, session_key) {
                    return Err(ClientError::State(format!(
                        "failed storing symmetric key of user {username}, please request the clients list again"
                    )));
                }
                cryptography::rsa_encrypt(public_key, &session_key)?
            }
            OutboundMessage::Text(text) => {
                if text.is_empty() {
                    return Err(ClientError::State("no text was provided".into()));
                }
                let session_key = peer.session_key.ok_or_else(|| {
                    ClientError::State(format!("couldn't find {username}'s symmetric key"))
                })?;
                cryptography::aes_encrypt(&session_key, text.as_bytes())
            }
            OutboundMessage::File(path) => {
                let session_key = peer.session_key.ok_or_else(|| {
                    ClientError::State(format!("couldn't find {username}'s symmetric key"))
                })?;
                let bytes = fs::read(path).map_err(|e| {
                    ClientError::State(format!("couldn't read file {}: {e}", path.display()))
                })?;
                cryptography::aes_encrypt(&session_key, &bytes)
            }
        };

        let request =
            protocol::encode_send_message(self_id, peer.id, message.message_type(), &content);
        let payload = self.exchange_fixed(&request, ResponseCode::MessageSent)?;
        let (destination, message_id) = protocol::decode_message_sent(&payload)?;
        if destination != peer.id {
            return Err(ClientError::Protocol(
                "unexpected client id was received".into(),
            ));
        }
        debug!("message {} accepted for {}", message_id, username);
        Ok(message_id)
    }

    /// Fetch and decode everything the relay has queued for this client.
    ///
    /// Decoding is best effort: a message that fails on its own (unknown
    /// sender key, bad ciphertext, unknown type) is skipped with a note in
    /// the last-error buffer, and parsing continues at the next record.
    /// Only a record that no longer fits in the remaining payload stops the
    /// parse, returning what was decoded up to that point.
    pub fn fetch_pending_messages(&mut self) -> Result<Vec<IncomingMessage>, ClientError> {
        let self_id = self.identity()?.id;
        let request = protocol::encode_pending_request(self_id);
        let payload = self.exchange_variable(&request, ResponseCode::PendingMessages)?;
        self.last_error.clear();
        Ok(self.process_pending_payload(&payload))
    }

    fn process_pending_payload(&mut self, payload: &[u8]) -> Vec<IncomingMessage> {
        let mut messages = Vec::new();
        let mut cursor = 0usize;

        let identity = match self.identity.as_ref() {
            Some(identity) => identity,
            None => return messages,
        };

        while cursor < payload.len() {
            let header = match PendingHeader::decode(&payload[cursor..]) {
                Some(header) => header,
                None => {
                    warn!("pending payload is corrupt, {} trailing bytes", payload.len() - cursor);
                    let _ = writeln!(
                        self.last_error,
                        "payload is corrupt and was ignored past message #{} (truncated message header)",
                        messages.len()
                    );
                    break;
                }
            };
            let size = header.message_size as usize;
            let remaining = payload.len() - cursor - PENDING_HEADER_SIZE;
            if size > remaining {
                warn!(
                    "pending message #{} declares {} bytes but only {} remain",
                    header.message_id, size, remaining
                );
                let _ = writeln!(
                    self.last_error,
                    "payload is corrupt and was ignored past message #{} (invalid message length)",
                    header.message_id
                );
                break;
            }
            let body = &payload[cursor + PENDING_HEADER_SIZE..cursor + PENDING_HEADER_SIZE + size];
            cursor += PENDING_HEADER_SIZE + size;

            // Senders missing from the roster snapshot are still relayed;
            // show the raw id in that case.
            let sender = self.directory.find_by_id(&header.sender).cloned();
            let from = match &sender {
                Some(peer) => peer.username.clone(),
                None => format!("Unknown client ID: {}", header.sender),
            };

            match MessageType::from_u8(header.message_type) {
                Some(MessageType::SymKeyRequest) => {
                    messages.push(IncomingMessage {
                        from,
                        message_id: header.message_id,
                        content: IncomingContent::SymKeyRequest,
                    });
                }
                Some(MessageType::SymKeySend) => {
                    if size == 0 {
                        let _ = writeln!(
                            self.last_error,
                            "\tMessage #{}: can't decrypt symmetric key, content is empty",
                            header.message_id
                        );
                        continue;
                    }
                    let key = match identity.keys.decrypt(body) {
                        Ok(key) => key,
                        Err(_) => {
                            let _ = writeln!(
                                self.last_error,
                                "\tMessage #{}: can't decrypt symmetric key",
                                header.message_id
                            );
                            continue;
                        }
                    };
                    let key: [u8; SYMMETRIC_KEY_SIZE] = match key.try_into() {
                        Ok(key) => key,
                        Err(key) => {
                            let _ = writeln!(
                                self.last_error,
                                "\tMessage #{}: invalid symmetric key size ({})",
                                header.message_id,
                                key.len()
                            );
                            continue;
                        }
                    };
                    if self.directory.set_session_key(&header.sender, key) {
                        messages.push(IncomingMessage {
                            from,
                            message_id: header.message_id,
                            content: IncomingContent::SymKeyAccepted,
                        });
                    } else {
                        let _ = writeln!(
                            self.last_error,
                            "\tMessage #{}: couldn't store symmetric key of {from}",
                            header.message_id
                        );
                    }
                }
                Some(MessageType::Text) => {
                    let content = sender
                        .as_ref()
                        .and_then(|peer| peer.session_key)
                        .and_then(|key| cryptography::aes_decrypt(&key, body).ok())
                        .map(|plaintext| {
                            IncomingContent::Text(String::from_utf8_lossy(&plaintext).into_owned())
                        })
                        .unwrap_or(IncomingContent::Unreadable);
                    messages.push(IncomingMessage {
                        from,
                        message_id: header.message_id,
                        content,
                    });
                }
                Some(MessageType::File) => {
                    let plaintext = sender
                        .as_ref()
                        .and_then(|peer| peer.session_key)
                        .and_then(|key| cryptography::aes_decrypt(&key, body).ok());
                    match plaintext {
                        Some(plaintext) => match save_received_file(&from, &plaintext) {
                            Ok(path) => messages.push(IncomingMessage {
                                from,
                                message_id: header.message_id,
                                content: IncomingContent::File(path),
                            }),
                            Err(e) => {
                                let _ = writeln!(
                                    self.last_error,
                                    "\tMessage #{}: failed to save file on disk: {e}",
                                    header.message_id
                                );
                            }
                        },
                        None => messages.push(IncomingMessage {
                            from,
                            message_id: header.message_id,
                            content: IncomingContent::Unreadable,
                        }),
                    }
                }
                None => {
                    let _ = writeln!(
                        self.last_error,
                        "\tMessage #{}: unknown message type {}, skipped",
                        header.message_id, header.message_type
                    );
                }
            }
        }
        messages
    }

    /// Exchange a request for a fixed-layout response over a fresh
    /// connection.
    fn exchange_fixed(
        &mut self,
        request: &[u8],
        expected: ResponseCode,
    ) -> Result<Vec<u8>, ClientError> {
        let payload_size = expected.fixed_payload_size().unwrap_or(0);
        let response = self
            .transport
            .send_receive(request, RESPONSE_HEADER_SIZE + payload_size)?;
        let header = ResponseHeader::decode(&response)?;
        debug!("response header: version {} code {}", header.version, header.code);
        header.validate(expected)?;
        Ok(response[RESPONSE_HEADER_SIZE..].to_vec())
    }

    /// Exchange a request for a variable-size response. The first packet
    /// carries the header and the start of the payload; the rest streams in
    /// packet-sized receives.
    fn exchange_variable(
        &mut self,
        request: &[u8],
        expected: ResponseCode,
    ) -> Result<Vec<u8>, ClientError> {
        self.transport.connect()?;
        let result = self.exchange_variable_inner(request, expected);
        self.transport.close();
        result
    }

    fn exchange_variable_inner(
        &mut self,
        request: &[u8],
        expected: ResponseCode,
    ) -> Result<Vec<u8>, ClientError> {
        self.transport.send(request)?;
        let first = self.transport.receive(PACKET_SIZE)?;
        let header = ResponseHeader::decode(&first)?;
        debug!("response header: version {} code {}", header.version, header.code);
        header.validate(expected)?;

        let size = header.payload_size as usize;
        let mut payload = Vec::with_capacity(size);
        let available = size.min(PACKET_SIZE - RESPONSE_HEADER_SIZE);
        payload.extend_from_slice(&first[RESPONSE_HEADER_SIZE..RESPONSE_HEADER_SIZE + available]);
        while payload.len() < size {
            let wanted = (size - payload.len()).min(PACKET_SIZE);
            let chunk = self.transport.receive(wanted)?;
            payload.extend_from_slice(&chunk);
        }
        debug!("received {} payload bytes", payload.len());
        Ok(payload)
    }
}

fn validate_username(username: &str) -> Result<(), ClientError> {
    if username.is_empty() || username.len() >= CLIENT_NAME_SIZE {
        return Err(ClientError::State("invalid username length".into()));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ClientError::State(
            "invalid username, it may only contain letters and numbers".into(),
        ));
    }
    Ok(())
}

fn unknown_username(username: &str) -> ClientError {
    ClientError::State(format!(
        "username '{username}' doesn't exist, please check your input or request the clients list again"
    ))
}

/// Write a received file under `<tmp>/MessageU/<sender>_<ms_since_epoch>`.
fn save_received_file(sender: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
    let directory = std::env::temp_dir().join("MessageU");
    fs::create_dir_all(&directory)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let path = directory.join(format!("{sender}_{timestamp}"));
    fs::write(&path, contents)?;
    Ok(path)
}
