use std::fmt;

use crate::error::ClientError;
use crate::{
    CLIENT_ID_SIZE, CLIENT_NAME_SIZE, CLIENT_VERSION, PUBLIC_KEY_SIZE, SYMMETRIC_KEY_SIZE,
};

pub const REQUEST_HEADER_SIZE: usize = CLIENT_ID_SIZE + 1 + 2 + 4; // 23
pub const RESPONSE_HEADER_SIZE: usize = 1 + 2 + 4; // 7
pub const LIST_ENTRY_SIZE: usize = CLIENT_ID_SIZE + CLIENT_NAME_SIZE; // 271
pub const SEND_MESSAGE_HEADER_SIZE: usize = CLIENT_ID_SIZE + 1 + 4; // 21
pub const PENDING_HEADER_SIZE: usize = CLIENT_ID_SIZE + 4 + 1 + 4; // 25

/// Relay-assigned 16-byte identifier. All-zero means "not assigned yet";
/// registration requests carry it and the relay ignores it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ClientId(pub [u8; CLIENT_ID_SIZE]);

impl ClientId {
    pub const ZERO: ClientId = ClientId([0u8; CLIENT_ID_SIZE]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<ClientId> {
        let bytes = hex::decode(s).ok()?;
        let id: [u8; CLIENT_ID_SIZE] = bytes.try_into().ok()?;
        Some(ClientId(id))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 160-byte serialized public key, exactly as it travels on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum RequestCode {
    Register = 1000,
    List = 1001,
    PublicKey = 1002,
    SendMessage = 1003,
    PendingMessages = 1004,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum ResponseCode {
    Registered = 2000,
    UserList = 2001,
    PublicKey = 2002,
    MessageSent = 2003,
    PendingMessages = 2004,
    Error = 9000,
}

impl ResponseCode {
    /// Expected payload size for the fixed-layout responses. Variable-size
    /// responses (user list, pending messages) accept any size including zero.
    pub fn fixed_payload_size(&self) -> Option<usize> {
        match self {
            ResponseCode::Registered => Some(CLIENT_ID_SIZE),
            ResponseCode::PublicKey => Some(CLIENT_ID_SIZE + PUBLIC_KEY_SIZE),
            ResponseCode::MessageSent => Some(CLIENT_ID_SIZE + 4),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MessageType {
    SymKeyRequest = 1,
    SymKeySend = 2,
    Text = 3,
    File = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            1 => Some(MessageType::SymKeyRequest),
            2 => Some(MessageType::SymKeySend),
            3 => Some(MessageType::Text),
            4 => Some(MessageType::File),
            _ => None,
        }
    }
}

/// 23-byte request header. Every multi-byte field is little-endian on the
/// wire regardless of host endianness; fields are written out one by one and
/// the packet buffer is never byte-swapped.
#[derive(Clone, Copy, Debug)]
pub struct RequestHeader {
    pub client_id: ClientId,
    pub code: RequestCode,
    pub payload_size: u32,
}

impl RequestHeader {
    pub fn new(client_id: ClientId, code: RequestCode, payload_size: u32) -> RequestHeader {
        RequestHeader {
            client_id,
            code,
            payload_size,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        buf[..CLIENT_ID_SIZE].copy_from_slice(&self.client_id.0);
        buf[16] = CLIENT_VERSION;
        buf[17..19].copy_from_slice(&(self.code as u16).to_le_bytes());
        buf[19..23].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }
}

/// 7-byte response header.
#[derive(Clone, Copy, Debug)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u16,
    pub payload_size: u32,
}

impl ResponseHeader {
    pub fn decode(buf: &[u8]) -> Result<ResponseHeader, ClientError> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(ClientError::Protocol(
                "response header is truncated".into(),
            ));
        }
        Ok(ResponseHeader {
            version: buf[0],
            code: u16::from_le_bytes([buf[1], buf[2]]),
            payload_size: u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]),
        })
    }

    /// Validate this header against the response code the caller expects.
    /// An explicit relay error (9000) and a code mismatch both fail the
    /// exchange; fixed-layout codes additionally require an exact payload
    /// size.
    pub fn validate(&self, expected: ResponseCode) -> Result<(), ClientError> {
        if self.code == ResponseCode::Error as u16 {
            return Err(ClientError::Server);
        }
        if self.code != expected as u16 {
            return Err(ClientError::Protocol(format!(
                "unexpected response code {} received, expected {}",
                self.code, expected as u16
            )));
        }
        if let Some(expected_size) = expected.fixed_payload_size() {
            if self.payload_size as usize != expected_size {
                return Err(ClientError::Protocol(format!(
                    "unexpected payload size {}, expected {}",
                    self.payload_size, expected_size
                )));
            }
        }
        Ok(())
    }
}

/// Write a username into the fixed 255-byte null-terminated wire field.
/// Callers validate the length beforehand; anything overlong is truncated to
/// keep the terminator intact.
fn encode_username(field: &mut [u8], username: &str) {
    let bytes = username.as_bytes();
    let len = bytes.len().min(CLIENT_NAME_SIZE - 1);
    field[..len].copy_from_slice(&bytes[..len]);
}

fn frame(header: RequestHeader, payload: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(REQUEST_HEADER_SIZE + payload.len());
    request.extend_from_slice(&header.encode());
    request.extend_from_slice(payload);
    request
}

/// Registration request: 255-byte username field followed by the 160-byte
/// public key. The client id field is all zeros; the relay assigns one.
pub fn encode_register(username: &str, public_key: &PublicKey) -> Vec<u8> {
    let mut payload = [0u8; CLIENT_NAME_SIZE + PUBLIC_KEY_SIZE];
    encode_username(&mut payload[..CLIENT_NAME_SIZE], username);
    payload[CLIENT_NAME_SIZE..].copy_from_slice(&public_key.0);
    frame(
        RequestHeader::new(ClientId::ZERO, RequestCode::Register, payload.len() as u32),
        &payload,
    )
}

pub fn encode_list(client_id: ClientId) -> Vec<u8> {
    frame(RequestHeader::new(client_id, RequestCode::List, 0), &[])
}

pub fn encode_public_key_request(client_id: ClientId, target: ClientId) -> Vec<u8> {
    frame(
        RequestHeader::new(client_id, RequestCode::PublicKey, CLIENT_ID_SIZE as u32),
        &target.0,
    )
}

/// Send-message request: destination id, one-byte message type, little-endian
/// content size, then the content itself.
pub fn encode_send_message(
    client_id: ClientId,
    destination: ClientId,
    message_type: MessageType,
    content: &[u8],
) -> Vec<u8> {
    let payload_size = SEND_MESSAGE_HEADER_SIZE + content.len();
    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&destination.0);
    payload.push(message_type as u8);
    payload.extend_from_slice(&(content.len() as u32).to_le_bytes());
    payload.extend_from_slice(content);
    frame(
        RequestHeader::new(client_id, RequestCode::SendMessage, payload_size as u32),
        &payload,
    )
}

pub fn encode_pending_request(client_id: ClientId) -> Vec<u8> {
    frame(
        RequestHeader::new(client_id, RequestCode::PendingMessages, 0),
        &[],
    )
}

pub fn decode_registered(payload: &[u8]) -> Result<ClientId, ClientError> {
    let id: [u8; CLIENT_ID_SIZE] = payload
        .try_into()
        .map_err(|_| ClientError::Protocol("registration payload is malformed".into()))?;
    Ok(ClientId(id))
}

pub fn decode_public_key(payload: &[u8]) -> Result<(ClientId, PublicKey), ClientError> {
    if payload.len() != CLIENT_ID_SIZE + PUBLIC_KEY_SIZE {
        return Err(ClientError::Protocol(
            "public key payload is malformed".into(),
        ));
    }
    let mut id = [0u8; CLIENT_ID_SIZE];
    id.copy_from_slice(&payload[..CLIENT_ID_SIZE]);
    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(&payload[CLIENT_ID_SIZE..]);
    Ok((ClientId(id), PublicKey(key)))
}

pub fn decode_message_sent(payload: &[u8]) -> Result<(ClientId, u32), ClientError> {
    if payload.len() != CLIENT_ID_SIZE + 4 {
        return Err(ClientError::Protocol(
            "message sent payload is malformed".into(),
        ));
    }
    let mut id = [0u8; CLIENT_ID_SIZE];
    id.copy_from_slice(&payload[..CLIENT_ID_SIZE]);
    let message_id = u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]);
    Ok((ClientId(id), message_id))
}

/// Decode one 271-byte user list entry. The name field is null-terminated;
/// bytes past the first null are ignored.
pub fn decode_list_entry(entry: &[u8; LIST_ENTRY_SIZE]) -> (ClientId, String) {
    let mut id = [0u8; CLIENT_ID_SIZE];
    id.copy_from_slice(&entry[..CLIENT_ID_SIZE]);
    let name_field = &entry[CLIENT_ID_SIZE..];
    let end = name_field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(name_field.len());
    let name = String::from_utf8_lossy(&name_field[..end]).into_owned();
    (ClientId(id), name)
}

/// Per-message header inside a pending-messages payload.
#[derive(Clone, Copy, Debug)]
pub struct PendingHeader {
    pub sender: ClientId,
    pub message_id: u32,
    pub message_type: u8,
    pub message_size: u32,
}

impl PendingHeader {
    /// Returns `None` when fewer than 25 bytes remain, which callers treat
    /// as stream corruption.
    pub fn decode(buf: &[u8]) -> Option<PendingHeader> {
        if buf.len() < PENDING_HEADER_SIZE {
            return None;
        }
        let mut sender = [0u8; CLIENT_ID_SIZE];
        sender.copy_from_slice(&buf[..CLIENT_ID_SIZE]);
        Some(PendingHeader {
            sender: ClientId(sender),
            message_id: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            message_type: buf[20],
            message_size: u32::from_le_bytes([buf[21], buf[22], buf[23], buf[24]]),
        })
    }
}
