// Integration tests for the MessageU client
// These tests drive the protocol engine end-to-end against a scripted relay
// listening on an ephemeral local port.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use messageu::config::ServerAddress;
use messageu::cryptography::{self, RsaKeyPair};
use messageu::engine::{ClientEngine, IncomingContent, OutboundMessage};
use messageu::error::ClientError;
use messageu::protocol::{ClientId, MessageType, LIST_ENTRY_SIZE, REQUEST_HEADER_SIZE};
use messageu::{
    CLIENT_ID_SIZE, CLIENT_NAME_SIZE, CLIENT_VERSION, PACKET_SIZE, PUBLIC_KEY_SIZE,
    RSA_CIPHERTEXT_SIZE,
};

const ASSIGNED_ID: ClientId = ClientId([0x01; CLIENT_ID_SIZE]);
const ANNA_ID: ClientId = ClientId([0xA1; CLIENT_ID_SIZE]);
const BOB_ID: ClientId = ClientId([0xB2; CLIENT_ID_SIZE]);

// ============================================================================
// Scripted Relay Harness
// ============================================================================

/// Read one request frame off the socket: whole 1024-byte packets until the
/// header-declared payload is complete. Returns the frame without padding.
fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut packet = [0u8; PACKET_SIZE];
    stream.read_exact(&mut packet).unwrap();
    let payload_size = u32::from_le_bytes(packet[19..23].try_into().unwrap()) as usize;
    let total = REQUEST_HEADER_SIZE + payload_size;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&packet[..total.min(PACKET_SIZE)]);
    while frame.len() < total {
        stream.read_exact(&mut packet).unwrap();
        let wanted = (total - frame.len()).min(PACKET_SIZE);
        frame.extend_from_slice(&packet[..wanted]);
    }
    frame
}

/// Write a response frame padded out to whole packets, the way the relay
/// frames everything.
fn write_response(stream: &mut TcpStream, code: u16, payload: &[u8]) {
    let mut frame = Vec::with_capacity(7 + payload.len());
    frame.push(CLIENT_VERSION);
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.resize(frame.len().div_ceil(PACKET_SIZE) * PACKET_SIZE, 0);
    stream.write_all(&frame).unwrap();
}

/// Serve `exchanges` sequential connections. The handler maps (exchange
/// index, request frame) to (response code, response payload); every request
/// frame is also forwarded to the returned channel for assertions.
fn scripted_relay(
    exchanges: usize,
    mut handler: impl FnMut(usize, &[u8]) -> (u16, Vec<u8>) + Send + 'static,
) -> (ServerAddress, mpsc::Receiver<Vec<u8>>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let address = ServerAddress::parse(&format!("127.0.0.1:{port}")).unwrap();
    let (sender, receiver) = mpsc::channel();

    let handle = thread::spawn(move || {
        for index in 0..exchanges {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            let (code, payload) = handler(index, &request);
            sender.send(request).unwrap();
            write_response(&mut stream, code, &payload);
        }
    });
    (address, receiver, handle)
}

fn identity_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("messageu_it_{}_{}", tag, std::process::id()))
}

fn list_entry(id: &ClientId, name: &str) -> Vec<u8> {
    let mut entry = vec![0u8; LIST_ENTRY_SIZE];
    entry[..CLIENT_ID_SIZE].copy_from_slice(&id.0);
    entry[CLIENT_ID_SIZE..CLIENT_ID_SIZE + name.len()].copy_from_slice(name.as_bytes());
    entry
}

fn pending_record(sender: &ClientId, message_id: u32, message_type: u8, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::new();
    record.extend_from_slice(&sender.0);
    record.extend_from_slice(&message_id.to_le_bytes());
    record.push(message_type);
    record.extend_from_slice(&(body.len() as u32).to_le_bytes());
    record.extend_from_slice(body);
    record
}

fn registered_response() -> (u16, Vec<u8>) {
    (2000, ASSIGNED_ID.0.to_vec())
}

// ============================================================================
// Registration Tests
// ============================================================================

#[test]
fn test_register_wire_format_and_persistence() {
    let (address, requests, relay) = scripted_relay(1, |_, _| registered_response());
    let path = identity_file("register");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").expect("registration should succeed");
    relay.join().unwrap();

    // request: zeroed id, version, code 1000, payload size 415, name, key
    let request = requests.recv().unwrap();
    assert_eq!(
        request.len(),
        REQUEST_HEADER_SIZE + CLIENT_NAME_SIZE + PUBLIC_KEY_SIZE
    );
    assert_eq!(&request[..16], &[0u8; 16]);
    assert_eq!(request[16], CLIENT_VERSION);
    assert_eq!(&request[17..19], &[0xE8, 0x03]);
    assert_eq!(&request[19..23], &[0x9F, 0x01, 0x00, 0x00]);
    assert_eq!(&request[23..29], b"alice\0");

    // identity file: username, 32 hex chars, base64 key
    let contents = std::fs::read_to_string(&path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("alice"));
    assert_eq!(lines.next(), Some(ASSIGNED_ID.to_hex().as_str()));
    assert!(lines.next().is_some_and(|line| !line.is_empty()));

    // a fresh engine picks the identity back up
    let mut reloaded = ClientEngine::new(
        ServerAddress::parse("127.0.0.1:1234").unwrap(),
        path.clone(),
    );
    assert!(reloaded.load_identity().unwrap());
    assert_eq!(reloaded.username(), Some("alice"));

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_register_surfaces_server_error() {
    let (address, _requests, relay) = scripted_relay(1, |_, _| (9000, Vec::new()));
    let path = identity_file("register_err");

    let mut engine = ClientEngine::new(address, path.clone());
    let result = engine.register("alice");
    relay.join().unwrap();

    assert!(matches!(result, Err(ClientError::Server)));
    assert!(!path.exists());
}

#[test]
fn test_register_rejects_unexpected_response_code() {
    let (address, _requests, relay) = scripted_relay(1, |_, _| (2001, Vec::new()));
    let path = identity_file("register_code");

    let mut engine = ClientEngine::new(address, path.clone());
    let result = engine.register("alice");
    relay.join().unwrap();

    assert!(matches!(result, Err(ClientError::Protocol(_))));
}

// ============================================================================
// Clients List Tests
// ============================================================================

#[test]
fn test_clients_list_is_sorted_and_searchable() {
    let (address, _requests, relay) = scripted_relay(2, |index, _| match index {
        0 => registered_response(),
        _ => {
            let mut payload = list_entry(&BOB_ID, "bob");
            payload.extend_from_slice(&list_entry(&ANNA_ID, "anna"));
            (2001, payload)
        }
    });
    let path = identity_file("list");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    let usernames = engine.request_clients_list().unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(usernames, vec!["anna", "bob"]);
    assert!(engine.directory().find_by_id(&BOB_ID).is_some());
    assert!(engine.directory().find_by_username("anna").is_some());
}

#[test]
fn test_clients_list_empty_is_not_an_error() {
    let (address, _requests, relay) = scripted_relay(2, |index, _| match index {
        0 => registered_response(),
        _ => (2001, Vec::new()),
    });
    let path = identity_file("list_empty");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    let usernames = engine.request_clients_list().unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(usernames.is_empty());
}

#[test]
fn test_clients_list_rejects_unaligned_payload() {
    let (address, _requests, relay) = scripted_relay(2, |index, _| match index {
        0 => registered_response(),
        _ => (2001, vec![0u8; 100]),
    });
    let path = identity_file("list_corrupt");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    let result = engine.request_clients_list();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(result, Err(ClientError::Protocol(_))));
}

#[test]
fn test_clients_list_never_contains_self() {
    let (address, _requests, relay) = scripted_relay(2, |index, _| match index {
        0 => registered_response(),
        _ => {
            let mut payload = list_entry(&ASSIGNED_ID, "alice");
            payload.extend_from_slice(&list_entry(&BOB_ID, "bob"));
            (2001, payload)
        }
    });
    let path = identity_file("list_self");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    let usernames = engine.request_clients_list().unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(usernames, vec!["bob"]);
    assert!(engine.directory().find_by_id(&ASSIGNED_ID).is_none());
}

// ============================================================================
// Public Key Tests
// ============================================================================

#[test]
fn test_public_key_is_fetched_and_stored() {
    let bob_keys = RsaKeyPair::generate().unwrap();
    let bob_wire = bob_keys.public_wire().unwrap();
    let bob_wire_bytes = bob_wire.0;

    let (address, requests, relay) = scripted_relay(3, move |index, _| match index {
        0 => registered_response(),
        1 => (2001, list_entry(&BOB_ID, "bob")),
        _ => {
            let mut payload = BOB_ID.0.to_vec();
            payload.extend_from_slice(&bob_wire_bytes);
            (2002, payload)
        }
    });
    let path = identity_file("pubkey");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    engine.request_clients_list().unwrap();
    engine.request_public_key("bob").unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    // the request targeted bob's id
    let _register = requests.recv().unwrap();
    let _list = requests.recv().unwrap();
    let pubkey_request = requests.recv().unwrap();
    assert_eq!(&pubkey_request[23..39], &BOB_ID.0);

    let bob = engine.directory().find_by_id(&BOB_ID).unwrap();
    assert_eq!(bob.public_key.as_ref().map(|key| key.0), Some(bob_wire_bytes));
}

#[test]
fn test_public_key_with_mismatched_id_is_rejected() {
    let (address, _requests, relay) = scripted_relay(3, |index, _| match index {
        0 => registered_response(),
        1 => (2001, list_entry(&BOB_ID, "bob")),
        _ => {
            let mut payload = ANNA_ID.0.to_vec();
            payload.extend_from_slice(&[0u8; PUBLIC_KEY_SIZE]);
            (2002, payload)
        }
    });
    let path = identity_file("pubkey_mismatch");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    engine.request_clients_list().unwrap();
    let result = engine.request_public_key("bob");
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(result, Err(ClientError::Protocol(_))));
    let bob = engine.directory().find_by_id(&BOB_ID).unwrap();
    assert!(bob.public_key.is_none());
}

// ============================================================================
// Send Message Tests
// ============================================================================

#[test]
fn test_sym_key_request_then_sym_key_send() {
    let bob_keys = RsaKeyPair::generate().unwrap();
    let bob_wire_bytes = bob_keys.public_wire().unwrap().0;

    let (address, requests, relay) = scripted_relay(4, move |index, request| match index {
        0 => registered_response(),
        1 => (2001, list_entry(&BOB_ID, "bob")),
        2 => {
            let mut payload = BOB_ID.0.to_vec();
            payload.extend_from_slice(&bob_wire_bytes);
            (2002, payload)
        }
        _ => {
            // echo the destination id with an assigned message id
            let mut payload = request[23..39].to_vec();
            payload.extend_from_slice(&77u32.to_le_bytes());
            (2003, payload)
        }
    });
    let path = identity_file("symkey");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    engine.request_clients_list().unwrap();
    engine.request_public_key("bob").unwrap();
    let message_id = engine.send_message("bob", OutboundMessage::SymKey).unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(message_id, 77);

    // a fresh 16-byte session key is stored locally
    let session_key = engine
        .directory()
        .find_by_id(&BOB_ID)
        .unwrap()
        .session_key
        .expect("session key should be stored after a key send");

    // on the wire: type 2, exactly 128 bytes of RSA ciphertext that bob can
    // open to recover the same key
    for _ in 0..3 {
        requests.recv().unwrap();
    }
    let send_request = requests.recv().unwrap();
    assert_eq!(&send_request[23..39], &BOB_ID.0);
    assert_eq!(send_request[39], MessageType::SymKeySend as u8);
    let content_size = u32::from_le_bytes(send_request[40..44].try_into().unwrap());
    assert_eq!(content_size as usize, RSA_CIPHERTEXT_SIZE);
    let content = &send_request[44..];
    assert_eq!(content.len(), RSA_CIPHERTEXT_SIZE);
    assert_eq!(bob_keys.decrypt(content).unwrap(), session_key);
}

#[test]
fn test_sent_response_with_wrong_destination_is_rejected() {
    let (address, _requests, relay) = scripted_relay(3, |index, _| match index {
        0 => registered_response(),
        1 => (2001, list_entry(&BOB_ID, "bob")),
        _ => {
            let mut payload = ANNA_ID.0.to_vec();
            payload.extend_from_slice(&5u32.to_le_bytes());
            (2003, payload)
        }
    });
    let path = identity_file("sent_mismatch");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    engine.request_clients_list().unwrap();
    let result = engine.send_message("bob", OutboundMessage::SymKeyRequest);
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(result, Err(ClientError::Protocol(_))));
}

#[test]
fn test_large_text_message_spans_packets() {
    let bob_keys = RsaKeyPair::generate().unwrap();
    let bob_wire_bytes = bob_keys.public_wire().unwrap().0;

    let (address, requests, relay) = scripted_relay(5, move |index, request| match index {
        0 => registered_response(),
        1 => (2001, list_entry(&BOB_ID, "bob")),
        2 => {
            let mut payload = BOB_ID.0.to_vec();
            payload.extend_from_slice(&bob_wire_bytes);
            (2002, payload)
        }
        _ => {
            let mut payload = request[23..39].to_vec();
            payload.extend_from_slice(&(index as u32).to_le_bytes());
            (2003, payload)
        }
    });
    let path = identity_file("large_text");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    engine.request_clients_list().unwrap();
    engine.request_public_key("bob").unwrap();
    engine.send_message("bob", OutboundMessage::SymKey).unwrap();

    let text = "x".repeat(PACKET_SIZE * 3);
    engine
        .send_message("bob", OutboundMessage::Text(text.clone()))
        .unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    for _ in 0..3 {
        requests.recv().unwrap();
    }
    // recover the session key bob-side, then check the multi-packet text
    // request decrypts back to the original input
    let key_request = requests.recv().unwrap();
    let session_key: [u8; 16] = bob_keys
        .decrypt(&key_request[44..])
        .unwrap()
        .try_into()
        .unwrap();

    let text_request = requests.recv().unwrap();
    assert!(text_request.len() > PACKET_SIZE * 3);
    assert_eq!(text_request[39], MessageType::Text as u8);
    let content_size = u32::from_le_bytes(text_request[40..44].try_into().unwrap()) as usize;
    assert_eq!(text_request.len(), 44 + content_size);
    let decrypted = cryptography::aes_decrypt(&session_key, &text_request[44..]).unwrap();
    assert_eq!(decrypted, text.as_bytes());
}

// ============================================================================
// Pending Messages Tests
// ============================================================================

#[test]
fn test_fetch_pending_mixed_types_end_to_end() {
    // scenario: a key request from anna, bob's session key, then a text
    // from bob encrypted under that key. The relay needs the public key
    // captured during registration to build the key message, so it is
    // scripted by hand here.
    let session_key = cryptography::generate_symmetric_key();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let address = ServerAddress::parse(&format!("127.0.0.1:{port}")).unwrap();

    let relay = thread::spawn(move || {
        // exchange 1: register, capturing the client's public key
        let (mut stream, _) = listener.accept().unwrap();
        let request = read_request(&mut stream);
        let mut field = [0u8; PUBLIC_KEY_SIZE];
        field.copy_from_slice(&request[REQUEST_HEADER_SIZE + CLIENT_NAME_SIZE..]);
        let client_public = messageu::protocol::PublicKey(field);
        write_response(&mut stream, 2000, &ASSIGNED_ID.0);

        // exchange 2: clients list
        let (mut stream, _) = listener.accept().unwrap();
        read_request(&mut stream);
        let mut payload = list_entry(&ANNA_ID, "anna");
        payload.extend_from_slice(&list_entry(&BOB_ID, "bob"));
        write_response(&mut stream, 2001, &payload);

        // exchange 3: pending messages
        let (mut stream, _) = listener.accept().unwrap();
        read_request(&mut stream);
        let encrypted_key = cryptography::rsa_encrypt(&client_public, &session_key).unwrap();
        let ciphertext = cryptography::aes_encrypt(&session_key, b"hi");
        let mut payload = pending_record(&ANNA_ID, 1, MessageType::SymKeyRequest as u8, &[]);
        payload.extend_from_slice(&pending_record(
            &BOB_ID,
            2,
            MessageType::SymKeySend as u8,
            &encrypted_key,
        ));
        payload.extend_from_slice(&pending_record(
            &BOB_ID,
            3,
            MessageType::Text as u8,
            &ciphertext,
        ));
        write_response(&mut stream, 2004, &payload);
        session_key
    });

    let path = identity_file("pending_mixed");
    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    engine.request_clients_list().unwrap();
    let messages = engine.fetch_pending_messages().unwrap();
    let session_key = relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].from, "anna");
    assert_eq!(messages[0].content.to_string(), "Request for symmetric key.");
    assert_eq!(messages[1].from, "bob");
    assert_eq!(messages[1].content, IncomingContent::SymKeyAccepted);
    assert_eq!(messages[2].from, "bob");
    assert_eq!(messages[2].content.to_string(), "hi");
    assert_eq!(
        engine.directory().find_by_id(&BOB_ID).unwrap().session_key,
        Some(session_key)
    );
    assert!(engine.last_error().is_empty());
}

#[test]
fn test_fetch_pending_empty_queue() {
    let (address, _requests, relay) = scripted_relay(2, |index, _| match index {
        0 => registered_response(),
        _ => (2004, Vec::new()),
    });
    let path = identity_file("pending_empty");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    let messages = engine.fetch_pending_messages().unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(messages.is_empty());
    assert!(engine.last_error().is_empty());
}

#[test]
fn test_fetch_pending_corrupt_stream_returns_prior_records() {
    let (address, _requests, relay) = scripted_relay(2, |index, _| match index {
        0 => registered_response(),
        _ => {
            let mut payload = pending_record(&BOB_ID, 1, MessageType::SymKeyRequest as u8, &[]);
            // second record declares more bytes than the payload carries
            let mut bad = Vec::new();
            bad.extend_from_slice(&BOB_ID.0);
            bad.extend_from_slice(&2u32.to_le_bytes());
            bad.push(MessageType::Text as u8);
            bad.extend_from_slice(&10_000u32.to_le_bytes());
            payload.extend_from_slice(&bad);
            (2004, payload)
        }
    });
    let path = identity_file("pending_corrupt");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    let messages = engine.fetch_pending_messages().unwrap();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content.to_string(), "Request for symmetric key.");
    assert!(engine.last_error().contains("corrupt"));
}

#[test]
fn test_fetch_pending_rejects_unexpected_code() {
    let (address, _requests, relay) = scripted_relay(2, |index, _| match index {
        0 => registered_response(),
        _ => (2001, Vec::new()),
    });
    let path = identity_file("pending_code");

    let mut engine = ClientEngine::new(address, path.clone());
    engine.register("alice").unwrap();
    let result = engine.fetch_pending_messages();
    relay.join().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(result, Err(ClientError::Protocol(_))));
}
