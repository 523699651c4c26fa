//! Startup, SCRAM-SHA-256 and a first result set, played against a
//! scripted server that computes its side of SCRAM independently.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use pgwire_core::prelude::*;
use pgwire_core::protocol::frontend::PROTOCOL_VERSION;
use pgwire_core::protocol::{RawMessage, SaslState, TransactionStatus};
use pgwire_core::types::{ArrayEntry, oid};
use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};

const PASSWORD: &str = "s3cret";
const SALT: &[u8] = b"pgwire-test-salt";
const ITERATIONS: u32 = 4096;

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Server half of SCRAM-SHA-256.
struct ScramServer {
    salted: [u8; 32],
    client_first_bare: String,
    server_first: String,
    nonce: String,
}

impl ScramServer {
    fn new(client_first: &str) -> Self {
        let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
        let client_nonce = client_first_bare.strip_prefix("n=*,r=").unwrap();
        let nonce = format!("{client_nonce}Zm9vYmFyYmF6");
        let server_first = format!("r={nonce},s={},i={ITERATIONS}", BASE64.encode(SALT));
        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(PASSWORD.as_bytes(), SALT, ITERATIONS, &mut salted);
        Self {
            salted,
            client_first_bare,
            server_first,
            nonce,
        }
    }

    /// Check the client proof and answer with `v=<server signature>`.
    fn finish(&self, client_final: &str) -> Result<String, &'static str> {
        let (without_proof, proof) = client_final.rsplit_once(",p=").ok_or("no proof")?;
        if without_proof != format!("c=biws,r={}", self.nonce) {
            return Err("bad channel binding or nonce");
        }
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, without_proof
        );
        let client_key = hmac(&self.salted, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof = BASE64.decode(proof).map_err(|_| "proof not base64")?;
        let recovered: Vec<u8> = proof
            .iter()
            .zip(client_signature)
            .map(|(p, s)| p ^ s)
            .collect();
        if Sha256::digest(&recovered)[..] != stored_key[..] {
            return Err("wrong password");
        }
        let server_key = hmac(&self.salted, b"Server Key");
        Ok(format!(
            "v={}",
            BASE64.encode(hmac(&server_key, auth_message.as_bytes()))
        ))
    }
}

fn auth(enc: &mut Encoder, code: i32, data: &[u8]) -> Bytes {
    enc.init(Some(b'R')).i32(code).bin(data).flush()
}

/// Feed `stream` in chunks of `step` bytes and collect decoded messages.
fn parse_in_chunks(parser: &mut MessageParser, stream: &[u8], step: usize) -> Vec<BackendMessage> {
    stream
        .chunks(step)
        .flat_map(|chunk| parser.parse_backend(chunk).unwrap())
        .collect()
}

fn client_frame(bytes: &[u8]) -> RawMessage {
    let mut parser = MessageParser::new();
    let mut frames = parser.parse(bytes).unwrap();
    parser.finish().unwrap();
    assert_eq!(frames.len(), 1);
    frames.remove(0)
}

#[test]
fn test_scram_handshake_then_rows() {
    let mut enc = Encoder::new();
    let mut parser = MessageParser::new();

    let startup = FrontendMessage::Startup {
        params: vec![
            ("user".into(), "app".into()),
            ("database".into(), "app".into()),
        ],
    }
    .to_bytes()
    .unwrap();
    let length = i32::from_be_bytes(startup[0..4].try_into().unwrap());
    assert_eq!(length as usize, startup.len());
    assert_eq!(
        i32::from_be_bytes(startup[4..8].try_into().unwrap()),
        PROTOCOL_VERSION
    );

    // AuthenticationSASL, one byte at a time
    let offer = auth(&mut enc, 10, b"SCRAM-SHA-256\0\0");
    let messages = parse_in_chunks(&mut parser, &offer, 1);
    let [BackendMessage::AuthenticationSASL(mechanisms)] = &messages[..] else {
        panic!("expected AuthenticationSASL, got {messages:?}");
    };

    let (mut session, client_first) = SaslSession::start(mechanisms).unwrap();
    let initial = FrontendMessage::SaslInitialResponse {
        mechanism: session.mechanism().to_string(),
        data: client_first.clone().into_bytes(),
    }
    .to_bytes()
    .unwrap();
    let frame = client_frame(&initial);
    assert_eq!(frame.tag, b'p');
    assert!(frame.body.starts_with(b"SCRAM-SHA-256\0"));
    assert!(frame.body.ends_with(client_first.as_bytes()));

    let server = ScramServer::new(&client_first);
    let cont = auth(&mut enc, 11, server.server_first.as_bytes());
    let messages = parse_in_chunks(&mut parser, &cont, 7);
    let [BackendMessage::AuthenticationSASLContinue(server_first)] = &messages[..] else {
        panic!("expected AuthenticationSASLContinue, got {messages:?}");
    };

    let client_final = session.continue_session(PASSWORD, server_first).unwrap();
    let response = FrontendMessage::SaslResponse(client_final.into_bytes())
        .to_bytes()
        .unwrap();
    let response = client_frame(&response);
    assert_eq!(response.tag, b'p');
    let server_final = server.finish(std::str::from_utf8(&response.body).unwrap()).unwrap();

    // Final, Ok, ParameterStatus, BackendKeyData, ReadyForQuery in one burst
    let mut burst = Vec::new();
    burst.extend_from_slice(&auth(&mut enc, 12, server_final.as_bytes()));
    burst.extend_from_slice(&auth(&mut enc, 0, &[]));
    burst.extend_from_slice(&enc.init(Some(b'S')).cstr("server_version").cstr("16.2").flush());
    burst.extend_from_slice(&enc.init(Some(b'K')).i32(4242).i32(-99).flush());
    burst.extend_from_slice(&enc.init(Some(b'Z')).u8(b'I').flush());

    let messages = parse_in_chunks(&mut parser, &burst, 13);
    assert_eq!(messages.len(), 5);
    let BackendMessage::AuthenticationSASLFinal(final_message) = &messages[0] else {
        panic!("expected AuthenticationSASLFinal, got {:?}", messages[0]);
    };
    session.finalize(final_message).unwrap();
    assert_eq!(session.state(), SaslState::Verified);
    assert_eq!(messages[1], BackendMessage::AuthenticationOk);
    assert_eq!(
        messages[2],
        BackendMessage::ParameterStatus {
            name: "server_version".into(),
            value: "16.2".into()
        }
    );
    assert_eq!(
        messages[3],
        BackendMessage::BackendKeyData {
            process_id: 4242,
            secret_key: -99
        }
    );
    assert_eq!(messages[4], BackendMessage::ReadyForQuery(TransactionStatus::Idle));
    parser.finish().unwrap();

    // RowDescription + DataRow: binary numeric, text array, text timestamp
    let mut rows = Vec::new();
    enc.init(Some(b'T')).i16(3);
    for (name, type_oid, format) in [
        ("amount", oid::NUMERIC, 1i16),
        ("tags", oid::INT4_ARRAY, 0),
        ("at", oid::TIMESTAMPTZ, 0),
    ] {
        enc.cstr(name).i32(0).i16(0).i32(type_oid as i32).i16(-1).i32(-1).i16(format);
    }
    rows.extend_from_slice(&enc.flush());

    let amount = [0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x04, 0xd2];
    let tags = b"{1,{2,NULL}}";
    let at = b"2023-01-01 00:00:00Z";
    enc.init(Some(b'D')).i16(3);
    for column in [&amount[..], &tags[..], &at[..]] {
        enc.i32(column.len() as i32).bin(column);
    }
    rows.extend_from_slice(&enc.flush());
    rows.extend_from_slice(&enc.init(Some(b'C')).cstr("SELECT 1").flush());

    let messages = parse_in_chunks(&mut parser, &rows, 5);
    let BackendMessage::RowDescription(fields) = &messages[0] else {
        panic!("expected RowDescription");
    };
    let BackendMessage::DataRow(columns) = &messages[1] else {
        panic!("expected DataRow");
    };
    let values: Vec<PgValue> = fields
        .iter()
        .zip(columns)
        .map(|(field, column)| decode_value(field.type_oid, field.format, column.as_deref()).unwrap())
        .collect();

    let PgValue::Numeric(amount) = &values[0] else {
        panic!("expected numeric, got {:?}", values[0]);
    };
    assert_eq!(amount.to_string(), "1.1234");
    assert_eq!(
        values[1],
        PgValue::Array(vec![
            ArrayEntry::Value(PgValue::Int4(1)),
            ArrayEntry::Nested(vec![ArrayEntry::Value(PgValue::Int4(2)), ArrayEntry::Null]),
        ])
    );
    let PgValue::Timestamp(at) = &values[2] else {
        panic!("expected timestamp, got {:?}", values[2]);
    };
    assert_eq!(at.to_string(), "2023-01-01 00:00:00+00");
    assert_eq!(messages[2], BackendMessage::CommandComplete("SELECT 1".into()));
}

#[test]
fn test_wrong_password_never_verifies() {
    let (mut session, client_first) = SaslSession::start(&["SCRAM-SHA-256"]).unwrap();
    let server = ScramServer::new(&client_first);
    let client_final = session
        .continue_session("not-the-password", server.server_first.as_bytes())
        .unwrap();
    assert_eq!(server.finish(&client_final), Err("wrong password"));

    // A signature made for another exchange is rejected too.
    let forged = format!("v={}", BASE64.encode([7u8; 32]));
    assert!(session.finalize(forged.as_bytes()).is_err());
    assert_eq!(session.state(), SaslState::Failed);
}

#[test]
fn test_error_response_mid_stream() {
    let mut enc = Encoder::new();
    let mut stream = enc
        .init(Some(b'E'))
        .u8(b'S')
        .cstr("FATAL")
        .u8(b'C')
        .cstr("28P01")
        .u8(b'M')
        .cstr("password authentication failed for user \"app\"")
        .u8(0)
        .flush()
        .to_vec();
    stream.extend_from_slice(&[b'Z', 0, 0]);

    let mut parser = MessageParser::new();
    let messages = parser.parse_backend(&stream).unwrap();
    let [BackendMessage::ErrorResponse(fields)] = &messages[..] else {
        panic!("expected ErrorResponse, got {messages:?}");
    };
    assert_eq!(fields.severity(), "FATAL");
    assert_eq!(fields.code(), "28P01");
    assert!(fields.message().starts_with("password authentication failed"));

    let err = PgWireError::from(parser.finish().unwrap_err());
    assert_eq!(err.kind(), ErrorKind::ProtocolFraming);
}
