//! SCRAM-SHA-256 Authentication
//!
//! Implements the SASL SCRAM-SHA-256 handshake as a strictly ordered state
//! machine, plus the legacy MD5 password response.
//! Reference: RFC 5802, RFC 7677, PostgreSQL SASL documentation.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Length of the random part of the client nonce, before base64.
const NONCE_BYTES: usize = 18;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    Created,
    InitialResponseSent,
    ResponseSent,
    Verified,
    Failed,
}

/// SASL failures. Every one of them is terminal for the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("SCRAM-SHA-256 not offered by server (offered: {0:?})")]
    MechanismNotOffered(Vec<String>),

    #[error("SASL step out of order: expected state {expected:?}, session is {actual:?}")]
    UnexpectedState {
        expected: SaslState,
        actual: SaslState,
    },

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("server message is not valid UTF-8")]
    NotUtf8,

    #[error("invalid attribute pair at offset {offset} in {message:?}")]
    InvalidAttributePair { offset: usize, message: String },

    #[error("server-first-message: nonce missing")]
    MissingNonce,

    #[error("server-first-message: nonce must only contain printable characters")]
    NonPrintableNonce,

    #[error("server-first-message: nonce {server:?} does not start with client nonce {client:?}")]
    NonceMismatch { client: String, server: String },

    #[error("server-first-message: nonce ({server_len} chars) is not longer than client nonce ({client_len} chars)")]
    NonceTooShort { client_len: usize, server_len: usize },

    #[error("server-first-message: salt missing")]
    MissingSalt,

    #[error("server-first-message: salt is not base64: {0:?}")]
    InvalidSalt(String),

    #[error("server-first-message: iteration count missing")]
    MissingIterations,

    #[error("server-first-message: invalid iteration count {0:?}")]
    InvalidIterations(String),

    #[error("server-final-message: server signature missing")]
    MissingServerSignature,

    #[error("server-final-message: server signature is not base64")]
    InvalidServerSignature,

    #[error("server-final-message: server signature does not match")]
    SignatureMismatch,
}

/// SCRAM-SHA-256 client session.
///
/// ```
/// use pgwire_core::protocol::{SaslSession, SaslState};
///
/// let (session, first) = SaslSession::start(&["SCRAM-SHA-256"]).unwrap();
/// assert!(first.starts_with("n,,n=*,r="));
/// assert_eq!(session.state(), SaslState::InitialResponseSent);
/// ```
#[derive(Debug)]
pub struct SaslSession {
    state: SaslState,
    client_nonce: String,
    expected_server_signature: Option<[u8; 32]>,
}

impl SaslSession {
    /// Check the server's offer and draw a fresh client nonce.
    pub fn new<S: AsRef<str>>(mechanisms: &[S]) -> Result<Self, SaslError> {
        let mut raw = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut raw);
        Self::with_nonce(mechanisms, BASE64.encode(raw))
    }

    /// Same as `new` with a caller-chosen nonce.
    pub fn with_nonce<S: AsRef<str>>(
        mechanisms: &[S],
        client_nonce: impl Into<String>,
    ) -> Result<Self, SaslError> {
        if !mechanisms.iter().any(|m| m.as_ref() == SCRAM_SHA_256) {
            return Err(SaslError::MechanismNotOffered(
                mechanisms.iter().map(|m| m.as_ref().to_string()).collect(),
            ));
        }
        Ok(Self {
            state: SaslState::Created,
            client_nonce: client_nonce.into(),
            expected_server_signature: None,
        })
    }

    /// `new` followed by `client_first_message`.
    pub fn start<S: AsRef<str>>(mechanisms: &[S]) -> Result<(Self, String), SaslError> {
        let mut session = Self::new(mechanisms)?;
        let first = session.client_first_message()?;
        Ok((session, first))
    }

    pub fn state(&self) -> SaslState {
        self.state
    }

    pub fn mechanism(&self) -> &'static str {
        SCRAM_SHA_256
    }

    pub fn client_nonce(&self) -> &str {
        &self.client_nonce
    }

    /// Base64 server signature `finalize` will accept, known once the
    /// client-final-message has been produced.
    pub fn expected_server_signature(&self) -> Option<String> {
        self.expected_server_signature.map(|sig| BASE64.encode(sig))
    }

    /// Format: `n,,n=*,r=<nonce>`. The user name is taken from the startup
    /// message, so `*` is sent here.
    pub fn client_first_message(&mut self) -> Result<String, SaslError> {
        self.expect(SaslState::Created)?;
        self.state = SaslState::InitialResponseSent;
        Ok(format!("n,,{}", self.client_first_bare()))
    }

    fn client_first_bare(&self) -> String {
        format!("n=*,r={}", self.client_nonce)
    }

    /// Process the server-first-message and produce the client-final-message.
    ///
    /// Server-first-message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn continue_session(
        &mut self,
        password: &str,
        server_first: &[u8],
    ) -> Result<String, SaslError> {
        self.expect(SaslState::InitialResponseSent)?;
        let result = self.compute_final(password, server_first);
        self.settle(result, SaslState::ResponseSent)
    }

    /// Verify the server-final-message `v=<signature>`.
    pub fn finalize(&mut self, server_final: &[u8]) -> Result<(), SaslError> {
        self.expect(SaslState::ResponseSent)?;
        let result = self.verify(server_final);
        self.settle(result, SaslState::Verified)
    }

    fn compute_final(&mut self, password: &str, server_first: &[u8]) -> Result<String, SaslError> {
        if password.is_empty() {
            return Err(SaslError::EmptyPassword);
        }
        let server_first = std::str::from_utf8(server_first).map_err(|_| SaslError::NotUtf8)?;
        let first = ServerFirst::parse(server_first)?;

        if !first.nonce.starts_with(&self.client_nonce) {
            return Err(SaslError::NonceMismatch {
                client: self.client_nonce.clone(),
                server: first.nonce.to_string(),
            });
        }
        if first.nonce.len() <= self.client_nonce.len() {
            return Err(SaslError::NonceTooShort {
                client_len: self.client_nonce.len(),
                server_len: first.nonce.len(),
            });
        }

        let salted_password = salted_password(password, &first.salt, first.iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        // biws = base64("n,,")
        let client_final_without_proof = format!("c=biws,r={}", first.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut client_proof = [0u8; 32];
        for (i, byte) in client_proof.iter_mut().enumerate() {
            *byte = client_key[i] ^ client_signature[i];
        }

        let server_key = hmac(&salted_password, b"Server Key");
        self.expected_server_signature = Some(hmac(&server_key, auth_message.as_bytes()));

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        ))
    }

    fn verify(&self, server_final: &[u8]) -> Result<(), SaslError> {
        let server_final = std::str::from_utf8(server_final).map_err(|_| SaslError::NotUtf8)?;
        let attrs = parse_attribute_pairs(server_final)?;
        let signature = attr(&attrs, 'v').ok_or(SaslError::MissingServerSignature)?;
        if !is_base64(signature) {
            return Err(SaslError::InvalidServerSignature);
        }
        let received = BASE64
            .decode(signature)
            .map_err(|_| SaslError::InvalidServerSignature)?;
        let expected = self
            .expected_server_signature
            .as_ref()
            .ok_or(SaslError::UnexpectedState {
                expected: SaslState::ResponseSent,
                actual: self.state,
            })?;
        if received.len() != expected.len() || !bool::from(received.ct_eq(expected)) {
            return Err(SaslError::SignatureMismatch);
        }
        Ok(())
    }

    fn expect(&mut self, expected: SaslState) -> Result<(), SaslError> {
        if self.state != expected {
            let err = SaslError::UnexpectedState {
                expected,
                actual: self.state,
            };
            self.state = SaslState::Failed;
            return Err(err);
        }
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T, SaslError>, next: SaslState) -> Result<T, SaslError> {
        match result {
            Ok(v) => {
                self.state = next;
                Ok(v)
            }
            Err(e) => {
                tracing::warn!(error = %e, "SCRAM handshake failed");
                self.state = SaslState::Failed;
                self.expected_server_signature = None;
                Err(e)
            }
        }
    }
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    fn parse(message: &'a str) -> Result<Self, SaslError> {
        let attrs = parse_attribute_pairs(message)?;

        let nonce = attr(&attrs, 'r').ok_or(SaslError::MissingNonce)?;
        if !is_printable(nonce) {
            return Err(SaslError::NonPrintableNonce);
        }

        let salt = attr(&attrs, 's').ok_or(SaslError::MissingSalt)?;
        if !is_base64(salt) {
            return Err(SaslError::InvalidSalt(salt.to_string()));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|_| SaslError::InvalidSalt(salt.to_string()))?;

        let iterations = attr(&attrs, 'i').ok_or(SaslError::MissingIterations)?;
        let valid = iterations.starts_with(|c: char| matches!(c, '1'..='9'))
            && iterations.bytes().all(|b| b.is_ascii_digit());
        let iterations = valid
            .then(|| iterations.parse::<u32>().ok())
            .flatten()
            .ok_or_else(|| SaslError::InvalidIterations(iterations.to_string()))?;

        Ok(Self {
            nonce,
            salt,
            iterations,
        })
    }
}

/// Split `k=v,k=v` into pairs. Values keep any `=` they contain.
fn parse_attribute_pairs(message: &str) -> Result<Vec<(char, &str)>, SaslError> {
    let mut pairs = Vec::new();
    let mut offset = 0;
    for part in message.split(',') {
        let mut chars = part.chars();
        match (chars.next(), chars.next()) {
            (Some(key), Some('=')) if key.is_ascii_alphabetic() => {
                pairs.push((key, &part[2..]));
            }
            _ => {
                return Err(SaslError::InvalidAttributePair {
                    offset,
                    message: message.to_string(),
                });
            }
        }
        offset += part.len() + 1;
    }
    Ok(pairs)
}

fn attr<'a>(attrs: &[(char, &'a str)], key: char) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .filter(|v| !v.is_empty())
}

/// printable = %x21-2B / %x2D-7E (printable ASCII except ",")
fn is_printable(text: &str) -> bool {
    text.bytes()
        .all(|b| (0x21..=0x2b).contains(&b) || (0x2d..=0x7e).contains(&b))
}

/// base64 = *base64-4 [base64-3 / base64-2]
fn is_base64(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() % 4 != 0 {
        return false;
    }
    let padding = bytes.iter().rev().take_while(|&&b| b == b'=').count();
    if padding > 2 {
        return false;
    }
    bytes[..bytes.len() - padding]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

/// PBKDF2-HMAC-SHA256 with a 32 byte output.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut output);
    output
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Response to AuthenticationMD5Password:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute([password.as_bytes(), user.as_bytes()].concat()));
    let outer = format!("{:x}", md5::compute([inner.as_bytes(), &salt[..]].concat()));
    format!("md5{}", outer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    fn session() -> SaslSession {
        let mut s = SaslSession::with_nonce(&["SCRAM-SHA-256"], CLIENT_NONCE).unwrap();
        assert_eq!(s.client_first_message().unwrap(), format!("n,,n=*,r={}", CLIENT_NONCE));
        s
    }

    fn expected_signature(s: &SaslSession) -> String {
        s.expected_server_signature().unwrap()
    }

    #[test]
    fn test_start_requires_scram() {
        let err = SaslSession::start(&["SCRAM-SHA-256-PLUS"]).unwrap_err();
        assert!(matches!(err, SaslError::MechanismNotOffered(_)));
    }

    #[test]
    fn test_random_nonce_is_base64_of_18_bytes() {
        let (session, first) = SaslSession::start(&["SCRAM-SHA-256"]).unwrap();
        assert_eq!(session.client_nonce().len(), 24);
        assert!(is_base64(session.client_nonce()));
        assert_eq!(first, format!("n,,n=*,r={}", session.client_nonce()));
    }

    #[test]
    fn test_deterministic_proof() {
        let mut a = session();
        let mut b = session();
        let final_a = a.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap();
        let final_b = b.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(final_a, final_b);
        assert!(final_a.starts_with(
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="
        ));
        assert_eq!(expected_signature(&a), expected_signature(&b));
        assert_eq!(a.state(), SaslState::ResponseSent);
    }

    #[test]
    fn test_rfc7677_vector() {
        // RFC 7677 section 3 exchange, with the user name sent as `*`
        let mut s = session();
        let client_final = s.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=3M3hagGCCg+02mpnZ9fgyMWejs8yYlqFo7tFZyBIV5g="
        );
        assert_eq!(
            expected_signature(&s),
            "jBUU2ZmyQ4x+QJe05Kx6JFwPHDsiK3tfmR51qZfjEOY="
        );
        s.finalize(b"v=jBUU2ZmyQ4x+QJe05Kx6JFwPHDsiK3tfmR51qZfjEOY=")
            .unwrap();
        assert_eq!(s.state(), SaslState::Verified);
    }

    #[test]
    fn test_finalize_accepts_matching_signature() {
        let mut s = session();
        s.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap();
        let server_final = format!("v={}", expected_signature(&s));
        s.finalize(server_final.as_bytes()).unwrap();
        assert_eq!(s.state(), SaslState::Verified);
    }

    #[test]
    fn test_finalize_rejects_flipped_byte() {
        let mut s = session();
        s.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap();
        let mut sig = s.expected_server_signature.unwrap();
        sig[0] ^= 0x01;
        let server_final = format!("v={}", BASE64.encode(sig));
        assert_eq!(
            s.finalize(server_final.as_bytes()),
            Err(SaslError::SignatureMismatch)
        );
        assert_eq!(s.state(), SaslState::Failed);
    }

    #[test]
    fn test_finalize_rejects_bad_encoding() {
        let mut s = session();
        s.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(
            s.finalize(b"v=not*base64"),
            Err(SaslError::InvalidServerSignature)
        );
    }

    #[test]
    fn test_finalize_missing_signature() {
        let mut s = session();
        s.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(s.finalize(b"e=other-error"), Err(SaslError::MissingServerSignature));
    }

    #[test]
    fn test_server_first_validation() {
        let cases: Vec<(&str, fn(&SaslError) -> bool)> = vec![
            ("s=AAAA,i=1", |e| *e == SaslError::MissingNonce),
            ("r=rOprNGfwEbeRWgbNEkqO\u{7f},s=AAAA,i=1", |e| {
                *e == SaslError::NonPrintableNonce
            }),
            ("r=rOprNGfwEbeRWgbNEkqOx,i=1", |e| *e == SaslError::MissingSalt),
            ("r=rOprNGfwEbeRWgbNEkqOx,s=A*AA,i=1", |e| {
                matches!(e, SaslError::InvalidSalt(_))
            }),
            ("r=rOprNGfwEbeRWgbNEkqOx,s=AAAA", |e| *e == SaslError::MissingIterations),
            ("r=rOprNGfwEbeRWgbNEkqOx,s=AAAA,i=0100", |e| {
                matches!(e, SaslError::InvalidIterations(_))
            }),
            ("r=rOprNGfwEbeRWgbNEkqO,s=AAAA,i=1", |e| {
                matches!(e, SaslError::NonceTooShort { .. })
            }),
            ("r=XXprNGfwEbeRWgbNEkqOx,s=AAAA,i=1", |e| {
                matches!(e, SaslError::NonceMismatch { .. })
            }),
            ("r=abc,garbage", |e| {
                matches!(e, SaslError::InvalidAttributePair { offset: 6, .. })
            }),
        ];
        for (input, check) in cases {
            let mut s = session();
            let err = s.continue_session("pencil", input.as_bytes()).unwrap_err();
            assert!(check(&err), "{input}: unexpected {err:?}");
            assert_eq!(s.state(), SaslState::Failed);
        }
    }

    #[test]
    fn test_empty_password() {
        let mut s = session();
        assert_eq!(
            s.continue_session("", SERVER_FIRST.as_bytes()),
            Err(SaslError::EmptyPassword)
        );
    }

    #[test]
    fn test_no_skipping_states() {
        let mut s = SaslSession::with_nonce(&["SCRAM-SHA-256"], CLIENT_NONCE).unwrap();
        let err = s.continue_session("pencil", SERVER_FIRST.as_bytes()).unwrap_err();
        assert_eq!(
            err,
            SaslError::UnexpectedState {
                expected: SaslState::InitialResponseSent,
                actual: SaslState::Created
            }
        );
        // failure is terminal
        assert!(s.client_first_message().is_err());
    }

    #[test]
    fn test_is_base64() {
        assert!(is_base64(""));
        assert!(is_base64("QUJD"));
        assert!(is_base64("QUI="));
        assert!(is_base64("QQ=="));
        assert!(!is_base64("QQ="));
        assert!(!is_base64("Q==="));
        assert!(!is_base64("QU-D"));
    }

    #[test]
    fn test_md5_password() {
        assert_eq!(
            md5_password("postgres", "secret", &[1, 2, 3, 4]),
            "md5bb41a296aab6baccb36ff243a562abff"
        );
        assert_ne!(
            md5_password("postgres", "secret", &[4, 3, 2, 1]),
            "md5bb41a296aab6baccb36ff243a562abff"
        );
    }
}
