//! SCRAM challenge/response machinery (SCRAM-SHA-1 and SCRAM-SHA-256).
//!
//! This is the pure algorithm only; driving the conversation over a
//! connection is the driver's job. The exchange is modeled as a typestate
//! machine - each step consumes the previous state and returns the next, so
//! an out-of-order transition does not compile:
//!
//! `ScramStart -> client_first() -> ScramFirstSent -> handle_server_first()
//! -> ScramFinalSent -> handle_server_final() -> ScramVerified`
//!
//! Any verification failure is a hard error; there is no partial trust in a
//! tampered exchange.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Servers advertising fewer rounds than this are refused; a low iteration
/// count defeats the purpose of the salted exchange.
pub const MIN_ITERATION_COUNT: u32 = 4096;

const NONCE_LEN: usize = 24;
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "biws"; // base64("n,,")

/// Hash variant of the SCRAM family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScramVariant {
    Sha1,
    Sha256,
}

impl ScramVariant {
    /// SASL mechanism name as it appears on the wire.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            ScramVariant::Sha1 => "SCRAM-SHA-1",
            ScramVariant::Sha256 => "SCRAM-SHA-256",
        }
    }

    pub fn from_mechanism_name(name: &str) -> Option<ScramVariant> {
        match name {
            "SCRAM-SHA-1" => Some(ScramVariant::Sha1),
            "SCRAM-SHA-256" => Some(ScramVariant::Sha256),
            _ => None,
        }
    }
}

/// Cached result of the expensive salted-password derivation, reusable
/// across reconnects under the same credentials. One slot suffices - a
/// cluster authenticates with a single credential set.
#[derive(Debug, Default)]
pub struct ScramCache {
    entry: Option<CacheEntry>,
}

#[derive(Debug)]
struct CacheEntry {
    variant: ScramVariant,
    username: String,
    prepared_password: String,
    salt: Vec<u8>,
    iterations: u32,
    salted_password: Vec<u8>,
}

impl ScramCache {
    fn lookup(
        &self,
        variant: ScramVariant,
        username: &str,
        prepared_password: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Option<Vec<u8>> {
        self.entry
            .as_ref()
            .filter(|entry| {
                entry.variant == variant
                    && entry.username == username
                    && entry.prepared_password == prepared_password
                    && entry.salt == salt
                    && entry.iterations == iterations
            })
            .map(|entry| entry.salted_password.clone())
    }

    fn store(
        &mut self,
        variant: ScramVariant,
        username: &str,
        prepared_password: &str,
        salt: &[u8],
        iterations: u32,
        salted_password: Vec<u8>,
    ) {
        self.entry = Some(CacheEntry {
            variant,
            username: username.to_string(),
            prepared_password: prepared_password.to_string(),
            salt: salt.to_vec(),
            iterations,
            salted_password,
        });
    }
}

/// Initial state: credentials prepared, nothing sent yet.
#[derive(Debug)]
pub struct ScramStart {
    variant: ScramVariant,
    username: String,
    prepared_password: String,
    nonce: String,
}

/// Client-first has been sent; waiting for the server challenge.
#[derive(Debug)]
pub struct ScramFirstSent {
    variant: ScramVariant,
    username: String,
    prepared_password: String,
    nonce: String,
    client_first_bare: String,
}

/// Client-final (with proof) has been produced; waiting for the server's
/// own proof.
#[derive(Debug)]
pub struct ScramFinalSent {
    expected_server_signature: Vec<u8>,
}

/// Terminal success state: the server proved knowledge of the stored key.
#[derive(Debug)]
pub struct ScramVerified;

impl ScramStart {
    /// Prepares credentials for the given variant with a fresh random nonce.
    pub fn new(variant: ScramVariant, username: &str, password: &str) -> Result<ScramStart> {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();

        Self::with_nonce(variant, username, password, nonce)
    }

    /// Like [`ScramStart::new`] with a caller-supplied nonce, so exchanges
    /// can be made deterministic.
    pub fn with_nonce(
        variant: ScramVariant,
        username: &str,
        password: &str,
        nonce: String,
    ) -> Result<ScramStart> {
        Ok(ScramStart {
            variant,
            username: username.to_string(),
            prepared_password: prepare_password(variant, username, password)?,
            nonce,
        })
    }

    #[inline]
    pub fn mechanism(&self) -> &'static str {
        self.variant.mechanism_name()
    }

    /// Produces the client-first message payload.
    pub fn client_first(self) -> (Vec<u8>, ScramFirstSent) {
        let client_first_bare = format!("n={},r={}", escape_username(&self.username), self.nonce);
        let payload = format!("{}{}", GS2_HEADER, client_first_bare).into_bytes();

        (
            payload,
            ScramFirstSent {
                variant: self.variant,
                username: self.username,
                prepared_password: self.prepared_password,
                nonce: self.nonce,
                client_first_bare,
            },
        )
    }
}

impl ScramFirstSent {
    /// Consumes the server challenge and produces the client-final payload
    /// carrying the proof. The salted-password derivation consults `cache`
    /// and refreshes it on a miss.
    pub fn handle_server_first(
        self,
        payload: &[u8],
        cache: &mut ScramCache,
    ) -> Result<(Vec<u8>, ScramFinalSent)> {
        let server_first = std::str::from_utf8(payload)
            .map_err(|_| auth_error("server challenge is not valid UTF-8"))?;

        let fields = parse_fields(server_first)?;

        if fields.iter().any(|(key, _)| *key == "m") {
            return Err(auth_error("server requires unsupported SCRAM extensions"));
        }

        let combined_nonce = field(&fields, "r")?;
        if !combined_nonce.starts_with(&self.nonce) || combined_nonce.len() <= self.nonce.len() {
            return Err(auth_error("server nonce does not extend the client nonce"));
        }

        let salt = BASE64
            .decode(field(&fields, "s")?)
            .map_err(|_| auth_error("server salt is not valid base64"))?;

        let iterations: u32 = field(&fields, "i")?
            .parse()
            .map_err(|_| auth_error("server iteration count is not a number"))?;
        if iterations < MIN_ITERATION_COUNT {
            return Err(auth_error("server iteration count is too low"));
        }

        let salted_password = match cache.lookup(
            self.variant,
            &self.username,
            &self.prepared_password,
            &salt,
            iterations,
        ) {
            Some(salted_password) => salted_password,
            None => {
                let salted_password = hi(
                    self.variant,
                    self.prepared_password.as_bytes(),
                    &salt,
                    iterations,
                );
                cache.store(
                    self.variant,
                    &self.username,
                    &self.prepared_password,
                    &salt,
                    iterations,
                    salted_password.clone(),
                );
                salted_password
            }
        };

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_key = hmac_digest(self.variant, &salted_password, b"Client Key");
        let stored_key = hash_digest(self.variant, &client_key);
        let client_signature = hmac_digest(self.variant, &stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        let server_key = hmac_digest(self.variant, &salted_password, b"Server Key");
        let expected_server_signature =
            hmac_digest(self.variant, &server_key, auth_message.as_bytes());

        let payload = format!("{},p={}", without_proof, BASE64.encode(client_proof)).into_bytes();

        Ok((
            payload,
            ScramFinalSent {
                expected_server_signature,
            },
        ))
    }
}

impl ScramFinalSent {
    /// Verifies the server's final proof. Any mismatch rejects the exchange.
    pub fn handle_server_final(self, payload: &[u8]) -> Result<ScramVerified> {
        let server_final = std::str::from_utf8(payload)
            .map_err(|_| auth_error("server final message is not valid UTF-8"))?;

        let fields = parse_fields(server_final)?;

        if let Ok(reason) = field(&fields, "e") {
            return Err(auth_error(&format!("server rejected exchange: {}", reason)));
        }

        let signature = BASE64
            .decode(field(&fields, "v")?)
            .map_err(|_| auth_error("server signature is not valid base64"))?;

        if signature != self.expected_server_signature {
            return Err(auth_error("server signature mismatch"));
        }

        Ok(ScramVerified)
    }
}

/// Applies the variant-specific password preparation: SHA-1 exchanges use
/// the hex MD5 of `user:mongo:password`, SHA-256 exchanges the password
/// itself. Non-ASCII SHA-256 passwords would need SASLprep normalization,
/// which is not implemented; they are refused rather than silently
/// mis-hashed.
fn prepare_password(variant: ScramVariant, username: &str, password: &str) -> Result<String> {
    match variant {
        ScramVariant::Sha1 => {
            let digest = Md5::digest(format!("{}:mongo:{}", username, password).as_bytes());
            Ok(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
        }
        ScramVariant::Sha256 => {
            if !password.is_ascii() {
                return Err(auth_error(
                    "non-ASCII passwords are not supported for SCRAM-SHA-256",
                ));
            }
            Ok(password.to_string())
        }
    }
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn parse_fields(message: &str) -> Result<Vec<(&str, &str)>> {
    message
        .split(',')
        .map(|part| {
            part.split_once('=')
                .ok_or_else(|| auth_error("malformed SCRAM attribute"))
        })
        .collect()
}

fn field<'a>(fields: &[(&'a str, &'a str)], key: &str) -> Result<&'a str> {
    fields
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| *value)
        .ok_or_else(|| auth_error(&format!("server message is missing '{}'", key)))
}

fn auth_error(reason: &str) -> Error {
    Error::Authentication {
        reason: reason.to_string(),
    }
}

fn hmac_digest(variant: ScramVariant, key: &[u8], data: &[u8]) -> Vec<u8> {
    match variant {
        ScramVariant::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts keys of any length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        ScramVariant::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn hash_digest(variant: ScramVariant, data: &[u8]) -> Vec<u8> {
    match variant {
        ScramVariant::Sha1 => Sha1::digest(data).to_vec(),
        ScramVariant::Sha256 => Sha256::digest(data).to_vec(),
    }
}

/// The `Hi` function of RFC 5802: iterated HMAC over `salt || INT(1)`,
/// folded together with XOR. Equivalent to PBKDF2 with a single block.
fn hi(variant: ScramVariant, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut intermediate = hmac_digest(variant, password, &block);
    let mut output = intermediate.clone();

    for _ in 1..iterations {
        intermediate = hmac_digest(variant, password, &intermediate);
        for (accumulated, byte) in output.iter_mut().zip(&intermediate) {
            *accumulated ^= byte;
        }
    }

    output
}

fn xor(left: &[u8], right: &[u8]) -> Vec<u8> {
    left.iter().zip(right).map(|(a, b)| a ^ b).collect()
}
