//! SASL SCRAM-SHA-1 (RFC 5802).
//!
//! Exchange: client-first (`n,,n=user,r=nonce`) → server-first
//! (`r=...,s=...,i=...`) → client-final (`c=biws,r=...,p=proof`) →
//! server-final (`v=signature`), the last either as an extra challenge or
//! inside the `<success/>` payload. The server signature MUST verify;
//! otherwise authentication fails with no stream restart.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

use super::Mechanism;

type HmacSha1 = Hmac<Sha1>;

/// GS2 header for "no channel binding"; base64("n,,") is "biws".
const GS2_HEADER: &str = "n,,";

enum State {
    Initial,
    AwaitingServerFirst,
    AwaitingServerFinal { server_signature: Vec<u8> },
    Completed,
}

pub struct ScramSha1 {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    state: State,
}

impl ScramSha1 {
    pub fn new(username: &str, password: &str) -> Self {
        Self::with_nonce(username, password, &generate_nonce())
    }

    /// Nonce injection point so the RFC 5802 vector is testable.
    fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n={},r={}", escape_username(username), nonce),
            state: State::Initial,
        }
    }

    fn handle_server_first(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(challenge)
            .map_err(|_| Error::AuthenticationFailed("server-first is not UTF-8".into()))?
            .to_string();
        let (combined_nonce, salt_b64, iterations) = parse_server_first(&server_first)?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(Error::AuthenticationFailed(
                "server nonce does not extend client nonce".into(),
            ));
        }

        let salt = B64
            .decode(salt_b64)
            .map_err(|_| Error::AuthenticationFailed("bad salt encoding".into()))?;

        // SaltedPassword = PBKDF2-HMAC-SHA1(password, salt, i)
        let mut salted_password = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);

        let channel_binding = B64.encode(GS2_HEADER.as_bytes());
        let client_final_without_proof = format!("c={channel_binding},r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, sig)| key ^ sig)
            .collect();

        let server_key = hmac_sha1(&salted_password, b"Server Key");
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes());
        self.state = State::AwaitingServerFinal { server_signature };

        Ok(format!(
            "{client_final_without_proof},p={}",
            B64.encode(&client_proof)
        )
        .into_bytes())
    }

    fn verify_server_final(&mut self, data: &[u8]) -> Result<()> {
        let State::AwaitingServerFinal {
            ref server_signature,
        } = self.state
        else {
            return Err(Error::ProtocolViolation(
                "server-final before client-final".into(),
            ));
        };

        let text = std::str::from_utf8(data)
            .map_err(|_| Error::AuthenticationFailed("server-final is not UTF-8".into()))?;
        let value = text
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| Error::AuthenticationFailed("server-final lacks v=".into()))?;
        let signature = B64
            .decode(value)
            .map_err(|_| Error::AuthenticationFailed("bad server signature encoding".into()))?;

        if signature != *server_signature {
            return Err(Error::AuthenticationFailed(
                "server signature mismatch".into(),
            ));
        }

        self.state = State::Completed;
        Ok(())
    }
}

impl Mechanism for ScramSha1 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn initial(&mut self) -> Result<Vec<u8>> {
        self.state = State::AwaitingServerFirst;
        Ok(format!("{GS2_HEADER}{}", self.client_first_bare).into_bytes())
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match self.state {
            State::AwaitingServerFirst => self.handle_server_first(challenge),
            State::AwaitingServerFinal { .. } => {
                // Server chose to send its final data as one more challenge.
                self.verify_server_final(challenge)?;
                Ok(Vec::new())
            }
            _ => Err(Error::ProtocolViolation("unexpected SCRAM challenge".into())),
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            State::Completed => Ok(()),
            State::AwaitingServerFinal { .. } => self.verify_server_final(data),
            _ => Err(Error::ProtocolViolation(
                "success before SCRAM exchange finished".into(),
            )),
        }
    }

    fn is_completed(&self) -> bool {
        matches!(self.state, State::Completed)
    }
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
    B64.encode(&bytes)
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// `=` and `,` cannot appear raw in a saslname.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// Parses `r=nonce,s=salt,i=iterations`.
fn parse_server_first(message: &str) -> Result<(String, String, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in message.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(value.parse::<u32>().map_err(|_| {
                Error::AuthenticationFailed("bad iteration count".into())
            })?);
        }
    }

    Ok((
        nonce.ok_or_else(|| Error::AuthenticationFailed("missing nonce".into()))?,
        salt.ok_or_else(|| Error::AuthenticationFailed("missing salt".into()))?,
        iterations.ok_or_else(|| Error::AuthenticationFailed("missing iterations".into()))?,
    ))
}
