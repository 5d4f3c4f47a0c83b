//! SASL DIGEST-MD5 (RFC 2831).
//!
//! Obsolete but still advertised by older servers; kept between SCRAM and
//! PLAIN in the preference order. The first challenge carries realm,
//! nonce and qop; our response proves the password through the MD5 digest
//! with `digest-uri = "xmpp/" + realm`; the server then proves itself back
//! with `rspauth`, to which we answer with an empty final response.

use std::collections::HashMap;

use md5::{Digest, Md5};
use rand::Rng;

use crate::error::{Error, Result};

use super::Mechanism;

const NC: &str = "00000001";
const QOP: &str = "auth";

enum State {
    Initial,
    Responded { expected_rspauth: String },
    Completed,
}

pub struct DigestMd5 {
    username: String,
    password: String,
    cnonce: String,
    state: State,
}

impl DigestMd5 {
    pub fn new(username: &str, password: &str) -> Self {
        Self::with_cnonce(username, password, &generate_cnonce())
    }

    /// cnonce injection point for the RFC 2831 vector test.
    fn with_cnonce(username: &str, password: &str, cnonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            cnonce: cnonce.to_string(),
            state: State::Initial,
        }
    }

    fn handle_first_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(challenge)
            .map_err(|_| Error::AuthenticationFailed("challenge is not UTF-8".into()))?;
        let directives = parse_directives(text);

        if let Some(algorithm) = directives.get("algorithm") {
            if algorithm != "md5-sess" {
                return Err(Error::AuthenticationFailed(format!(
                    "unsupported algorithm '{algorithm}'"
                )));
            }
        }
        let qop_offered = directives.get("qop").map(String::as_str).unwrap_or(QOP);
        if !qop_offered.split(',').any(|q| q.trim() == QOP) {
            return Err(Error::AuthenticationFailed(
                "server does not offer qop=auth".into(),
            ));
        }

        let nonce = directives
            .get("nonce")
            .ok_or_else(|| Error::AuthenticationFailed("challenge lacks nonce".into()))?;
        let realm = directives.get("realm").cloned().unwrap_or_default();
        let digest_uri = format!("xmpp/{realm}");

        let response = compute_response(
            &self.username,
            &realm,
            &self.password,
            nonce,
            &self.cnonce,
            &digest_uri,
            "AUTHENTICATE",
        );
        let expected_rspauth = compute_response(
            &self.username,
            &realm,
            &self.password,
            nonce,
            &self.cnonce,
            &digest_uri,
            "",
        );
        self.state = State::Responded { expected_rspauth };

        Ok(format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",\
             nc={NC},qop={QOP},digest-uri=\"{}\",response={},charset=utf-8",
            self.username, realm, nonce, self.cnonce, digest_uri, response
        )
        .into_bytes())
    }

    fn verify_rspauth(&mut self, data: &[u8]) -> Result<()> {
        let State::Responded {
            ref expected_rspauth,
        } = self.state
        else {
            return Err(Error::ProtocolViolation(
                "rspauth before digest response".into(),
            ));
        };

        let text = std::str::from_utf8(data)
            .map_err(|_| Error::AuthenticationFailed("rspauth is not UTF-8".into()))?;
        let directives = parse_directives(text);
        let rspauth = directives
            .get("rspauth")
            .ok_or_else(|| Error::AuthenticationFailed("server sent no rspauth".into()))?;

        if rspauth != expected_rspauth {
            return Err(Error::AuthenticationFailed("rspauth mismatch".into()));
        }

        self.state = State::Completed;
        Ok(())
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn has_initial_response(&self) -> bool {
        false
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match self.state {
            State::Initial => self.handle_first_challenge(challenge),
            State::Responded { .. } => {
                self.verify_rspauth(challenge)?;
                Ok(Vec::new())
            }
            State::Completed => Err(Error::ProtocolViolation(
                "challenge after DIGEST-MD5 completion".into(),
            )),
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            State::Completed => Ok(()),
            // Some servers skip the second challenge and put rspauth in
            // the success payload instead.
            State::Responded { .. } if !data.is_empty() => self.verify_rspauth(data),
            State::Responded { .. } => Err(Error::ProtocolViolation(
                "success without rspauth".into(),
            )),
            State::Initial => Err(Error::ProtocolViolation(
                "success before digest exchange".into(),
            )),
        }
    }

    fn is_completed(&self) -> bool {
        matches!(self.state, State::Completed)
    }
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// The RFC 2831 response computation. `a2_prefix` is "AUTHENTICATE" for
/// the client response and empty for the server's rspauth.
fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    digest_uri: &str,
    a2_prefix: &str,
) -> String {
    // A1 = H(user:realm:pass) : nonce : cnonce, the first part as raw MD5.
    let mut a1 = Md5::digest(format!("{username}:{realm}:{password}").as_bytes()).to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    let ha1 = md5_hex(&a1);

    let ha2 = md5_hex(format!("{a2_prefix}:{digest_uri}").as_bytes());

    md5_hex(format!("{ha1}:{nonce}:{NC}:{cnonce}:{QOP}:{ha2}").as_bytes())
}

/// Splits a digest challenge into key/value directives, unquoting values.
/// Commas inside quoted values do not split.
fn parse_directives(text: &str) -> HashMap<String, String> {
    let mut directives = HashMap::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_string();

        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((value, rest)) => (
                    value.to_string(),
                    rest.strip_prefix(',').unwrap_or(rest),
                ),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after_key.split_once(',') {
                Some((value, rest)) => (value.trim().to_string(), rest),
                None => (after_key.trim().to_string(), ""),
            }
        };

        directives.insert(key, value);
        rest = remainder.trim_start();
    }

    directives
}
