//! SASL PLAIN (RFC 4616): a single `\0user\0password` initial response.
//! Only acceptable over TLS; the preference order keeps it last.

use crate::error::{Error, Result};

use super::Mechanism;

pub struct Plain {
    username: String,
    password: String,
    completed: bool,
}

impl Plain {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            completed: false,
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn initial(&mut self) -> Result<Vec<u8>> {
        self.completed = true;
        Ok(format!("\0{}\0{}", self.username, self.password).into_bytes())
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::ProtocolViolation(
            "PLAIN does not take challenges".into(),
        ))
    }

    fn success(&mut self, _data: &[u8]) -> Result<()> {
        if self.completed {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(
                "success before PLAIN initial response".into(),
            ))
        }
    }

    fn is_completed(&self) -> bool {
        self.completed
    }
}
