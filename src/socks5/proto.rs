//! The RFC 1928 subset used by XEP-0065.
//!
//! Only method 0x00 (no authentication), the CONNECT command and
//! domain-name addresses are spoken. The "domain" on a bytestream is not
//! a hostname but the hex SHA-1 of `sid ‖ initiator ‖ target`, carried
//! with port 0.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const NO_ACCEPTABLE_METHODS: u8 = 0xff;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;

pub fn encode_greeting() -> [u8; 3] {
    [VERSION, 1, METHOD_NO_AUTH]
}

pub fn encode_connect_request(domain: &str, port: u16) -> Vec<u8> {
    let mut request = Vec::with_capacity(7 + domain.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8]);
    request.extend_from_slice(domain.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

pub fn encode_reply(rep: u8, domain: &str, port: u16) -> Vec<u8> {
    let mut reply = Vec::with_capacity(7 + domain.len());
    reply.extend_from_slice(&[VERSION, rep, 0x00, ATYP_DOMAIN, domain.len() as u8]);
    reply.extend_from_slice(domain.as_bytes());
    reply.extend_from_slice(&port.to_be_bytes());
    reply
}

/// Client half: negotiate no-auth and CONNECT to `domain:port`.
pub async fn connect<S>(stream: &mut S, domain: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_greeting()).await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != VERSION {
        return Err(Error::Socks5(format!("bad version {:#04x}", selection[0])));
    }
    if selection[1] != METHOD_NO_AUTH {
        return Err(Error::Socks5(format!(
            "server selected unsupported method {:#04x}",
            selection[1]
        )));
    }

    stream
        .write_all(&encode_connect_request(domain, port))
        .await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::Socks5(format!("bad version {:#04x}", head[0])));
    }
    if head[1] != REP_SUCCEEDED {
        return Err(Error::Socks5(format!("request refused, rep {:#04x}", head[1])));
    }
    // Drain BND.ADDR and BND.PORT, whatever address type came back.
    match head[3] {
        0x01 => {
            let mut addr = [0u8; 4 + 2];
            stream.read_exact(&mut addr).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut addr = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut addr).await?;
        }
        0x04 => {
            let mut addr = [0u8; 16 + 2];
            stream.read_exact(&mut addr).await?;
        }
        other => {
            return Err(Error::Socks5(format!("bad address type {other:#04x}")));
        }
    }

    Ok(())
}

/// Server half: accept no-auth, then a CONNECT whose domain must equal
/// `expected_domain` (the sid hash). Replies success with the echoed
/// domain and port on match, refuses otherwise.
pub async fn accept<S>(stream: &mut S, expected_domain: &str) -> Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::Socks5(format!("bad version {:#04x}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Err(Error::Socks5("client offers no acceptable method".into()));
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION || request[1] != CMD_CONNECT {
        return Err(Error::Socks5(format!(
            "expected CONNECT, got command {:#04x}",
            request[1]
        )));
    }
    if request[3] != ATYP_DOMAIN {
        return Err(Error::Socks5(format!(
            "expected domain address, got type {:#04x}",
            request[3]
        )));
    }

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut domain = vec![0u8; len[0] as usize];
    stream.read_exact(&mut domain).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    let domain = String::from_utf8(domain)
        .map_err(|_| Error::Socks5("destination domain is not UTF-8".into()))?;
    let port = u16::from_be_bytes(port);

    if domain != expected_domain {
        stream
            .write_all(&encode_reply(REP_CONNECTION_REFUSED, &domain, port))
            .await?;
        return Err(Error::Socks5("destination hash mismatch".into()));
    }

    stream
        .write_all(&encode_reply(REP_SUCCEEDED, &domain, port))
        .await?;
    Ok((domain, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "2f5ca1bfa4a2e3a8dd171e5e9a723a9a87a29f4c";

    #[test]
    fn test_greeting_bytes() {
        assert_eq!(encode_greeting(), [0x05, 0x01, 0x00]);
    }

    #[test]
    fn test_connect_request_layout() {
        let request = encode_connect_request("abc", 0);
        assert_eq!(
            request,
            [0x05, 0x01, 0x00, 0x03, 0x03, b'a', b'b', b'c', 0x00, 0x00]
        );
    }

    #[test]
    fn test_reply_layout() {
        let reply = encode_reply(REP_SUCCEEDED, "ab", 7777);
        assert_eq!(
            reply,
            [0x05, 0x00, 0x00, 0x03, 0x02, b'a', b'b', 0x1e, 0x61]
        );
    }

    #[tokio::test]
    async fn test_client_and_server_negotiate() {
        let (mut client_end, mut server_end) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let (domain, port) = accept(&mut server_end, HASH).await.unwrap();
            assert_eq!(domain, HASH);
            assert_eq!(port, 0);
            server_end
        });

        connect(&mut client_end, HASH, 0).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_refused() {
        let (mut client_end, mut server_end) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            accept(&mut server_end, HASH).await
        });

        let client_err = connect(&mut client_end, "0000000000000000000000000000000000000000", 0)
            .await
            .unwrap_err();
        assert!(matches!(client_err, Error::Socks5(_)));

        let server_err = server.await.unwrap().unwrap_err();
        assert!(matches!(server_err, Error::Socks5(_)));
    }

    #[tokio::test]
    async fn test_client_without_no_auth_method_rejected() {
        let (mut client_end, mut server_end) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move { accept(&mut server_end, HASH).await });

        // Greeting offering only username/password auth (0x02).
        client_end.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut answer = [0u8; 2];
        client_end.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer, [0x05, NO_ACCEPTABLE_METHODS]);

        assert!(server.await.unwrap().is_err());
    }
}
