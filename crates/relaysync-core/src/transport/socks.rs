//! Minimal SOCKS5 CONNECT (no authentication, domain-name addressing)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Ask the proxy on `stream` to open a tunnel to `host:port`
pub async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if host.len() > 255 {
        return Err(TransportError::Proxy("host name too long".into()));
    }

    stream.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [VERSION, NO_AUTH] {
        return Err(TransportError::Proxy(format!(
            "proxy refused no-auth method: {:?}",
            choice
        )));
    }

    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8]);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(TransportError::Proxy("bad reply version".into()));
    }
    if head[1] != 0x00 {
        return Err(TransportError::Proxy(format!("connect failed, code {}", head[1])));
    }

    // Drain the bound address; the tunnel starts right after it.
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(TransportError::Proxy(format!("bad address type {}", other))),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
