use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::secret::ConnectionSecret;

pub const CLIENT_HELLO_SIZE: usize = ConnectionSecret::SIZE;
pub const SERVER_HELLO_SIZE: usize = 3;

/// Result code carried in the first byte of a ServerHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelloCode {
    Ok = 0,
    InvalidSecret = 1,
}

impl HelloCode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(HelloCode::Ok),
            1 => Some(HelloCode::InvalidSecret),
            _ => None,
        }
    }
}

/// First frame on the wire, agent to relay: the connection secret verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello {
    pub connection_secret: ConnectionSecret,
}

impl ClientHello {
    pub fn serialize(&self) -> [u8; CLIENT_HELLO_SIZE] {
        *self.connection_secret.as_bytes()
    }

    pub fn deserialize(data: [u8; CLIENT_HELLO_SIZE]) -> Self {
        Self {
            connection_secret: ConnectionSecret::from_bytes(data),
        }
    }
}

/// Reply frame, relay to agent. The port is big-endian on the wire.
/// On `InvalidSecret` the port is zero and carries no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHello {
    pub code: HelloCode,
    pub server_port: u16,
}

impl ServerHello {
    pub fn serialize(&self) -> [u8; SERVER_HELLO_SIZE] {
        let port = self.server_port.to_be_bytes();
        [self.code as u8, port[0], port[1]]
    }

    pub fn deserialize(data: [u8; SERVER_HELLO_SIZE]) -> anyhow::Result<Self> {
        let code = HelloCode::from_u8(data[0])
            .ok_or_else(|| anyhow::anyhow!("deserialize: unknown server hello code: {}", data[0]))?;
        Ok(Self {
            code,
            server_port: u16::from_be_bytes([data[1], data[2]]),
        })
    }
}

/// Read exactly one ClientHello; a short read is a protocol error.
pub async fn read_client_hello<R>(reader: &mut R) -> anyhow::Result<ClientHello>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CLIENT_HELLO_SIZE];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| anyhow::anyhow!("readClientHello: short read: {}", e))?;
    Ok(ClientHello::deserialize(buf))
}

pub async fn write_client_hello<W>(writer: &mut W, hello: &ClientHello) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&hello.serialize())
        .await
        .map_err(|e| anyhow::anyhow!("writeClientHello: write failed: {}", e))?;
    Ok(())
}

/// Read exactly one ServerHello; a short read is a protocol error.
pub async fn read_server_hello<R>(reader: &mut R) -> anyhow::Result<ServerHello>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; SERVER_HELLO_SIZE];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| anyhow::anyhow!("readServerHello: short read: {}", e))?;
    ServerHello::deserialize(buf)
}

pub async fn write_server_hello<W>(writer: &mut W, hello: &ServerHello) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&hello.serialize())
        .await
        .map_err(|e| anyhow::anyhow!("writeServerHello: write failed: {}", e))?;
    Ok(())
}
