// Wire messages between the agitator server and its clients
//
// Each message is framed as 4 ASCII characters holding the right-aligned
// decimal payload length, followed by the JSON payload.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::agitator::{AgitationRequest, ControllerState};

/// Width of the length prefix
pub const LENGTH_PREFIX: usize = 4;

/// Largest payload the prefix can describe
pub const MAX_PAYLOAD: usize = 9999;

// Request from a client -> server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum Request {
    StartAgitation(AgitationRequest),
    StopAgitation,
    Status,
}

// Reply from server -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Result(AgitatorStatus),
    Error(String),
}

/// Controller snapshot; hardware reads that failed are `None`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgitatorStatus {
    pub state: ControllerState,
    pub voltage1: f64,
    pub voltage2: f64,
    pub frequency: f64,
    pub battery_voltage: Option<f64>,
    pub current1: Option<f64>,
    pub current2: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid length prefix: {0:?}")]
    Framing(String),

    #[error("Payload of {0} bytes does not fit the length prefix")]
    TooLarge(usize),
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::TooLarge(payload.len()));
    }
    let prefix = format!("{:>width$}", payload.len(), width = LENGTH_PREFIX);
    writer.write_all(prefix.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix).await?;

    let text = String::from_utf8_lossy(&prefix);
    let length: usize = text
        .trim()
        .parse()
        .map_err(|_| ProtocolError::Framing(text.to_string()))?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Serialize and send one framed message
pub async fn send<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

/// Receive and parse one framed message
pub async fn recv<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(serde_json::from_slice(&payload)?)
}
