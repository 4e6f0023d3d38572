// Client for the agitator server
use tokio::net::TcpStream;
use tracing::debug;

use crate::agitator::AgitationRequest;
use crate::messages::{self, AgitatorStatus, ProtocolError, Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Cannot reach agitator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Agitator reported an error: {0}")]
    Remote(String),
}

/// Connects anew for every call, like the server expects
#[derive(Debug, Clone)]
pub struct AgitatorClient {
    addr: String,
}

impl AgitatorClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: &Request) -> Result<AgitatorStatus, ClientError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        debug!("Sending {:?} to {}", request, self.addr);
        messages::send(&mut stream, request).await?;

        match messages::recv(&mut stream).await? {
            Response::Result(status) => Ok(status),
            Response::Error(message) => Err(ClientError::Remote(message)),
        }
    }

    pub async fn start(&self, request: AgitationRequest) -> Result<AgitatorStatus, ClientError> {
        self.call(&Request::StartAgitation(request)).await
    }

    pub async fn stop(&self) -> Result<AgitatorStatus, ClientError> {
        self.call(&Request::StopAgitation).await
    }

    pub async fn status(&self) -> Result<AgitatorStatus, ClientError> {
        self.call(&Request::Status).await
    }
}
