/// Request/response channel
///
/// One requester, one replier, one JSON round-trip per call over a dedicated
/// stream. Normally the requester dials and the replier listens; with
/// `requester_dials = false` the roles swap and the replier dials in with
/// backoff until the requester's listener appears.
use crate::communication::network::{
    check_ipc_path, dial, parse_endpoint, Connection, Endpoint, ReconnectStrategy,
    StreamListener, IPC_SCHEME,
};
use crate::error::{CuemsError, CuemsResult};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest a requester waits for its reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RequestResponseChannel {
    address: String,
    endpoint: Endpoint,
    requester_dials: bool,
    request_timeout: Duration,
    reconnect: ReconnectStrategy,
}

impl RequestResponseChannel {
    /// Validate `address`; nothing is opened until a request or reply call
    pub fn new(address: &str, requester_dials: bool) -> CuemsResult<Self> {
        let endpoint = parse_endpoint(address)?;
        if let Endpoint::Ipc { path } = &endpoint {
            check_ipc_path(path)?;
        }

        Ok(Self {
            address: address.to_string(),
            endpoint,
            requester_dials,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectStrategy::default(),
        })
    }

    /// Channel over a filesystem socket; `ipc://` is prefixed when missing
    pub fn ipc(path: impl AsRef<Path>, requester_dials: bool) -> CuemsResult<Self> {
        let path = path.as_ref().to_string_lossy();
        let address = if path.starts_with(IPC_SCHEME) {
            path.into_owned()
        } else {
            format!("{}{}", IPC_SCHEME, path)
        };
        Self::new(&address, requester_dials)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Backoff used by a dialing replier
    pub fn with_reconnect(mut self, strategy: ReconnectStrategy) -> Self {
        self.reconnect = strategy;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn requester_dials(&self) -> bool {
        self.requester_dials
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send one request and wait for its reply
    ///
    /// Any failure after encoding (connect, write, no reply within the
    /// timeout, undecodable reply) is logged and reported as
    /// [`CuemsError::NoResponse`].
    pub async fn send_request<T: Serialize + ?Sized>(&self, request: &T) -> CuemsResult<Value> {
        let encoded = serde_json::to_vec(request)?;

        match tokio::time::timeout(self.request_timeout, self.exchange(&encoded)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                error!("Request to {} failed: {}", self.address, e);
                Err(CuemsError::NoResponse(e.to_string()))
            }
            Err(_) => {
                error!("No reply from {} within {:?}", self.address, self.request_timeout);
                Err(CuemsError::NoResponse(format!(
                    "no reply from {} within {:?}",
                    self.address, self.request_timeout
                )))
            }
        }
    }

    async fn exchange(&self, request: &[u8]) -> CuemsResult<Value> {
        let mut connection = if self.requester_dials {
            dial(&self.endpoint).await?
        } else {
            let listener = StreamListener::bind(&self.endpoint).await?;
            debug!("Requester waiting for replier on {}", self.endpoint);
            listener.accept().await?
        };

        connection.send_frame(request).await?;
        let reply = connection.recv_frame().await?.ok_or_else(|| {
            CuemsError::communication(format!(
                "{} closed the connection before replying",
                self.address
            ))
        })?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Open the replier side and hand out requests one at a time
    pub async fn connect_replier(&self) -> CuemsResult<Replier> {
        let listener = if self.requester_dials {
            let listener = StreamListener::bind(&self.endpoint).await?;
            info!("Replier listening on {}", self.endpoint);
            Some(listener)
        } else {
            None
        };

        Ok(Replier {
            endpoint: self.endpoint.clone(),
            reconnect: self.reconnect.clone(),
            listener,
            connection: None,
            awaiting_reply: false,
        })
    }

    /// Serve requests forever with an async handler
    pub async fn reply<F, Fut>(&self, mut handler: F) -> CuemsResult<()>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = Value>,
    {
        let mut replier = self.connect_replier().await?;
        loop {
            let pending = replier.next_request().await?;
            let response = handler(pending.request().clone()).await;
            if let Err(e) = pending.respond(&response).await {
                warn!("Failed to send reply on {}: {}", self.address, e);
            }
        }
    }

    /// Serve requests forever with a synchronous handler
    ///
    /// The handler runs on the blocking pool. A handler that panics leaves the
    /// request unanswered; the requester sees no response.
    pub async fn reply_blocking<F>(&self, handler: F) -> CuemsResult<()>
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut replier = self.connect_replier().await?;
        loop {
            let pending = replier.next_request().await?;
            let request = pending.request().clone();
            let handler = Arc::clone(&handler);

            match tokio::task::spawn_blocking(move || handler(request)).await {
                Ok(response) => {
                    if let Err(e) = pending.respond(&response).await {
                        warn!("Failed to send reply on {}: {}", self.address, e);
                    }
                }
                Err(e) => error!("Request handler on {} failed: {}", self.address, e),
            }
        }
    }
}

/// Replier side of a [`RequestResponseChannel`]
#[derive(Debug)]
pub struct Replier {
    endpoint: Endpoint,
    reconnect: ReconnectStrategy,
    listener: Option<StreamListener>,
    connection: Option<Connection>,
    awaiting_reply: bool,
}

impl Replier {
    async fn connect(&self) -> CuemsResult<Connection> {
        match &self.listener {
            Some(listener) => Ok(listener.accept().await?),
            None => {
                let endpoint = &self.endpoint;
                self.reconnect
                    .retry("replier dial", move || dial(endpoint))
                    .await
            }
        }
    }

    /// Wait for the next request. Requester disconnects are absorbed here.
    ///
    /// A request left unanswered by a dropped [`PendingRequest`] costs its
    /// requester the connection.
    pub async fn next_request(&mut self) -> CuemsResult<PendingRequest<'_>> {
        if self.awaiting_reply {
            warn!("Previous request on {} was never answered, dropping it", self.endpoint);
            self.connection = None;
            self.awaiting_reply = false;
        }

        loop {
            let mut connection = match self.connection.take() {
                Some(connection) => connection,
                None => self.connect().await?,
            };

            match connection.recv_frame().await {
                Ok(Some(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(request) => {
                        self.connection = Some(connection);
                        self.awaiting_reply = true;
                        return Ok(PendingRequest {
                            request,
                            replier: self,
                        });
                    }
                    Err(e) => warn!("Undecodable request on {}: {}", self.endpoint, e),
                },
                Ok(None) => debug!("Requester on {} disconnected", self.endpoint),
                Err(e) => warn!("Failed to read request on {}: {}", self.endpoint, e),
            }
        }
    }
}

/// A received request that must be answered exactly once
#[derive(Debug)]
pub struct PendingRequest<'a> {
    request: Value,
    replier: &'a mut Replier,
}

impl PendingRequest<'_> {
    pub fn request(&self) -> &Value {
        &self.request
    }

    /// Send the reply, consuming the request
    pub async fn respond<T: Serialize + ?Sized>(self, reply: &T) -> CuemsResult<()> {
        let encoded = serde_json::to_vec(reply)?;
        let replier = self.replier;
        replier.awaiting_reply = false;

        let connection = replier
            .connection
            .as_mut()
            .ok_or_else(|| CuemsError::communication("requester connection lost"))?;
        if let Err(e) = connection.send_frame(&encoded).await {
            replier.connection = None;
            return Err(e.into());
        }
        Ok(())
    }
}
