//! gRPC surface: the receiver that queues keys, and the client callback the
//! dispatcher uses to hand a key to a downstream service.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::dispatcher::Callback;
use crate::error::{Error, Result};
use crate::gcp::{MetadataClient, bearer};
use crate::keystore::KeyStore;

pub mod pb {
    tonic::include_proto!("workqueue");
}

use pb::workqueue_service_client::WorkqueueServiceClient;
use pb::workqueue_service_server::{WorkqueueService, WorkqueueServiceServer};
use pb::{ProcessRequest, ProcessResponse};

/// Accepts keys over gRPC and adds them to the backlog.
#[derive(Debug, Clone)]
pub struct Receiver {
    store: KeyStore,
}

impl Receiver {
    pub fn new(store: KeyStore) -> Self {
        Self { store }
    }

    pub fn into_service(self) -> WorkqueueServiceServer<Self> {
        WorkqueueServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl WorkqueueService for Receiver {
    async fn process(
        &self,
        request: Request<ProcessRequest>,
    ) -> std::result::Result<Response<ProcessResponse>, Status> {
        let key = request.into_inner().key;
        if key.is_empty() {
            return Err(Status::invalid_argument("key is required"));
        }
        match self.store.queue(&key).await {
            Ok(()) => {
                debug!(key, "queued");
                Ok(Response::new(ProcessResponse {}))
            }
            Err(Error::InvalidKey(k)) => {
                Err(Status::invalid_argument(format!("invalid key: {k:?}")))
            }
            Err(e) => {
                warn!(key, error = %e, "failed to queue key");
                Err(Status::internal(format!("queue: {e}")))
            }
        }
    }
}

/// Serve the receiver on `listener` until `shutdown` resolves.
pub async fn serve_receiver(
    listener: TcpListener,
    store: KeyStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "receiver listening");

    tonic::transport::Server::builder()
        .add_service(Receiver::new(store).into_service())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.await;
            info!("receiver shutting down");
        })
        .await?;
    Ok(())
}

/// Callback that forwards each key to a remote `WorkqueueService`.
///
/// An `https://` target is dialed over TLS and every call carries a Google
/// identity token for that target; anything else is plaintext HTTP/2.
#[derive(Clone)]
pub struct ServiceCallback {
    client: WorkqueueServiceClient<Channel>,
    identity: Option<(Arc<MetadataClient>, String)>,
}

impl ServiceCallback {
    /// Wrap an existing channel. No credentials are attached.
    pub fn new(channel: Channel) -> Self {
        Self {
            client: WorkqueueServiceClient::new(channel),
            identity: None,
        }
    }

    /// Build a lazily-connected callback for `target`.
    pub fn connect(target: &str, metadata: Arc<MetadataClient>) -> Result<Self> {
        let endpoint = Endpoint::from_shared(target.to_string())
            .map_err(|e| Error::Config(format!("invalid target {target:?}: {e}")))?;

        if target.starts_with("https://") {
            let endpoint =
                endpoint.tls_config(ClientTlsConfig::new().with_webpki_roots())?;
            Ok(Self::new(endpoint.connect_lazy()).with_identity_token(metadata, target))
        } else {
            Ok(Self::new(endpoint.connect_lazy()))
        }
    }

    /// Attach an identity token minted for `audience` to every call.
    pub fn with_identity_token(
        mut self,
        metadata: Arc<MetadataClient>,
        audience: impl Into<String>,
    ) -> Self {
        self.identity = Some((metadata, audience.into()));
        self
    }
}

impl std::fmt::Debug for ServiceCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCallback")
            .field("authenticated", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Callback for ServiceCallback {
    async fn process(&self, key: &str) -> anyhow::Result<()> {
        let mut request = Request::new(ProcessRequest {
            key: key.to_string(),
        });
        if let Some((metadata, audience)) = &self.identity {
            let token = metadata
                .identity_token(audience)
                .await
                .context("fetching identity token")?;
            let value: MetadataValue<Ascii> = bearer(&token).parse()?;
            request.metadata_mut().insert("authorization", value);
        }

        let mut client = self.client.clone();
        client
            .process(request)
            .await
            .with_context(|| format!("process({key})"))?;
        Ok(())
    }
}
