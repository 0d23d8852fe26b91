//! Opening sessions and tracking who owns them.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ConnectionOptions;
use crate::error::SessionResult;
use crate::instance::Instance;
use crate::metadata::MetadataStore;

/// Opens sessions to servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> SessionResult<Arc<dyn Instance>>;
}

/// A session held by a command, either opened by it or lent by its caller.
pub enum InstanceHandle {
    /// Opened by the holder, closed on release.
    Owned(Arc<dyn Instance>),
    /// Lent by the caller, left open on release.
    Borrowed(Arc<dyn Instance>),
}

impl InstanceHandle {
    /// Open a new owned session.
    pub async fn open(connector: &dyn Connector, options: &ConnectionOptions) -> SessionResult<Self> {
        let instance = connector.connect(options).await?;
        debug!(address = %instance.address(), "Session opened");
        Ok(InstanceHandle::Owned(instance))
    }

    /// Wrap a caller's session.
    pub fn borrowed(instance: Arc<dyn Instance>) -> Self {
        InstanceHandle::Borrowed(instance)
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, InstanceHandle::Owned(_))
    }

    /// The shared session.
    pub fn instance(&self) -> &Arc<dyn Instance> {
        match self {
            InstanceHandle::Owned(i) | InstanceHandle::Borrowed(i) => i,
        }
    }

    /// Give the handle up: owned sessions are closed, borrowed ones untouched.
    pub async fn release(self) -> SessionResult<()> {
        match self {
            InstanceHandle::Owned(instance) => {
                debug!(address = %instance.address(), "Closing owned session");
                instance.close().await
            }
            InstanceHandle::Borrowed(_) => Ok(()),
        }
    }
}

impl Deref for InstanceHandle {
    type Target = dyn Instance;

    fn deref(&self) -> &Self::Target {
        self.instance().as_ref()
    }
}

/// Everything an operation needs to reach a cluster: the session to the
/// server the caller is connected to, the metadata read through it, and a
/// connector plus credentials for opening sessions to other members.
#[derive(Clone)]
pub struct ClusterSession {
    pub source: Arc<dyn Instance>,
    pub metadata: Arc<dyn MetadataStore>,
    pub connector: Arc<dyn Connector>,
    pub credentials: ConnectionOptions,
}

impl ClusterSession {
    pub fn new(
        source: Arc<dyn Instance>,
        metadata: Arc<dyn MetadataStore>,
        connector: Arc<dyn Connector>,
        credentials: ConnectionOptions,
    ) -> Self {
        Self {
            source,
            metadata,
            connector,
            credentials,
        }
    }
}
