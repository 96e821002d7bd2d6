//! Request-scoped values threaded through routing and handlers.

/// Values that travel with one inbound request.
///
/// Cancellation is not carried here: dropping the future that owns a dial
/// aborts it at the next await point.
#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    /// Name of the service that accepted the connection.
    pub service: Option<String>,
    /// Identity assigned by the auther after a successful login.
    pub client_id: Option<String>,
    /// Address of the original client, as seen by the first listener.
    pub client_addr: Option<String>,
    /// Source for the `hash` selector strategy.
    pub hash_source: Option<String>,
}

impl RequestCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = Some(addr.into());
        self
    }

    pub fn with_hash_source(mut self, source: impl Into<String>) -> Self {
        self.hash_source = Some(source.into());
        self
    }

    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("")
    }
}
