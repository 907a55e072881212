use serde::{Deserialize, Serialize};

/// Attribution attached to every captured mutation. Any part may be unset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureContext {
    pub actor_id: Option<String>,
    pub tenant_id: Option<String>,
    pub request_id: Option<String>,
    pub client_address: Option<String>,
}

impl CaptureContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_client_address(mut self, address: impl Into<String>) -> Self {
        self.client_address = Some(address.into());
        self
    }

    pub fn from_provider(provider: &dyn ContextProvider) -> Self {
        Self {
            actor_id: provider.actor_id(),
            tenant_id: provider.tenant_id(),
            request_id: provider.request_id(),
            client_address: provider.client_address(),
        }
    }
}

/// Source of actor/tenant/request identity, usually the host's session layer.
pub trait ContextProvider: Send + Sync {
    fn actor_id(&self) -> Option<String>;
    fn tenant_id(&self) -> Option<String>;
    fn request_id(&self) -> Option<String>;
    fn client_address(&self) -> Option<String>;
}

impl ContextProvider for CaptureContext {
    fn actor_id(&self) -> Option<String> {
        self.actor_id.clone()
    }

    fn tenant_id(&self) -> Option<String> {
        self.tenant_id.clone()
    }

    fn request_id(&self) -> Option<String> {
        self.request_id.clone()
    }

    fn client_address(&self) -> Option<String> {
        self.client_address.clone()
    }
}
