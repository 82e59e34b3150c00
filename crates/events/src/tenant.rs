use keystone_core::TenantId;

use crate::EventEnvelope;
use crate::in_memory_transport::PublishedMessage;

/// Helper trait for tenant-scoped messages.
///
/// Lets tenant-aware infrastructure (consumer workers pinned to one tenant, message
/// filters) check which tenant a message belongs to without knowing its shape.
pub trait TenantScoped {
    /// Raw tenant token of this message.
    fn tenant(&self) -> &str;

    fn belongs_to(&self, tenant_id: &TenantId) -> bool {
        self.tenant() == tenant_id.as_str()
    }
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant(&self) -> &str {
        self.tenant_id().as_str()
    }
}

impl TenantScoped for PublishedMessage {
    fn tenant(&self) -> &str {
        PublishedMessage::tenant(self)
    }
}
