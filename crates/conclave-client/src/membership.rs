//! The membership operations every resource proxy shares.

use std::sync::Arc;

use conclave_core::wire::{Action, EventMask, ResourceKind};
use conclave_core::{ProtocolError, Status};

use crate::client::ClientInner;
use crate::events::ResourceManager;

/// One resource's view of the generic membership protocol. Proxies embed
/// this and delegate; the typed listener registration stays on the proxy
/// because the callback trait differs per resource kind.
pub(crate) struct MembershipOps {
    pub(crate) inner: Arc<ClientInner>,
    pub(crate) session: u16,
    pub(crate) resource: ResourceKind,
    pub(crate) name: String,
}

impl MembershipOps {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        session: u16,
        resource: ResourceKind,
        name: String,
    ) -> Self {
        Self {
            inner,
            session,
            resource,
            name,
        }
    }

    pub(crate) fn key(&self) -> (u16, ResourceKind, String) {
        (self.session, self.resource, self.name.clone())
    }

    pub(crate) async fn join(&self) -> Result<(), ProtocolError> {
        self.inner
            .call(self.session, self.resource, Action::Join, |w| {
                w.put_string(&self.name).put_string(self.inner.name());
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn leave(&self) -> Result<(), ProtocolError> {
        self.inner
            .call(self.session, self.resource, Action::Leave, |w| {
                w.put_string(&self.name).put_string(self.inner.name());
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn invite(&self, invitee: &str) -> Result<(), ProtocolError> {
        self.inner
            .call(self.session, self.resource, Action::Invite, |w| {
                w.put_string(&self.name)
                    .put_string(self.inner.name())
                    .put_string(invitee);
            })
            .await?;
        Ok(())
    }

    /// Expel several clients at once. The per-client outcomes come back in
    /// request order; the call as a whole succeeds even when some entries
    /// fail.
    pub(crate) async fn expel(&self, clients: &[&str]) -> Result<Vec<Status>, ProtocolError> {
        let mut r = self
            .inner
            .call(self.session, self.resource, Action::Expel, |w| {
                w.put_string(&self.name)
                    .put_string(self.inner.name())
                    .put_string_list(clients);
            })
            .await?;
        let count = r.get_u16()? as usize;
        let mut statuses = Vec::with_capacity(count);
        for _ in 0..count {
            statuses.push(r.get_status()?);
        }
        Ok(statuses)
    }

    /// Register interest server-side; the caller wires the callback into
    /// the handler table under the returned id.
    pub(crate) async fn add_listener_raw(&self, mask: EventMask) -> Result<u32, ProtocolError> {
        let mut r = self
            .inner
            .call(self.session, self.resource, Action::AddListener, |w| {
                w.put_string(&self.name).put_u16(mask);
            })
            .await?;
        Ok(r.get_u32()?)
    }

    pub(crate) async fn remove_listener(&self, id: u32) -> Result<(), ProtocolError> {
        self.inner
            .call(self.session, self.resource, Action::RemoveListener, |w| {
                w.put_string(&self.name).put_u32(id);
            })
            .await?;
        self.inner.handler.remove_listener(&self.key(), id);
        Ok(())
    }

    pub(crate) async fn attach_manager(
        &self,
        mask: EventMask,
        manager: Arc<dyn ResourceManager>,
    ) -> Result<(), ProtocolError> {
        self.inner
            .call(self.session, self.resource, Action::AttachManager, |w| {
                w.put_string(&self.name).put_u16(mask);
            })
            .await?;
        self.inner.handler.set_manager(self.key(), manager);
        Ok(())
    }

    pub(crate) async fn is_managed(&self) -> Result<bool, ProtocolError> {
        let mut r = self
            .inner
            .call(self.session, self.resource, Action::IsManaged, |w| {
                w.put_string(&self.name);
            })
            .await?;
        Ok(r.get_bool()?)
    }

    pub(crate) async fn change_manager_mask(&self, mask: EventMask) -> Result<(), ProtocolError> {
        self.inner
            .call(self.session, self.resource, Action::ChangeManagerMask, |w| {
                w.put_string(&self.name).put_u16(mask);
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn client_names(&self) -> Result<Vec<String>, ProtocolError> {
        let mut r = self
            .inner
            .call(self.session, self.resource, Action::ListClientNames, |w| {
                w.put_string(&self.name);
            })
            .await?;
        Ok(r.get_string_list()?)
    }

    pub(crate) async fn destroy(&self) -> Result<(), ProtocolError> {
        self.inner
            .call(self.session, self.resource, Action::Destroy, |w| {
                w.put_string(&self.name).put_string(self.inner.name());
            })
            .await?;
        Ok(())
    }
}
