//! Proxy for a mutual-exclusion token.

use std::sync::Arc;

use conclave_core::wire::{Action, EventMask, ResourceKind, TokenStatus};
use conclave_core::{ProtocolError, Status};

use crate::client::ClientInner;
use crate::events::{ResourceManager, TokenEvents};
use crate::membership::MembershipOps;

pub struct TokenProxy {
    ops: MembershipOps,
}

impl TokenProxy {
    pub(crate) fn new(inner: Arc<ClientInner>, session: u16, name: String) -> Self {
        Self {
            ops: MembershipOps::new(inner, session, ResourceKind::Token, name),
        }
    }

    pub fn name(&self) -> &str {
        &self.ops.name
    }

    fn inner(&self) -> &Arc<ClientInner> {
        &self.ops.inner
    }

    /// Try to take the token. `exclusive` refuses to share; a non-exclusive
    /// grab joins the holder set when the token is already held
    /// non-exclusively. Denials come back as errors carrying the token's
    /// current status.
    pub async fn grab(&self, exclusive: bool) -> Result<TokenStatus, ProtocolError> {
        self.inner()
            .token_call(self.ops.session, Action::Grab, |w| {
                w.put_string(&self.ops.name)
                    .put_string(self.inner().name())
                    .put_bool(exclusive);
            })
            .await
    }

    pub async fn release(&self) -> Result<TokenStatus, ProtocolError> {
        self.inner()
            .token_call(self.ops.session, Action::Release, |w| {
                w.put_string(&self.ops.name).put_string(self.inner().name());
            })
            .await
    }

    /// Hand the token to another member. The transfer completes when the
    /// receiver grabs; releasing before that cancels it.
    pub async fn give(&self, receiver: &str) -> Result<TokenStatus, ProtocolError> {
        self.inner()
            .token_call(self.ops.session, Action::Give, |w| {
                w.put_string(&self.ops.name)
                    .put_string(self.inner().name())
                    .put_string(receiver);
            })
            .await
    }

    /// Signal the current holders that this client wants the token.
    pub async fn request(&self) -> Result<TokenStatus, ProtocolError> {
        self.inner()
            .token_call(self.ops.session, Action::Request, |w| {
                w.put_string(&self.ops.name).put_string(self.inner().name());
            })
            .await
    }

    /// The token's current status, no membership required.
    pub async fn test(&self) -> Result<TokenStatus, ProtocolError> {
        self.inner()
            .token_call(self.ops.session, Action::Test, |w| {
                w.put_string(&self.ops.name);
            })
            .await
    }

    pub async fn holder_names(&self) -> Result<Vec<String>, ProtocolError> {
        let mut r = self
            .inner()
            .call(
                self.ops.session,
                ResourceKind::Token,
                Action::ListHolderNames,
                |w| {
                    w.put_string(&self.ops.name);
                },
            )
            .await?;
        Ok(r.get_string_list()?)
    }

    pub async fn destroy(&self) -> Result<(), ProtocolError> {
        self.ops.destroy().await
    }

    // ── membership ───────────────────────────────────────────────────────

    pub async fn join(&self) -> Result<(), ProtocolError> {
        self.ops.join().await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.ops.leave().await
    }

    pub async fn invite(&self, invitee: &str) -> Result<(), ProtocolError> {
        self.ops.invite(invitee).await
    }

    pub async fn expel(&self, clients: &[&str]) -> Result<Vec<Status>, ProtocolError> {
        self.ops.expel(clients).await
    }

    pub async fn add_listener(
        &self,
        mask: EventMask,
        callback: Arc<dyn TokenEvents>,
    ) -> Result<u32, ProtocolError> {
        let id = self.ops.add_listener_raw(mask).await?;
        self.inner()
            .handler
            .add_token_listener(self.ops.key(), id, mask, callback);
        Ok(id)
    }

    pub async fn remove_listener(&self, id: u32) -> Result<(), ProtocolError> {
        self.ops.remove_listener(id).await
    }

    pub async fn attach_manager(
        &self,
        mask: EventMask,
        manager: Arc<dyn ResourceManager>,
    ) -> Result<(), ProtocolError> {
        self.ops.attach_manager(mask, manager).await
    }

    pub async fn is_managed(&self) -> Result<bool, ProtocolError> {
        self.ops.is_managed().await
    }

    pub async fn change_manager_mask(&self, mask: EventMask) -> Result<(), ProtocolError> {
        self.ops.change_manager_mask(mask).await
    }

    pub async fn client_names(&self) -> Result<Vec<String>, ProtocolError> {
        self.ops.client_names().await
    }
}
