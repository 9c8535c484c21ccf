//! Top-level assembly: one object that owns the transport selector, the
//! transaction endpoint, the dialog layer, and the conversation manager,
//! and runs their loops on the stack task.

pub use crate::transaction::{Endpoint, EndpointBuilder};

use crate::{
    conversation::{
        events::ConversationEventSender, manager::ConversationProfile, ConversationManager,
        ConversationManagerHandle,
    },
    dialog::dialog_layer::DialogLayer,
    transaction::endpoint::EndpointOption,
    transport::{SipConnection, TransportSelector},
    Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct StackBuilder {
    user_agent: String,
    option: EndpointOption,
    cancel_token: Option<CancellationToken>,
    transports: Vec<SipConnection>,
    aliases: Vec<String>,
}

/// A complete user agent: endpoint, dialog layer, and conversation
/// manager. `serve` drives everything; the returned
/// [`ConversationManagerHandle`] is the application-facing API.
pub struct Stack {
    pub endpoint: Endpoint,
    pub dialog_layer: Arc<DialogLayer>,
    cancel_token: CancellationToken,
}

impl StackBuilder {
    pub fn new() -> Self {
        StackBuilder {
            user_agent: "convostack/0.1".to_string(),
            option: EndpointOption::default(),
            cancel_token: None,
            transports: Vec::new(),
            aliases: Vec::new(),
        }
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn transport(mut self, connection: SipConnection) -> Self {
        self.transports.push(connection);
        self
    }

    /// Domain this endpoint answers for (`is_my_domain`).
    pub fn alias(mut self, domain: &str) -> Self {
        self.aliases.push(domain.to_string());
        self
    }

    pub fn build(self) -> Stack {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let selector = TransportSelector::new(cancel_token.child_token());
        for connection in self.transports {
            selector.add_transport(connection);
        }
        for alias in &self.aliases {
            selector.add_alias(alias);
        }
        let endpoint = EndpointBuilder::new()
            .user_agent(&self.user_agent)
            .transport_selector(selector)
            .cancel_token(cancel_token.child_token())
            .option(self.option)
            .build();
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
        Stack {
            endpoint,
            dialog_layer,
            cancel_token,
        }
    }
}

impl Default for StackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack {
    /// Attach a conversation manager with the given identity profile and
    /// application event sink.
    pub fn conversation_manager(
        &self,
        profile: ConversationProfile,
        app_events: ConversationEventSender,
    ) -> (ConversationManagerHandle, ConversationManager) {
        ConversationManager::new(self.dialog_layer.clone(), profile, app_events)
    }

    /// Run transports, transaction timers, and dialog dispatch until
    /// cancelled. The caller spawns the conversation manager's `run`
    /// separately so the two can share the runtime.
    pub async fn serve(&self) -> Result<()> {
        self.endpoint.inner.start_transports().await?;
        let events = self
            .endpoint
            .take_events()
            .ok_or_else(|| crate::Error::EndpointError("endpoint already served".into()))?;
        let dialog_layer = self.dialog_layer.clone();
        tokio::select! {
            _ = self.cancel_token.cancelled() => {
                info!("stack cancelled");
            }
            _ = self.endpoint.serve() => {}
            _ = dialog_layer.serve(events) => {}
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.dialog_layer.shutdown().await;
        self.cancel_token.cancel();
    }

    pub fn is_my_domain(&self, domain: &str) -> bool {
        self.endpoint.selector().is_my_domain(domain)
    }
}
