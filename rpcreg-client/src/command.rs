use crate::error::RegistryError;
use crate::registry::{Command, Registry};
use std::sync::Arc;

/// Reads operator-pushed commands, e.g. routing or traffic directives.
///
/// A point read: callers that need change notification poll at their own cadence.
#[derive(Clone)]
pub struct CommandChannel {
    registry: Arc<dyn Registry>,
}

impl CommandChannel {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        CommandChannel { registry }
    }

    /// Current command of `group`, with an empty payload when none is stored.
    pub async fn fetch_command(&self, group: &str) -> Result<Command, RegistryError> {
        let payload = self.registry.lookup_command(group).await?;
        Ok(Command {
            group: group.to_string(),
            payload,
        })
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    #[tokio::test]
    async fn test_missing_command_is_empty() {
        let channel = CommandChannel::new(Arc::new(MemoryRegistry::new()));
        let command = channel.fetch_command("payments").await.unwrap();
        assert_eq!(command, Command::empty("payments"));
        assert!(command.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_pushed_command() {
        let store = MemoryRegistry::new();
        store.put_command("payments", r#"{"route": "canary"}"#);
        let channel = CommandChannel::new(Arc::new(store.clone()));
        let command = channel.fetch_command("payments").await.unwrap();
        assert_eq!(command.payload, r#"{"route": "canary"}"#);
        assert!(channel.fetch_command("orders").await.unwrap().is_empty());

        store.set_available(false);
        assert!(matches!(
            channel.fetch_command("payments").await,
            Err(RegistryError::RegistryUnavailable(_))
        ));
    }
}
