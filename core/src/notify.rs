use async_trait::async_trait;
use slb_protocol::Request;
use slb_protocol::Result;

/// Capability handed in by the driver to announce new pending requests to
/// whatever sink it likes (terminal bell, chat webhook, desktop
/// notification). Notification is best effort: the creator logs and
/// swallows failures.
#[async_trait]
pub trait RequestNotifier: Send + Sync {
    async fn notify(&self, request: &Request) -> Result<()>;
}

/// Default notifier that does nothing.
pub struct NoopNotifier;

#[async_trait]
impl RequestNotifier for NoopNotifier {
    async fn notify(&self, _request: &Request) -> Result<()> {
        Ok(())
    }
}
