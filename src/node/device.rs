//! Device Resolver
//!
//! Finds the local block device backing an array volume. The controller's
//! map call may not be visible on the host yet, so [`DeviceResolver::resolve`]
//! keeps scanning for a bounded number of attempts.

use crate::domain::ports::{Device, NodeHostRef};
use crate::error::{Error, Result};
use crate::retry::{Attempt, RequestContext, RetryPolicy};
use tracing::debug;

pub struct DeviceResolver {
    host: NodeHostRef,
    discovery: RetryPolicy,
}

impl DeviceResolver {
    pub fn new(host: NodeHostRef, discovery: RetryPolicy) -> Self {
        Self { host, discovery }
    }

    /// One scan of the host's volume map
    pub async fn lookup(&self, ctx: &RequestContext, volume_id: &str) -> Result<Option<Device>> {
        let local = ctx
            .call("local volumes", self.host.local_volumes())
            .await?;
        let Some(entry) = local.into_iter().find(|v| v.volume_id == volume_id) else {
            return Ok(None);
        };

        let device = ctx
            .call("block device", self.host.block_device(&entry.device_path))
            .await?;
        Ok(Some(device))
    }

    /// Scan until the device shows up or the attempts run out
    pub async fn resolve(&self, ctx: &RequestContext, volume_id: &str) -> Result<Device> {
        let found = self
            .discovery
            .poll(ctx, "device discovery", |attempt| async move {
                match self.lookup(ctx, volume_id).await? {
                    Some(device) => Ok(Attempt::Done(device)),
                    None => {
                        debug!("Volume {} not visible locally (attempt {})", volume_id, attempt + 1);
                        Ok(Attempt::Retry)
                    }
                }
            })
            .await?;

        found.ok_or_else(|| {
            Error::Unavailable(format!("volume: {} not published to node", volume_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::FakeHost;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn resolver(host: Arc<FakeHost>, attempts: u32) -> DeviceResolver {
        DeviceResolver::new(host, RetryPolicy::new(attempts, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_resolves_attached_volume() {
        let host = Arc::new(FakeHost::new());
        host.attach("vol1", "scinia");

        let dev = resolver(host, 1)
            .resolve(&RequestContext::background(), "vol1")
            .await
            .unwrap();
        assert_eq!(dev.real_dev.to_str(), Some("/dev/scinia"));
        assert_eq!(dev.name, "scinia");
    }

    #[tokio::test]
    async fn test_waits_for_late_attach() {
        let host = Arc::new(FakeHost::new());
        host.attach("vol1", "scinia");
        host.hide_volumes_for(3);

        let dev = resolver(host.clone(), 5)
            .resolve(&RequestContext::background(), "vol1")
            .await
            .unwrap();
        assert_eq!(dev.name, "scinia");
        assert_eq!(host.local_volume_scans(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_after_attempts() {
        let host = Arc::new(FakeHost::new());
        let err = resolver(host.clone(), 3)
            .resolve(&RequestContext::background(), "vol1")
            .await
            .unwrap_err();
        assert_matches!(err, Error::Unavailable(_));
        assert_eq!(host.local_volume_scans(), 3);
    }

    #[tokio::test]
    async fn test_lookup_is_single_shot() {
        let host = Arc::new(FakeHost::new());
        let found = resolver(host.clone(), 20)
            .lookup(&RequestContext::background(), "vol1")
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(host.local_volume_scans(), 1);
    }
}
