//! Identity Service
//!
//! Plugin name, version and capabilities, plus a readiness probe that runs
//! the probes of whichever services this process hosts.

use crate::controller::ControllerService;
use crate::domain::csi::{
    GetPluginCapabilitiesResponse, GetPluginInfoResponse, PluginCapability, ProbeResponse,
};
use crate::error::Result;
use crate::node::NodeService;
use crate::retry::RequestContext;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Manifest key pointing at the project
pub const MANIFEST_URL_KEY: &str = "url";
const PROJECT_URL: &str = env!("CARGO_PKG_REPOSITORY");

pub struct IdentityService {
    driver_name: String,
    controller: Option<Arc<ControllerService>>,
    node: Option<Arc<NodeService>>,
}

impl IdentityService {
    pub fn new(
        driver_name: impl Into<String>,
        controller: Option<Arc<ControllerService>>,
        node: Option<Arc<NodeService>>,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            controller,
            node,
        }
    }

    pub fn get_plugin_info(&self) -> GetPluginInfoResponse {
        GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: crate::VERSION.to_string(),
            manifest: BTreeMap::from([(MANIFEST_URL_KEY.to_string(), PROJECT_URL.to_string())]),
        }
    }

    pub fn get_plugin_capabilities(&self) -> GetPluginCapabilitiesResponse {
        GetPluginCapabilitiesResponse {
            capabilities: vec![PluginCapability::ControllerService],
        }
    }

    /// Probe every hosted service; the first failure is returned
    pub async fn probe(&self, ctx: &RequestContext) -> Result<ProbeResponse> {
        if let Some(controller) = &self.controller {
            controller.probe(ctx).await?;
            debug!("Controller probe succeeded");
        }
        if let Some(node) = &self.node {
            node.probe(ctx).await?;
            debug!("Node probe succeeded");
        }
        Ok(ProbeResponse { ready: true })
    }

    /// True once every hosted service has probed successfully
    pub async fn is_ready(&self) -> bool {
        if let Some(controller) = &self.controller {
            if !controller.is_probed().await {
                return false;
            }
        }
        if let Some(node) = &self.node {
            if !node.is_probed().await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::error::Error;
    use crate::gateway::{SimulatedArray, SimulatedArrayConfig};
    use crate::node::testing::FakeHost;
    use crate::node::NodeConfig;
    use assert_matches::assert_matches;

    fn controller(array: Arc<SimulatedArray>) -> Arc<ControllerService> {
        Arc::new(ControllerService::new(ControllerConfig::default(), array))
    }

    #[test]
    fn test_plugin_info() {
        let id = IdentityService::new("csi-test", None, None);
        let info = id.get_plugin_info();
        assert_eq!(info.name, "csi-test");
        assert_eq!(info.vendor_version, crate::VERSION);
        assert!(info.manifest.contains_key(MANIFEST_URL_KEY));
        assert_eq!(
            id.get_plugin_capabilities().capabilities,
            vec![PluginCapability::ControllerService]
        );
    }

    #[tokio::test]
    async fn test_probe_runs_hosted_services() {
        let array = Arc::new(SimulatedArray::new(SimulatedArrayConfig::default()));
        let host = Arc::new(FakeHost::new());
        let node = Arc::new(NodeService::new(NodeConfig::default(), host));
        let id = IdentityService::new("csi-test", Some(controller(array)), Some(node));

        assert!(!id.is_ready().await);
        let resp = id.probe(&RequestContext::background()).await.unwrap();
        assert!(resp.ready);
        assert!(id.is_ready().await);
    }

    #[tokio::test]
    async fn test_probe_reports_array_failure() {
        let array = Arc::new(SimulatedArray::new(SimulatedArrayConfig::default()));
        array.set_fail_auth(true);
        let id = IdentityService::new("csi-test", Some(controller(array)), None);

        let err = id.probe(&RequestContext::background()).await.unwrap_err();
        assert_matches!(err, Error::FailedPrecondition(_));
        assert!(!id.is_ready().await);
    }
}
