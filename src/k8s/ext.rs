//! Extension (CRD) client

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, warn};

use crate::error::Result;

/// Access to `apiextensions.k8s.io` resources
#[derive(Clone)]
pub struct ExtClient {
    client: Client,
}

impl ExtClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }

    /// Check if the CRD `<plural>.<group>` exists
    pub async fn crd_exists(&self, plural: &str, group: &str) -> Result<bool> {
        let name = crd_name(plural, group);
        match self.crds().get_opt(&name).await? {
            Some(_) => Ok(true),
            None => {
                debug!(crd = %name, "CRD not installed");
                Ok(false)
            }
        }
    }

    /// Check that every CRD named in `names` is installed
    pub async fn crds_installed(&self, names: &[&str]) -> Result<bool> {
        let installed = self.crds().list_metadata(&ListParams::default()).await?;

        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|wanted| {
                !installed
                    .items
                    .iter()
                    .any(|crd| crd.metadata.name.as_deref() == Some(*wanted))
            })
            .collect();

        if !missing.is_empty() {
            warn!(
                ?missing,
                "CRDs not fully installed ({}/{})",
                names.len() - missing.len(),
                names.len()
            );
        }
        Ok(missing.is_empty())
    }
}

/// Name of the CRD defining `plural` in `group`
pub fn crd_name(plural: &str, group: &str) -> String {
    format!("{plural}.{group}")
}
