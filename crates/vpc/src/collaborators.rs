//! External resource managers invoked while an environment is built or torn down.
//!
//! Compute, load-balancing and data-store managers live outside this crate.
//! They are handed in as [`Collaborator`] trait objects and called at fixed
//! points of the lifecycle; any failure aborts the surrounding sequence.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::info;

use crate::error::{Result, VpcError};
use crate::lifecycle::Environment;

/// A manager of resources that live inside an environment.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Create everything this collaborator owns for the environment.
    async fn create_all_for_environment(&self, environment: &Environment) -> anyhow::Result<()>;

    /// Destroy everything this collaborator owns in the environment.
    /// With `wait`, return only once the resources are gone.
    async fn destroy_all_for_environment(
        &self,
        environment: &Environment,
        wait: bool,
    ) -> anyhow::Result<()>;
}

fn collaborator_error(collaborator: &dyn Collaborator, err: anyhow::Error) -> VpcError {
    VpcError::Collaborator {
        name: collaborator.name().to_string(),
        source: err.into(),
    }
}

/// Collaborators grouped by the order they must run in.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub compute: Vec<Arc<dyn Collaborator>>,
    pub load_balancing: Vec<Arc<dyn Collaborator>>,
    /// Independent of each other, so run concurrently.
    pub data_stores: Vec<Arc<dyn Collaborator>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |group: &[Arc<dyn Collaborator>]| -> Vec<String> {
            group.iter().map(|c| c.name().to_string()).collect()
        };
        f.debug_struct("Collaborators")
            .field("compute", &names(&self.compute))
            .field("load_balancing", &names(&self.load_balancing))
            .field("data_stores", &names(&self.data_stores))
            .finish()
    }
}

impl Collaborators {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compute.is_empty() && self.load_balancing.is_empty() && self.data_stores.is_empty()
    }

    /// Data stores first (concurrently), then load balancers, then compute.
    ///
    /// # Errors
    /// `Collaborator` naming the first collaborator that failed.
    pub async fn create_all(&self, environment: &Environment) -> Result<()> {
        try_join_all(self.data_stores.iter().map(|c| async move {
            info!(collaborator = c.name(), environment = %environment.name, "Creating collaborator resources");
            c.create_all_for_environment(environment)
                .await
                .map_err(|e| collaborator_error(c.as_ref(), e))
        }))
        .await?;

        for c in self.load_balancing.iter().chain(&self.compute) {
            info!(collaborator = c.name(), environment = %environment.name, "Creating collaborator resources");
            c.create_all_for_environment(environment)
                .await
                .map_err(|e| collaborator_error(c.as_ref(), e))?;
        }
        Ok(())
    }

    /// Compute first, then load balancers, then data stores (concurrently).
    /// Each collaborator is waited on before the next group starts.
    ///
    /// # Errors
    /// `Collaborator` naming the first collaborator that failed.
    pub async fn destroy_all(&self, environment: &Environment) -> Result<()> {
        for c in self.compute.iter().chain(&self.load_balancing) {
            info!(collaborator = c.name(), environment = %environment.name, "Destroying collaborator resources");
            c.destroy_all_for_environment(environment, true)
                .await
                .map_err(|e| collaborator_error(c.as_ref(), e))?;
        }

        try_join_all(self.data_stores.iter().map(|c| async move {
            info!(collaborator = c.name(), environment = %environment.name, "Destroying collaborator resources");
            c.destroy_all_for_environment(environment, true)
                .await
                .map_err(|e| collaborator_error(c.as_ref(), e))
        }))
        .await?;
        Ok(())
    }
}
