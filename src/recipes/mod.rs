//! Concrete pipelines for the supported tools
//!
//! A recipe describes which units it applies to and the pipeline run on each
//! of them. The external command contracts (argument order, flags, output
//! locations) are fixed here; everything configurable comes from
//! [`Settings`](crate::config::Settings).

use std::sync::Arc;

use crate::batch::{BatchJob, DiscoverySpec, WorkUnit};
use crate::pipeline::Pipeline;
use crate::Result;

pub mod atlas;
pub mod dti;
pub mod recon;

pub use atlas::{
    ensure_template_link, standard_atlases, AnnotSource, AtlasDefinition, AtlasRecipe, SubcorticalAtlas,
};
pub use dti::{DtifitRecipe, RegistrationRecipe};
pub use recon::ReconRecipe;

/// A pipeline description applied to discovered units
pub trait Recipe: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Which directories under the data root are units
    fn discovery(&self) -> DiscoverySpec;

    /// Build the pipeline shared by every unit
    fn pipeline(&self) -> Result<Pipeline>;

    /// One job per unit, all sharing the same pipeline
    fn jobs(&self, units: Vec<WorkUnit>) -> Result<Vec<BatchJob>> {
        let pipeline = Arc::new(self.pipeline()?);
        Ok(units
            .into_iter()
            .map(|unit| BatchJob::new(unit, Arc::clone(&pipeline)))
            .collect())
    }
}
