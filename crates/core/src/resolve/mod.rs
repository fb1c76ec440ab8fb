#![allow(missing_docs)]

//! Bulk id resolution for builds and equipment.

mod groups;
mod latest;
mod pipeline;

pub use groups::{EquipmentGroup, SlotView};
pub use latest::LatestRequest;
pub use pipeline::{BuildIds, ResolutionPipeline, ResolvedBuild, ResolvedEquipment};
