//! The experience-learning pipeline: resolved GHAP entries fan out into
//! per-axis vector points, accumulate until density clustering finds
//! recurring patterns, and validated "values" are distilled from cluster
//! centroids.

pub mod cluster;
pub mod persist;
pub mod values;

pub use cluster::{ClusterInfo, ExperienceClusterer};
pub use persist::{ObservationPersister, PersistReport};
pub use values::{Validation, ValueStore};
