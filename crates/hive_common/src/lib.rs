//! Hive Common - shared types and collaborator seams for the hive controller
//!
//! Pure data (plans, views, samples) plus the traits every external system
//! is reached through. Real implementations talk to docker, gcloud, the
//! metadata server and the search engine; `fakes` backs the tests.

pub mod capacity;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod fakes;
pub mod inventory;
pub mod metadata;
pub mod search;
pub mod search_client;
pub mod shared;
pub mod substrate;
pub mod workload;

pub use capacity::{plan, CapacityPlan, PlannerTables};
pub use cluster::{ClusterEpoch, ClusterView, Member, MemberRole, MembershipStatus, NodeRole};
pub use config::HiveConfig;
pub use error::{HiveError, Result};
pub use shared::{SharedKey, SharedStore};
pub use workload::{Workload, WorkloadHealth};
