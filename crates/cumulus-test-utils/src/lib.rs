//! Shared fixtures for integration tests: a scripted cluster that never
//! leaves the process, step graph builders and a temporary workspace.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod builders;
mod harness;
mod scripted;

pub use builders::{graph, step, token_cluster, StepBuilder};
pub use harness::TestContext;
pub use scripted::{Behavior, Call, CallLog, Script, ScriptedCluster, ScriptedConnector};
