//! Infrastructure layer: broker plumbing, job persistence, worker execution, config.

pub mod blob;
pub mod broker;
pub mod config;
pub mod jobs;
pub mod pipelines;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod test_support;
