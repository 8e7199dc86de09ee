pub mod agent_jobs;
pub mod agent_proxy;
pub mod controller;
pub mod interfaces;
pub mod job;
pub mod monitor;
pub mod node;
pub mod proxy;

mod test_support;
