pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod identity;
pub mod node;
pub mod presence;
pub mod shutdown;
pub mod store;
pub mod tasks;
pub mod worker;
