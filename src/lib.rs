pub mod audit;
pub mod cloud;
pub mod monitor;
pub mod notifications;
pub mod policy;
pub mod server;
pub mod shutdown;
pub mod version;
pub mod web;
