pub mod branches;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notes;
pub mod notify;
pub mod policy;
pub mod poll;
pub mod query;
pub mod request;
pub mod service;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod users;
pub mod utils;
