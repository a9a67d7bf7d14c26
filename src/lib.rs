pub mod broker;
pub mod codec;
pub mod domain;
pub mod gateway;
pub mod models;
pub mod processing;
pub mod results;
pub mod retry;
