pub mod backend;
pub mod batch;
pub mod embedding;
pub mod liveness;
pub mod scheduler;
