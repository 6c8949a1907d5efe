pub mod executor;
pub mod fieldexpr;
pub mod geometry;
pub mod pipeline;
pub mod scheduler;
pub mod school;
pub mod storage;
pub mod types;
pub mod vault;
