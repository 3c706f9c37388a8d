pub mod config;
pub mod merge;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod types;
