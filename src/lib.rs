pub mod api;
pub mod cli;
pub mod download;
pub mod remote;
pub mod task;
