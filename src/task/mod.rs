pub mod progress_bar;
pub mod runner;
pub mod traversal;
