pub mod blocking;
pub mod candidate_generation;
pub mod clustering;
pub mod config;
pub mod error;
pub mod matching;
pub mod models;
pub mod pipeline;
pub mod preprocess;
pub mod utils;
