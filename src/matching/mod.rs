pub mod classifier;
pub mod db;
pub mod manager;
