pub mod candidate_generation;
pub mod db;
