pub mod db;
pub mod exact_matches;
