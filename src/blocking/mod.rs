pub mod coverage;
pub mod db;
pub mod predicates;
