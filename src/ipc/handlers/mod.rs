pub mod audit;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod gradebook;
pub mod grades;
pub mod grid;
pub mod ktea;
pub mod letters;
pub mod roster;
