pub mod activities;
pub mod backup;
pub mod core;
pub mod dashboard;
pub mod evaluation;
pub mod scores;
pub mod semesters;
pub mod setup;
pub mod structure;
pub mod students;
pub mod subjects;
