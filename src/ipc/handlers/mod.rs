pub mod attendance;
pub mod auth;
pub mod classes;
pub mod core;
pub mod notify;
pub mod reports;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod teachers;
