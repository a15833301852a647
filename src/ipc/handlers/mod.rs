pub mod core;
pub mod exceptions;
pub mod jobs;
pub mod marking;
pub mod notifications;
pub mod reports;
pub mod schedule;
pub mod settings;
pub mod setup;
