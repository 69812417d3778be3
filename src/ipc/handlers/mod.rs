pub mod assignment_questions;
pub mod assignments;
pub mod catalog;
pub mod core;
pub mod exam;
pub mod release;
pub mod setup;
