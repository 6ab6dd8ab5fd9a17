pub mod failures;
pub mod reset_failures;
pub mod run_once;
