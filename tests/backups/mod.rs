//! Behavioural coverage for running backup jobs.

mod bdd_steps;
mod scenarios;
mod test_helpers;
