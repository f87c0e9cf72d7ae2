//! Scenario-based tests for the conductor engine


mod intervention;
mod resume;
mod retry_behavior;
mod success_chain;
mod workspace;
