//! Shared fixtures for workspace tests: pre-recorded provider scripts,
//! seeded stores, and an isolated on-disk world.

mod scripts;
mod world;

pub use scripts::{plan_script, script_file, text_script, tool_call_script};
pub use world::TestWorld;
