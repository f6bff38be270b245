pub mod deliberation_tool;
pub mod filestore_tool;
pub mod process_tool;
pub mod schedule_tool;
pub mod terminal_tool;
