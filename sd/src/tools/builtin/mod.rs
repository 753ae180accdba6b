//! Built-in tools

mod apply_patch;
mod list_directory;
mod proc_session;
mod read_file;
mod run_command;
mod write_chunk;
mod write_file;

pub use apply_patch::ApplyPatchTool;
pub use list_directory::ListDirectoryTool;
pub use proc_session::{ProcSession, ProcessRegistry, ProcessSessionTool};
pub use read_file::ReadFileTool;
pub use run_command::RunCommandTool;
pub use write_chunk::WriteChunkTool;
pub use write_file::WriteFileTool;
