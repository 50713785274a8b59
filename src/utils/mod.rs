//! Small helpers shared by the dispatcher and adapters.

pub mod tool_call_assembler;

pub use tool_call_assembler::ToolCallAssembler;
