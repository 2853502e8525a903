//! Tool infrastructure: catalog, local callables, resolution into handles.
//!
//! Tool kinds form a closed set. Resolution happens once per invocation and
//! yields an [`ExecutableHandle`]; local tools never see network concerns.

pub mod catalog;
pub mod handle;
pub mod local;
pub mod registry;

pub use catalog::{ToolBinding, ToolCatalog, ToolDescriptor, ToolKind, ToolOverlay, ToolSpec};
pub use handle::{ExecutableHandle, LocalHandle, RemoteHandle, SubAgentHandle};
pub use local::{FnTool, LocalTool, LocalToolTable};
pub use registry::ToolRegistry;
