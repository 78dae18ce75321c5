mod builder;
mod dependency;
mod graph;
pub mod pass;
mod registry;
mod resource;

pub use builder::FrameGraphBuilder;
pub use dependency::{DependencyGraph, Edge, EdgeId, NodeId, TARGET};
pub use graph::{FrameGraph, GraphState};
pub use pass::{
    FrameCommandLists, Pass, PassContext, PreComputeContext, PrepareContext, RegisterContext,
};
pub use registry::{PassRegistry, PassSettings};
pub use resource::{
    AccessState, FrameGraphResource, ResourceHandle, ResourceKind, ResourceSize, ResourceTable,
};
