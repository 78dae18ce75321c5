use crate::error::FrameGraphError;
use crate::gpu::Format;
use crate::render::framegraph::{
    DependencyGraph, FrameGraphResource, NodeId, ResourceHandle, ResourceKind, ResourceTable,
};

/// Handed to each pass during setup to declare what it writes and reads.
pub struct FrameGraphBuilder<'a> {
    graph: &'a mut DependencyGraph,
    resources: &'a mut ResourceTable,
    node: NodeId,
}

impl<'a> FrameGraphBuilder<'a> {
    pub fn new(
        graph: &'a mut DependencyGraph,
        resources: &'a mut ResourceTable,
        node: NodeId,
    ) -> Self {
        Self {
            graph,
            resources,
            node,
        }
    }

    /// The node of the pass being set up.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Declares `name` as produced by the current pass.
    pub fn write(
        &mut self,
        name: &str,
        kind: ResourceKind,
        format: Format,
    ) -> Result<ResourceHandle, FrameGraphError> {
        let (handle, _) = self.resources.intern(name, kind, format);
        let resource = self.resources.resource_mut(handle);
        check_declaration(resource, kind, format)?;

        match resource.producer() {
            Some(producer) if producer != self.node => {
                return Err(FrameGraphError::MultipleProducers {
                    resource: name.to_string(),
                    producer,
                    writer: self.node,
                });
            }
            Some(_) => {}
            None => resource.set_producer(self.node),
        }

        Ok(handle)
    }

    /// Declares that the current pass consumes `name`, which an earlier pass
    /// must have written during this setup.
    pub fn read(
        &mut self,
        name: &str,
        kind: ResourceKind,
        format: Format,
    ) -> Result<ResourceHandle, FrameGraphError> {
        let handle =
            self.resources
                .lookup(name)
                .ok_or_else(|| FrameGraphError::WriteBeforeRead {
                    resource: name.to_string(),
                })?;
        let resource = self.resources.resource_mut(handle);
        check_declaration(resource, kind, format)?;

        resource.connect(self.graph, self.node)?;
        Ok(handle)
    }
}

fn check_declaration(
    resource: &FrameGraphResource,
    kind: ResourceKind,
    format: Format,
) -> Result<(), FrameGraphError> {
    if resource.kind() == kind && resource.format() == format {
        return Ok(());
    }
    Err(FrameGraphError::ConflictingDeclaration {
        resource: resource.name().to_string(),
        declared_kind: resource.kind(),
        declared_format: resource.format(),
        kind,
        format,
    })
}
