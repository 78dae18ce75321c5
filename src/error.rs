use std::fmt;

use thiserror::Error;

use crate::gpu::{DescriptorHeap, Format};
use crate::render::framegraph::{NodeId, ResourceKind};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    PreCompute,
    Execute,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PreCompute => f.write_str("pre-compute"),
            Phase::Execute => f.write_str("execute"),
        }
    }
}

/// Authoring and scheduling failures raised by the frame graph.
#[derive(Debug, Error)]
pub enum FrameGraphError {
    #[error("no pass named '{0}' is registered")]
    UnknownPass(String),

    #[error("node {0} does not belong to this graph")]
    UnknownNode(NodeId),

    #[error("'{resource}' must be written before it is read")]
    WriteBeforeRead { resource: String },

    #[error("'{resource}' is already produced by node {producer}; node {writer} cannot write it too")]
    MultipleProducers {
        resource: String,
        producer: NodeId,
        writer: NodeId,
    },

    #[error(
        "'{resource}' declared as {declared_kind:?}/{declared_format:?} but used as {kind:?}/{format:?}"
    )]
    ConflictingDeclaration {
        resource: String,
        declared_kind: ResourceKind,
        declared_format: Format,
        kind: ResourceKind,
        format: Format,
    },

    #[error("the frame graph contains a cycle")]
    CyclicGraph,

    #[error("'{resource}' has no backing texture; register it before requesting views")]
    Unregistered { resource: String },

    #[error("'{resource}' is bound as read-only depth and cannot be sampled")]
    EarlyZRead { resource: String },

    #[error("'{resource}' is a {kind:?} resource and has no {view} view")]
    WrongKind {
        resource: String,
        kind: ResourceKind,
        view: &'static str,
    },

    #[error("{phase} failed for: {}", passes.join(", "))]
    PassExecution { phase: Phase, passes: Vec<String> },

    #[error("{heap:?} descriptor cache exhausted ({capacity} entries)")]
    DescriptorCacheExhausted { heap: DescriptorHeap, capacity: u32 },

    #[error("cannot {operation} while the frame graph is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}
