use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::concurrency::{WorkerPool, join_all};
use crate::error::{FrameGraphError, Phase};
use crate::gpu::{CommandList, CommandListHandle, DescriptorCache, GpuDevice};
use crate::render::draw::DrawHooks;
use crate::render::framegraph::pass::{
    Pass, PassContext, PreComputeContext, PrepareContext, RegisterContext,
};
use crate::render::framegraph::{
    DependencyGraph, FrameGraphBuilder, NodeId, PassRegistry, PassSettings, ResourceTable,
};
use crate::render::RenderSystem;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GraphState {
    Constructed,
    PreComputed,
    SetupDone,
    Compiled,
    Executed,
    Destroyed,
}

impl GraphState {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphState::Constructed => "constructed",
            GraphState::PreComputed => "pre-computed",
            GraphState::SetupDone => "set up",
            GraphState::Compiled => "compiled",
            GraphState::Executed => "executed",
            GraphState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type SharedPass = Arc<Mutex<Box<dyn Pass>>>;

struct FrameGraphNode {
    name: String,
    id: NodeId,
    pass: SharedPass,
}

/// Owns the passes and drives them through setup, culling, registration and
/// recording each frame.
pub struct FrameGraph {
    device: Arc<dyn GpuDevice>,
    registry: PassRegistry,
    settings: PassSettings,
    draw: Arc<DrawHooks>,
    pool: Option<Arc<WorkerPool>>,
    parallel_execute: bool,
    parallel_pre_compute: bool,

    graph: DependencyGraph,
    resources: ResourceTable,
    nodes: Vec<FrameGraphNode>,
    // Live nodes first, then culled, each in insertion order.
    order: Vec<NodeId>,
    live_count: usize,
    state: GraphState,
}

impl FrameGraph {
    pub fn new(device: Arc<dyn GpuDevice>, registry: PassRegistry) -> Self {
        Self {
            device,
            registry,
            settings: PassSettings::default(),
            draw: Arc::new(DrawHooks::default()),
            pool: None,
            parallel_execute: true,
            parallel_pre_compute: true,
            graph: DependencyGraph::default(),
            resources: ResourceTable::default(),
            nodes: Vec::new(),
            order: Vec::new(),
            live_count: 0,
            state: GraphState::Constructed,
        }
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_draw_hooks(mut self, draw: Arc<DrawHooks>) -> Self {
        self.draw = draw;
        self
    }

    pub fn with_settings(mut self, settings: PassSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Chooses between the worker pool and the render thread for each phase.
    /// Without a pool everything runs inline.
    pub fn with_parallelism(mut self, execute: bool, pre_compute: bool) -> Self {
        self.parallel_execute = execute;
        self.parallel_pre_compute = pre_compute;
        self
    }

    /// Passes can only be added before pre-compute or the first frame.
    pub fn add_pass(&mut self, name: &str) -> anyhow::Result<NodeId> {
        self.expect_state("add_pass", &[GraphState::Constructed])?;

        let pass = self
            .registry
            .create(name, self.device.as_ref(), &self.settings)
            .with_context(|| format!("failed to create pass '{name}'"))?;

        let id = self.graph.add_node();
        if pass.is_target() {
            self.graph.make_target(id)?;
        }
        log::trace!("Added pass '{}' as {}", name, id);

        self.nodes.push(FrameGraphNode {
            name: name.to_string(),
            id,
            pass: Arc::new(Mutex::new(pass)),
        });
        Ok(id)
    }

    /// Runs every pass's one-time work and waits for its uploads to land.
    /// Allowed once, before the first frame. A failed pre-compute is not
    /// retried.
    pub fn pre_compute(&mut self, renderer: &RenderSystem) -> anyhow::Result<()> {
        self.expect_state("pre_compute", &[GraphState::Constructed])?;
        crate::profile_scope!("pre_compute");
        self.state = GraphState::PreComputed;

        let mut tasks = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let cmd = self
                .device
                .create_command_list(&format!("{}:pre_compute", node.name))
                .with_context(|| format!("failed to create pre-compute list for {}", node.name))?;
            tasks.push((node.name.clone(), node.pass.clone(), cmd));
        }

        let device = self.device.clone();
        let run = move |pass: SharedPass,
                        mut cmd: Box<dyn CommandList>|
              -> anyhow::Result<Box<dyn CommandList>> {
            cmd.begin()?;
            pass.lock().pre_compute(&mut PreComputeContext {
                device: device.as_ref(),
                cmd: cmd.as_mut(),
            })?;
            cmd.end()?;
            Ok(cmd)
        };

        let results = match self.pool.as_ref().filter(|_| self.parallel_pre_compute) {
            Some(pool) => join_all(
                tasks
                    .into_iter()
                    .map(|(name, pass, cmd)| {
                        let run = run.clone();
                        pool.submit(name, move || run(pass, cmd))
                    })
                    .collect(),
            ),
            None => tasks
                .into_iter()
                .map(|(name, pass, cmd)| (name, run(pass, cmd)))
                .collect(),
        };

        let lists = collect_results(Phase::PreCompute, results)?;
        for cmd in &lists {
            renderer.submit(cmd.handle());
        }
        renderer
            .upload()
            .context("failed to upload pre-computed data")?;
        drop(lists);

        for node in &self.nodes {
            node.pass.lock().post_pre_compute();
        }
        log::debug!("Pre-computed {} passes", self.nodes.len());
        Ok(())
    }

    /// Rebuilds this frame's edges from each pass's declarations.
    pub fn setup(&mut self) -> anyhow::Result<()> {
        self.expect_state(
            "setup",
            &[
                GraphState::Constructed,
                GraphState::PreComputed,
                GraphState::Compiled,
                GraphState::Executed,
            ],
        )?;
        crate::profile_scope!("setup");

        self.graph.clear_edges();
        self.resources.begin_frame();

        for node in &self.nodes {
            let mut builder = FrameGraphBuilder::new(&mut self.graph, &mut self.resources, node.id);
            node.pass
                .lock()
                .setup(&mut builder)
                .with_context(|| format!("setup of pass '{}' failed", node.name))?;
        }

        self.state = GraphState::SetupDone;
        Ok(())
    }

    /// Culls, orders and registers. Only live passes get their resources
    /// backed.
    pub fn compile(&mut self, cache: &DescriptorCache) -> anyhow::Result<()> {
        self.expect_state("compile", &[GraphState::SetupDone])?;
        crate::profile_scope!("compile");

        self.graph.cull();
        if !self.graph.is_acyclic() {
            return Err(FrameGraphError::CyclicGraph.into());
        }

        let (live, culled): (Vec<NodeId>, Vec<NodeId>) = self
            .nodes
            .iter()
            .map(|node| node.id)
            .partition(|&id| !self.graph.is_culled(id));
        self.live_count = live.len();
        self.order = live;
        self.order.extend(culled);

        #[cfg(feature = "tracing")]
        tracy_client::plot!("live passes", self.live_count as f64);

        log::debug!("Execution order: {:?}", self.execution_order());
        let culled = self.culled_passes();
        if !culled.is_empty() {
            log::debug!("Culled: {:?}", culled);
        }

        for &id in &self.order[..self.live_count] {
            let node = &self.nodes[id.index()];
            let mut ctx = RegisterContext {
                device: self.device.as_ref(),
                cache,
                resources: &mut self.resources,
            };
            node.pass
                .lock()
                .register_resources(&mut ctx)
                .with_context(|| format!("failed to register resources of '{}'", node.name))?;
        }

        self.state = GraphState::Compiled;
        Ok(())
    }

    /// Records every live pass and hands the lists to `renderer` in
    /// execution order.
    pub fn execute(
        &mut self,
        cache: &DescriptorCache,
        renderer: &RenderSystem,
    ) -> anyhow::Result<()> {
        self.expect_state("execute", &[GraphState::Compiled])?;
        crate::profile_scope!("execute");

        self.device
            .reset_command_allocator()
            .context("failed to reset command allocator")?;
        let frame_index = self.device.frame_index();

        // Views and barriers are taken in execution order so each pass's list
        // starts from the state the previous pass left behind.
        for &id in &self.order[..self.live_count] {
            let node = &self.nodes[id.index()];
            let mut ctx = PrepareContext {
                device: self.device.as_ref(),
                cache,
                resources: &mut self.resources,
                frame_index,
            };
            node.pass
                .lock()
                .prepare(&mut ctx)
                .with_context(|| format!("failed to prepare '{}'", node.name))?;
            self.resources.end_pass();
        }

        let ctx = PassContext {
            device: self.device.clone(),
            draw: self.draw.clone(),
            frame_index,
            extent: self.device.extent(),
        };
        let live = self.order[..self.live_count]
            .iter()
            .map(|id| &self.nodes[id.index()]);

        let results = match self.pool.as_ref().filter(|_| self.parallel_execute) {
            Some(pool) => join_all(
                live.map(|node| {
                    let pass = node.pass.clone();
                    let ctx = ctx.clone();
                    pool.submit(node.name.clone(), move || pass.lock().execute(&ctx))
                })
                .collect(),
            ),
            None => live
                .map(|node| (node.name.clone(), node.pass.lock().execute(&ctx)))
                .collect(),
        };

        let lists: Vec<CommandListHandle> = collect_results(Phase::Execute, results)?
            .into_iter()
            .flatten()
            .collect();
        for &list in &lists {
            renderer.submit(list);
        }
        renderer.render().context("failed to render frame")?;

        log::trace!("Frame {} submitted {} lists", frame_index, lists.len());
        self.state = GraphState::Executed;
        Ok(())
    }

    /// One full frame: fresh descriptors, setup, compile, execute.
    pub fn render_frame(
        &mut self,
        cache: &DescriptorCache,
        renderer: &RenderSystem,
    ) -> anyhow::Result<()> {
        cache.reset();
        self.setup()?;
        self.compile(cache)?;
        self.execute(cache, renderer)
    }

    /// Releases every pass and resource. The graph cannot be used afterwards.
    pub fn destroy(&mut self) {
        for node in &self.nodes {
            node.pass.lock().destroy(self.device.as_ref());
        }
        self.resources.destroy(self.device.as_ref());
        self.nodes.clear();
        self.graph = DependencyGraph::default();
        self.order.clear();
        self.live_count = 0;
        self.state = GraphState::Destroyed;
        log::debug!("Frame graph destroyed");
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn pass_count(&self) -> usize {
        self.nodes.len()
    }

    /// Live pass names in the order they record and submit.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order[..self.live_count]
            .iter()
            .map(|id| self.nodes[id.index()].name.as_str())
            .collect()
    }

    pub fn culled_passes(&self) -> Vec<&str> {
        self.order[self.live_count..]
            .iter()
            .map(|id| self.nodes[id.index()].name.as_str())
            .collect()
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| node.id)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[GraphState],
    ) -> Result<(), FrameGraphError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> FrameGraphError {
        FrameGraphError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }
}

/// Fan-in: keeps the successes in order, or names every pass that failed.
fn collect_results<T>(
    phase: Phase,
    results: Vec<(String, anyhow::Result<T>)>,
) -> anyhow::Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (name, result) in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => {
                log::error!("{} of pass '{}' failed: {:?}", phase, name, err);
                failed.push(name);
            }
        }
    }

    if failed.is_empty() {
        Ok(values)
    } else {
        Err(FrameGraphError::PassExecution {
            phase,
            passes: failed,
        }
        .into())
    }
}
