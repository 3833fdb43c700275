//! Per-master chain iterator.
//!
//! Drives the subtree of one top-level master through
//! `prepare -> start -> (wait_ready, next_step) -> prepare -> ...` until the
//! master reports [`Step::Done`], and finally `stop`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use daq_core::{
    AcqCall, AcqContext, AcquisitionObject, DaqError, DaqResult, EventSink, ObjectState,
    ScanStatistics, Signal, SlaveHandle, Step,
};
use futures::future::{join_all, try_join_all};
use tracing::{debug, instrument, trace};

/// One object of the subtree in breadth-first order.
pub(crate) struct IterNode {
    pub(crate) object: Arc<dyn AcquisitionObject>,
    pub(crate) depth: usize,
    /// Positions of the direct children in the iterator's node list
    pub(crate) children: Vec<usize>,
}

/// Iteration driver for one top-level master and its subtree.
pub struct ChainIterator {
    nodes: Vec<IterNode>,
    levels: Vec<Vec<usize>>,
    contexts: Vec<AcqContext>,
    iteration: Arc<AtomicUsize>,
    sink: Option<Arc<dyn EventSink>>,
    stats: Option<Arc<ScanStatistics>>,
    ended: AtomicBool,
}

impl ChainIterator {
    pub(crate) fn new(nodes: Vec<IterNode>) -> Self {
        let depth = nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        let mut levels = vec![Vec::new(); depth + 1];
        for (pos, node) in nodes.iter().enumerate() {
            levels[node.depth].push(pos);
        }
        let mut iterator = Self {
            nodes,
            levels,
            contexts: Vec::new(),
            iteration: Arc::new(AtomicUsize::new(0)),
            sink: None,
            stats: None,
            ended: AtomicBool::new(false),
        };
        iterator.build_contexts();
        iterator
    }

    /// Route device signals to `sink` and profile calls into `stats`.
    pub fn with_events(
        mut self,
        sink: Arc<dyn EventSink>,
        stats: Arc<ScanStatistics>,
    ) -> Self {
        self.sink = Some(sink);
        self.stats = Some(stats);
        self.build_contexts();
        self
    }

    // Children sit after their parent in breadth-first order, so building
    // from the back gives every node its children's finished contexts.
    fn build_contexts(&mut self) {
        let mut contexts: Vec<Option<AcqContext>> = vec![None; self.nodes.len()];
        for pos in (0..self.nodes.len()).rev() {
            let slaves = self.nodes[pos]
                .children
                .iter()
                .filter_map(|&child| {
                    contexts[child].clone().map(|ctx| SlaveHandle {
                        object: self.nodes[child].object.clone(),
                        ctx,
                    })
                })
                .collect();
            contexts[pos] = Some(AcqContext::new(
                self.iteration.clone(),
                slaves,
                self.sink.clone(),
                self.stats.clone(),
            ));
        }
        self.contexts = contexts.into_iter().flatten().collect();
    }

    /// Top-level master of this branch.
    pub fn master(&self) -> &Arc<dyn AcquisitionObject> {
        &self.nodes[0].object
    }

    /// Name of the top-level master.
    pub fn name(&self) -> &str {
        self.nodes[0].object.name()
    }

    /// Whether this branch finishing ends the START phase.
    pub fn is_terminator(&self) -> bool {
        self.master().options().terminator
    }

    /// Zero-based index of the current iteration.
    pub fn iteration(&self) -> usize {
        self.iteration.load(Ordering::Acquire)
    }

    /// Objects of the branch, master first.
    pub fn objects(&self) -> Vec<Arc<dyn AcquisitionObject>> {
        self.nodes.iter().map(|n| n.object.clone()).collect()
    }

    async fn profiled<T, F>(&self, pos: usize, call: AcqCall, fut: F) -> DaqResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let name = self.nodes[pos].object.name();
        trace!(object = name, %call, iteration = self.iteration(), "call");
        let out = match &self.stats {
            Some(stats) => stats.profile(name, call, fut).await,
            None => fut.await,
        };
        out.map_err(|e| DaqError::hardware(name, call, e))
    }

    async fn signal(&self, pos: usize, signal: Signal) -> DaqResult<()> {
        match &self.sink {
            Some(sink) => {
                sink.device_signal(self.nodes[pos].object.name(), signal)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn prepare_one(&self, pos: usize) -> DaqResult<()> {
        let object = &self.nodes[pos].object;
        self.profiled(pos, AcqCall::Prepare, object.prepare(&self.contexts[pos]))
            .await
    }

    async fn start_one(&self, pos: usize) -> DaqResult<()> {
        let object = &self.nodes[pos].object;
        self.signal(pos, Signal::Start).await?;
        self.profiled(pos, AcqCall::Start, object.start(&self.contexts[pos]))
            .await
    }

    /// Prepare the branch for the current iteration, leaves first.
    ///
    /// Objects flagged `prepare_once` are only prepared on iteration 0. A
    /// master flagged `parallel_prepare` prepares every level at once.
    #[instrument(skip(self), fields(master = %self.name(), iteration = self.iteration()))]
    pub async fn prepare(&self) -> DaqResult<()> {
        let index = self.iteration();
        if index == 0 {
            for (pos, node) in self.nodes.iter().enumerate() {
                if let ObjectState::Fault(reason) = node.object.state() {
                    return Err(DaqError::hardware(
                        self.nodes[pos].object.name(),
                        AcqCall::Prepare,
                        anyhow!("object is in fault state: {}", reason),
                    ));
                }
            }
        }

        let selected =
            |pos: &usize| index == 0 || !self.nodes[*pos].object.options().prepare_once;

        if self.master().options().parallel_prepare {
            let all = (0..self.nodes.len()).filter(selected);
            try_join_all(all.map(|pos| self.prepare_one(pos))).await?;
        } else {
            for level in self.levels.iter().rev() {
                let calls = level
                    .iter()
                    .filter(|&&pos| selected(&pos))
                    .map(|&pos| self.prepare_one(pos));
                try_join_all(calls).await?;
            }
        }
        Ok(())
    }

    /// Start the branch for the current iteration, leaves first.
    #[instrument(skip(self), fields(master = %self.name(), iteration = self.iteration()))]
    pub async fn start(&self) -> DaqResult<()> {
        let index = self.iteration();
        for level in self.levels.iter().rev() {
            let calls = level
                .iter()
                .filter(|&&pos| index == 0 || !self.nodes[pos].object.options().start_once)
                .map(|&pos| self.start_one(pos));
            try_join_all(calls).await?;
        }
        Ok(())
    }

    /// Wait for the current step and advance every object, master first.
    ///
    /// Returns [`Step::Done`] once the top-level master is exhausted; by then
    /// the end signals of the branch have been delivered.
    pub async fn advance(&self) -> DaqResult<Step> {
        for level in &self.levels {
            let waits = level.iter().map(|&pos| {
                self.profiled(pos, AcqCall::WaitReady, self.nodes[pos].object.wait_ready())
            });
            try_join_all(waits).await?;
        }

        let master_step = self
            .profiled(0, AcqCall::Step, self.nodes[0].object.next_step())
            .await?;
        if master_step == Step::Done {
            debug!(master = %self.name(), iterations = self.iteration() + 1, "branch exhausted");
            self.finish().await?;
            return Ok(Step::Done);
        }

        for level in self.levels.iter().skip(1) {
            for &pos in level {
                let object = &self.nodes[pos].object;
                let step = self.profiled(pos, AcqCall::Step, object.next_step()).await?;
                if step == Step::Done {
                    self.profiled(pos, AcqCall::Rewind, object.rewind()).await?;
                }
            }
        }

        self.iteration.fetch_add(1, Ordering::AcqRel);
        Ok(Step::Next)
    }

    /// Deliver the `end` signal of every object once.
    pub async fn finish(&self) -> DaqResult<()> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for pos in 0..self.nodes.len() {
            self.signal(pos, Signal::End).await?;
        }
        Ok(())
    }

    /// Whether the end signals were delivered.
    pub fn is_finished(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Run the branch from the START phase until the master is exhausted.
    ///
    /// The first iteration must have been prepared already.
    pub async fn run(&self) -> DaqResult<()> {
        loop {
            self.start().await?;
            if self.advance().await? == Step::Done {
                return Ok(());
            }
            self.prepare().await?;
        }
    }

    /// Stop every object, master first, and collect failures.
    ///
    /// All objects are stopped even when some fail.
    #[instrument(skip(self), fields(master = %self.name()))]
    pub async fn stop(&self) -> Vec<DaqError> {
        let mut errors = Vec::new();
        for level in &self.levels {
            let stops = level
                .iter()
                .map(|&pos| self.profiled(pos, AcqCall::Stop, self.nodes[pos].object.stop()));
            errors.extend(join_all(stops).await.into_iter().filter_map(Result::err));
        }
        if let Err(e) = self.finish().await {
            errors.push(e);
        }
        errors
    }
}

impl std::fmt::Debug for ChainIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainIterator")
            .field("master", &self.name())
            .field("objects", &self.nodes.len())
            .field("iteration", &self.iteration())
            .finish()
    }
}
