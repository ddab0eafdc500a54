//! Worker threads that execute compiled graphs.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use cadenza_rt::{spawn_rt_thread, AudioMetricsCollector};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::compiled::{CompiledGraph, CycleParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Worker thread count. `None` uses the number of available cores.
    /// `Some(0)` processes every node on the callback thread.
    pub workers: Option<usize>,
    /// `SCHED_FIFO` priority requested for workers.
    pub rt_priority: Option<i32>,
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn serial() -> Self {
        Self {
            workers: Some(0),
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    fn resolved_workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            rt_priority: Some(70),
            queue_capacity: 4096,
        }
    }
}

/// Result of driving one pass from the audio callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every node ran and the terminal outputs are valid.
    Completed,
    /// The deadline passed before the pass finished. It may still be running
    /// on the workers and the caller must output silence.
    TimedOut,
    /// The previous pass was still in flight, so this one never started.
    Busy,
}

enum Job {
    Run(Arc<CompiledGraph>, usize),
    Shutdown,
}

pub struct GraphThreadPool {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    metrics: AudioMetricsCollector,
}

impl GraphThreadPool {
    /// Spawns the workers. They live until the pool is dropped.
    pub fn new(config: PoolConfig, metrics: AudioMetricsCollector) -> io::Result<Self> {
        let (sender, receiver) = bounded(config.queue_capacity.max(16));
        let count = config.resolved_workers();
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let sender = sender.clone();
            let receiver = receiver.clone();
            let metrics = metrics.clone();
            let handle = spawn_rt_thread(
                format!("cadenza-graph-{index}"),
                config.rt_priority,
                move || worker_loop(receiver, sender, metrics),
            )?;
            workers.push(handle);
        }
        tracing::info!(workers = count, "graph thread pool started");
        Ok(Self {
            sender,
            receiver,
            workers,
            metrics,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn metrics(&self) -> &AudioMetricsCollector {
        &self.metrics
    }

    /// Runs one pass of `graph` and returns once it has completed or the
    /// deadline has passed. The calling thread never blocks.
    pub fn run_cycle(
        &self,
        graph: &Arc<CompiledGraph>,
        params: CycleParams,
        deadline: Instant,
    ) -> CycleOutcome {
        if graph.is_running() {
            self.help_until(deadline, graph);
            return CycleOutcome::Busy;
        }
        if !graph.begin_cycle(params) {
            return CycleOutcome::Busy;
        }
        for &root in graph.roots() {
            self.dispatch(graph, root);
        }
        if self.help_until(deadline, graph) {
            CycleOutcome::Completed
        } else {
            CycleOutcome::TimedOut
        }
    }

    fn dispatch(&self, graph: &Arc<CompiledGraph>, node: usize) {
        match self.sender.try_send(Job::Run(Arc::clone(graph), node)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                execute(graph, node, &self.sender, &self.metrics);
            }
        }
    }

    /// Drains ready nodes on the calling thread until the pass finishes or
    /// the deadline passes. A pass that finishes after the deadline still
    /// counts as missed.
    fn help_until(&self, deadline: Instant, graph: &CompiledGraph) -> bool {
        loop {
            let late = Instant::now() >= deadline;
            if !graph.is_running() {
                return !late;
            }
            if late {
                return false;
            }
            match self.receiver.try_recv() {
                Ok(Job::Run(job_graph, node)) => {
                    execute(&job_graph, node, &self.sender, &self.metrics);
                }
                Ok(Job::Shutdown) => {
                    // Meant for a worker.
                    let _ = self.sender.try_send(Job::Shutdown);
                    std::thread::yield_now();
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl Drop for GraphThreadPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Job::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("graph worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(receiver: Receiver<Job>, sender: Sender<Job>, metrics: AudioMetricsCollector) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Run(graph, node) => execute(&graph, node, &sender, &metrics),
            Job::Shutdown => break,
        }
    }
}

/// Runs `first` and keeps going with one ready successor on the same thread;
/// further ready successors are queued for other threads.
fn execute(
    graph: &Arc<CompiledGraph>,
    first: usize,
    sender: &Sender<Job>,
    metrics: &AudioMetricsCollector,
) {
    let mut next = Some(first);
    while let Some(node) = next.take() {
        // Safety: `node` was handed out exactly once, after all of its
        // predecessors completed.
        unsafe { graph.run_node(node, metrics) };
        graph.complete_node(node, &mut |ready| {
            if next.is_none() {
                next = Some(ready);
            } else if sender
                .try_send(Job::Run(Arc::clone(graph), ready))
                .is_err()
            {
                execute(graph, ready, sender, metrics);
            }
        });
    }
}
