//! Checkpoint & Recovery Controller
//!
//! Owns the durable state and threads it through every operation. A commit
//! happens at each safe point (sample start, slot normalization, operation
//! end, sample end), so after any reset the newest commit record names the
//! next operation to run and the polarity map of every slot as of that point.

use super::commit::{CommitLog, DurableState};
use super::types::{BootKind, BootOptions, Phase, Step};
use crate::config::RecoveryMode;
use crate::errors::{EngineError, Result};
use crate::layout::{Counters, ImageHeader, NvmLayout, RunState, TensorDescriptor};
use crate::model::{image, ModelGraph};
use crate::observability::{CompletionSink, SampleReport};
use crate::ops::{self, ExecEnv, OpContext};
use crate::recovery::{strategy_for, RecoveryStrategy};
use crate::storage::{self, DurableStorage};
use crate::tensor::{read_tensor, Tensor};
use tracing::{debug, info, warn};

pub struct Controller<S: DurableStorage> {
    storage: S,
    graph: ModelGraph,
    layout: NvmLayout,
    strategy: Box<dyn RecoveryStrategy>,
    log: CommitLog,
    state: DurableState,
    counters: Counters,
    phase: Phase,
}

impl<S: DurableStorage> Controller<S> {
    /// Bring the engine up on `storage`.
    ///
    /// Runs the storage self-test, checks the installed image against `graph`,
    /// then either initializes fresh durable state (first run) or loads and
    /// reconciles the newest commit record.
    pub fn boot(mut storage: S, graph: ModelGraph, options: BootOptions) -> Result<(Self, BootKind)> {
        info!(model = %graph.name, mode = %options.mode, "Cold boot");
        storage::self_test(&mut storage, options.self_test_retries)?;
        let layout = graph.layout(storage.capacity())?;
        image::verify(&mut storage, &graph, &layout, options.mode)?;

        let log = CommitLog::new(&layout);
        let state = DurableState::new(graph.nodes_len(), graph.n_input(), layout.num_slots);
        let mut controller = Self {
            storage,
            graph,
            layout,
            strategy: strategy_for(options.mode),
            log,
            state,
            counters: Counters::default(),
            phase: Phase::ColdBoot,
        };
        controller.counters = image::read_counters(&mut controller.storage, &controller.layout)?;

        let kind = if image::first_run_pending(&mut controller.storage, &controller.layout)? {
            controller.first_run()?;
            BootKind::FirstRun
        } else {
            controller.resume()?
        };
        controller.phase = Phase::Running;
        Ok((controller, kind))
    }

    fn first_run(&mut self) -> Result<()> {
        self.phase = Phase::FirstRun;
        info!(slots = self.layout.num_slots, "First run, creating durable state");
        self.state = DurableState::new(
            self.graph.nodes_len(),
            self.graph.n_input(),
            self.layout.num_slots,
        );
        self.log.invalidate(&mut self.storage)?;
        self.log.commit(&mut self.storage, &self.state)?;
        self.counters = Counters::default();
        image::write_counters(&mut self.storage, &self.layout, &self.counters)?;
        // cleared last: a reset before this point repeats the first run
        image::clear_first_run(&mut self.storage, &self.layout)
    }

    fn resume(&mut self) -> Result<BootKind> {
        self.phase = Phase::Resuming;
        let mut state = self.log.load(&mut self.storage)?.ok_or_else(|| {
            EngineError::Corrupt("no valid commit record; `reset` starts over".to_string())
        })?;

        let rs = &state.run_state;
        if rs.nodes_len != self.graph.nodes_len()
            || rs.n_input != self.graph.n_input()
            || rs.layer_idx > rs.nodes_len
            || rs.sample_idx >= self.graph.n_samples()
        {
            return Err(EngineError::Corrupt(format!(
                "commit record at layer {} / sample {} does not fit the model",
                rs.layer_idx, rs.sample_idx
            )));
        }

        let mut reconciled = Vec::new();
        for (s, info) in state.slots.iter_mut().enumerate() {
            let bit = state.run_state.state_bits[s];
            if info.state_bit != bit {
                warn!(
                    slot = s,
                    run_state_bit = bit,
                    slot_info_bit = info.state_bit,
                    "Slot polarity disagrees with run state, slot will be recomputed"
                );
                info.state_bit = bit;
                info.turning_points.clear();
                info.untrusted = true;
                reconciled.push(s as u8);
            }
        }

        let interrupted = state.run_state.running;
        if interrupted {
            state.run_state.recovery = true;
            self.counters.power_cycles = self.counters.power_cycles.saturating_add(1);
        }
        self.state = state;
        if interrupted || !reconciled.is_empty() {
            self.log.commit(&mut self.storage, &self.state)?;
        }
        if interrupted {
            self.flush_counters();
        }

        let rs = &self.state.run_state;
        info!(
            layer_idx = rs.layer_idx,
            last_committed_layer = ?rs.last_committed_layer(),
            sample_idx = rs.sample_idx,
            run_counter = rs.run_counter,
            interrupted,
            "Resuming from commit record"
        );
        Ok(BootKind::Resumed {
            layer_idx: rs.layer_idx,
            sample_idx: rs.sample_idx,
            interrupted,
            reconciled,
        })
    }

    /// Execute the next operation, or finish the sample when none is left.
    pub fn step(&mut self) -> Result<Step> {
        let k = self.state.run_state.layer_idx;
        if k >= self.graph.nodes_len() {
            return self.finish_sample().map(Step::Sample);
        }
        self.phase = Phase::Running;

        if !self.state.run_state.running {
            self.state.run_state.running = true;
            self.state.run_state.recovery = false;
            self.log.commit(&mut self.storage, &self.state)?;
            debug!(sample_idx = self.state.run_state.sample_idx, "Sample started");
        }

        let node = &self.graph.nodes[k as usize];
        let (kind, flags) = (node.kind, node.flags);
        let op = ops::spec(kind);
        if op.inplace_update {
            debug!(layer = k, node = %node.name, op = %kind, "View committed without compute");
            self.advance(k)?;
            return Ok(Step::Layer {
                layer: k,
                computed: 0,
                skipped: 0,
            });
        }

        let output = self.graph.outputs[k as usize];
        let slot = output.slot.intermediate().ok_or_else(|| {
            EngineError::Invariant(format!("layer {} output has no slot", k))
        })?;
        let s = slot as usize;
        let region = self.layout.slot(slot);

        if self.strategy.needs_normalize(&self.state.slots[s]) {
            self.strategy
                .normalize(&mut self.storage, region, &mut self.state.slots[s])?;
            self.state.run_state.state_bits[s] = self.state.slots[s].state_bit;
            self.log.commit(&mut self.storage, &self.state)?;
            self.counters.fallbacks = self.counters.fallbacks.saturating_add(1);
            info!(slot, layer = k, "Slot normalized, operation computes from scratch");
        }

        let resume = self
            .strategy
            .progress(&mut self.storage, region, &output, &self.state.slots[s])?;
        if resume > 0 {
            info!(
                layer = k,
                resume,
                total = output.element_count(),
                "Continuing interrupted operation"
            );
        }

        let inputs = self.graph.inputs_of(k as usize);
        let env = ExecEnv {
            storage: &mut self.storage,
            layout: &self.layout,
            strategy: self.strategy.as_ref(),
            log: &mut self.log,
            state: &mut self.state,
        };
        let sample_idx = env.state.run_state.sample_idx;
        let mut ctx = OpContext::new(env, sample_idx, output, resume)?;
        (op.handler)(&mut ctx, &inputs, &output, flags)?;
        let summary = ctx.finish()?;

        self.strategy
            .complete(&mut self.state.slots[s], summary.written, region);
        self.state.run_state.state_bits[s] = self.state.slots[s].state_bit;
        self.advance(k)?;

        self.counters.elements_computed = self.counters.elements_computed.saturating_add(summary.computed);
        self.counters.elements_skipped = self.counters.elements_skipped.saturating_add(summary.skipped);
        debug!(
            layer = k,
            op = %kind,
            slot,
            computed = summary.computed,
            skipped = summary.skipped,
            "Operation committed"
        );
        Ok(Step::Layer {
            layer: k,
            computed: summary.computed,
            skipped: summary.skipped,
        })
    }

    fn advance(&mut self, k: u16) -> Result<()> {
        self.state.run_state.layer_idx = k + 1;
        self.log.commit(&mut self.storage, &self.state)
    }

    fn finish_sample(&mut self) -> Result<SampleReport> {
        self.phase = Phase::SampleDone;
        let sample_idx = self.state.run_state.sample_idx;
        let output = self.read_descriptor(&self.graph.final_output())?;
        let predicted = output.argmax().unwrap_or(0);
        let label = image::read_label(&mut self.storage, &self.layout, sample_idx)?;
        let recovered = self.state.run_state.recovery;

        let rs = &mut self.state.run_state;
        rs.layer_idx = 0;
        rs.sample_idx = (sample_idx + 1) % self.graph.n_samples();
        rs.run_counter = rs.run_counter.wrapping_add(1);
        rs.running = false;
        rs.recovery = false;
        let run_counter = rs.run_counter;
        self.log.commit(&mut self.storage, &self.state)?;

        self.counters.samples_completed = self.counters.samples_completed.saturating_add(1);
        self.flush_counters();
        info!(
            sample = sample_idx,
            run_counter,
            predicted,
            label = ?label,
            recovered,
            "Sample committed"
        );
        self.phase = Phase::Running;
        Ok(SampleReport {
            sample_idx,
            run_counter,
            predicted,
            scores: output.values,
            label,
            recovered,
        })
    }

    /// Counters are diagnostics; a failed flush never fails the caller.
    fn flush_counters(&mut self) {
        if let Err(e) = image::write_counters(&mut self.storage, &self.layout, &self.counters) {
            warn!(error = %e, "Failed to flush counters");
        }
    }

    /// Run until `count` samples have committed, telling `sink` about each.
    pub fn run_samples(&mut self, count: usize, sink: &mut dyn CompletionSink) -> Result<usize> {
        let mut done = 0;
        while done < count {
            if let Step::Sample(report) = self.step()? {
                sink.sample_finished(&report);
                done += 1;
            }
        }
        Ok(done)
    }

    fn read_descriptor(&mut self, desc: &TensorDescriptor) -> Result<Tensor> {
        read_tensor(
            &mut self.storage,
            &self.layout,
            desc,
            self.state.run_state.sample_idx,
        )
    }

    /// Current contents of layer `layer`'s output.
    pub fn read_output(&mut self, layer: usize) -> Result<Tensor> {
        let desc = self.output_of(layer)?;
        self.read_descriptor(&desc)
    }

    /// Whether element `idx` of layer `layer`'s output holds committed data.
    pub fn is_fresh(&mut self, layer: usize, idx: u32) -> Result<bool> {
        let desc = self.output_of(layer)?;
        let slot = desc.slot.intermediate().ok_or_else(|| {
            EngineError::Validation(format!("layer {} output is not an intermediate", layer))
        })?;
        self.strategy.is_fresh(
            &mut self.storage,
            self.layout.slot(slot),
            &desc,
            &self.state.slots[slot as usize],
            idx,
        )
    }

    fn output_of(&self, layer: usize) -> Result<TensorDescriptor> {
        self.graph.outputs.get(layer).copied().ok_or_else(|| {
            EngineError::Validation(format!(
                "layer {} out of range, model has {}",
                layer,
                self.graph.nodes.len()
            ))
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mode(&self) -> RecoveryMode {
        self.strategy.mode()
    }

    pub fn state(&self) -> &DurableState {
        &self.state
    }

    pub fn run_state(&self) -> &RunState {
        &self.state.run_state
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    pub fn layout(&self) -> &NvmLayout {
        &self.layout
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

/// Durable state as found on NVM, read without booting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub header: Option<ImageHeader>,
    pub first_run_pending: bool,
    pub state: Option<DurableState>,
    pub sequence: u32,
    pub counters: Counters,
}

/// Read-only look at the control region for `status`.
pub fn inspect(storage: &mut dyn DurableStorage, graph: &ModelGraph) -> Result<Snapshot> {
    let layout = graph.layout(storage.capacity())?;
    let header = image::read_header(storage, &layout)?;
    let mut log = CommitLog::new(&layout);
    let state = log.load(storage)?;
    Ok(Snapshot {
        header,
        first_run_pending: image::first_run_pending(storage, &layout)?,
        state,
        sequence: log.sequence(),
        counters: image::read_counters(storage, &layout)?,
    })
}
