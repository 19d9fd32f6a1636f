use crate::{PipelineError, Stage, SyncContext};
use stagedsync_db::{Env, TxnManager};
use tracing::{debug, error, info, warn};

/// The staged sync driver.
///
/// Executes the queued [stages][Stage] serially in ordinal order. When a
/// stage runs, it processes everything between its own watermark and its
/// predecessor's, commits, and hands control back. After a full pass the
/// driver runs again until the context is marked done or a stop is
/// requested.
///
/// When an unwind height has been signalled, stages are rolled back in
/// reverse ordinal order before the next forward pass. Stages that implement
/// pruning are given a chance to drop history after every forward pass.
pub struct SyncDriver {
    stages: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDriver").field("stages", &self.stages.len()).finish()
    }
}

impl Default for SyncDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDriver {
    /// Creates a driver with no stages.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Adds a stage, keeping the list ordered by ordinal.
    ///
    /// # Panics
    ///
    /// Panics if the ordinal is zero or already taken: the stage set is fixed
    /// at startup and a duplicate is a programming error.
    pub fn push<S: Stage + 'static>(mut self, stage: S) -> Self {
        assert!(stage.ordinal() > 0, "stage ordinal must be greater than zero");
        assert!(
            self.stages.iter().all(|queued| queued.ordinal() != stage.ordinal()),
            "duplicate stage ordinal {}",
            stage.ordinal(),
        );
        self.stages.push(Box::new(stage));
        self.stages.sort_by_key(|stage| stage.ordinal());
        self
    }

    /// Runs sync cycles until the context is marked done, a stop is
    /// requested, or a cycle fails.
    pub fn run(&mut self, env: &Env, ctx: &mut SyncContext) -> Result<(), PipelineError> {
        while !ctx.is_done() && !ctx.is_stopping() {
            self.run_cycle(env, ctx)?;
            ctx.clear_first_cycle();
        }
        Ok(())
    }

    /// Runs a single cycle: a pending unwind if one was signalled, then the
    /// forward pass, then pruning.
    pub fn run_cycle(&mut self, env: &Env, ctx: &mut SyncContext) -> Result<(), PipelineError> {
        let result = self.cycle_inner(env, ctx);
        // watermarks cached during the cycle must not outlive it
        ctx.clear_cache();
        result
    }

    fn cycle_inner(&mut self, env: &Env, ctx: &mut SyncContext) -> Result<(), PipelineError> {
        if ctx.unwind_height().is_some() {
            self.unwind(env, ctx)?;
        }

        // Forward pass, ascending ordinal order. Stages commit internally;
        // the first failure terminates the cycle.
        for stage in self.stages.iter_mut() {
            let id = stage.id();
            if stage.is_disabled() {
                debug!(target: "sync::pipeline", stage = %id, "Stage disabled, skipping");
                continue
            }
            if ctx.is_stopping() {
                return Ok(())
            }

            info!(target: "sync::pipeline", stage = %id, "Running stage");
            let mut txn = TxnManager::new(env)?;
            if let Err(err) = stage.forward(&mut txn, ctx) {
                error!(target: "sync::pipeline", stage = %id, %err, code = ?err.code(), "Stage failed");
                return Err(PipelineError::Stage { stage: id, source: err })
            }
        }

        self.prune(env, ctx)
    }

    /// Rolls stages back to the signalled unwind height, in reverse ordinal
    /// order, skipping stages already at or below it. The signal is cleared
    /// once every stage completed.
    fn unwind(&mut self, env: &Env, ctx: &mut SyncContext) -> Result<(), PipelineError> {
        let height = match ctx.unwind_height() {
            Some(height) => height,
            None => return Ok(()),
        };
        info!(target: "sync::pipeline", %height, "Unwinding");

        let mut txn = TxnManager::new(env)?;
        for stage in self.stages.iter_mut().rev() {
            let id = stage.id();
            if stage.is_disabled() {
                continue
            }
            let progress = ctx.get_progress(&txn, id)?;
            if progress <= height {
                debug!(target: "sync::pipeline", stage = %id, %progress, "Nothing to unwind");
                continue
            }

            info!(target: "sync::pipeline", stage = %id, from = %progress, to = %height, "Unwinding stage");
            if let Err(err) = stage.unwind(&mut txn, ctx) {
                error!(target: "sync::pipeline", stage = %id, %err, "Unwind failed");
                return Err(PipelineError::Stage { stage: id, source: err })
            }
        }
        ctx.set_unwind_height(None);
        Ok(())
    }

    /// Invokes pruning on every stage that implements it, ascending ordinal
    /// order. A failing stage does not prevent later stages from pruning;
    /// the first failure is surfaced once the pass completed.
    fn prune(&mut self, env: &Env, ctx: &mut SyncContext) -> Result<(), PipelineError> {
        let mut first_failure = None;
        for stage in self.stages.iter_mut() {
            let id = stage.id();
            if stage.is_disabled() || !stage.has_pruning() {
                continue
            }

            debug!(target: "sync::pipeline", stage = %id, "Pruning stage");
            let mut txn = TxnManager::new(env)?;
            if let Err(err) = stage.prune(&mut txn, ctx) {
                warn!(target: "sync::pipeline", stage = %id, %err, "Prune failed");
                if first_failure.is_none() {
                    first_failure = Some(PipelineError::Stage { stage: id, source: err });
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::TestEnv, StageError, StageResult};
    use assert_matches::assert_matches;
    use stagedsync_db::TxnManager;
    use stagedsync_primitives::{BlockNumber, StageId};
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    /// Records which operations ran, in order, across all test stages.
    type OpLog = Arc<Mutex<Vec<(&'static str, &'static str)>>>;

    struct TestStage {
        id: StageId,
        ordinal: u32,
        disabled: bool,
        has_pruning: bool,
        target: BlockNumber,
        forward_results: VecDeque<StageResult>,
        prune_results: VecDeque<StageResult>,
        log: OpLog,
    }

    impl TestStage {
        fn new(id: StageId, ordinal: u32, log: OpLog) -> Self {
            Self {
                id,
                ordinal,
                disabled: false,
                has_pruning: false,
                target: 10,
                forward_results: VecDeque::new(),
                prune_results: VecDeque::new(),
                log,
            }
        }

        fn disabled(mut self) -> Self {
            self.disabled = true;
            self
        }

        fn with_pruning(mut self, result: StageResult) -> Self {
            self.has_pruning = true;
            self.prune_results.push_back(result);
            self
        }

        fn add_forward(mut self, result: StageResult) -> Self {
            self.forward_results.push_back(result);
            self
        }
    }

    impl Stage for TestStage {
        fn id(&self) -> StageId {
            self.id
        }

        fn ordinal(&self) -> u32 {
            self.ordinal
        }

        fn has_pruning(&self) -> bool {
            self.has_pruning
        }

        fn is_disabled(&self) -> bool {
            self.disabled
        }

        fn forward(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
            self.log.lock().unwrap().push((self.id.as_str(), "forward"));
            match self.forward_results.pop_front().unwrap_or(Ok(())) {
                Ok(()) => {
                    ctx.update_progress(txn, self.id, self.target)?;
                    txn.commit()?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn unwind(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
            self.log.lock().unwrap().push((self.id.as_str(), "unwind"));
            let progress = ctx.get_progress(txn, self.id)?;
            if let Some(to) = ctx.needs_unwind(progress) {
                ctx.update_progress(txn, self.id, to)?;
                txn.commit()?;
            }
            Ok(())
        }

        fn prune(&mut self, _txn: &mut TxnManager<'_>, _ctx: &mut SyncContext) -> StageResult {
            self.log.lock().unwrap().push((self.id.as_str(), "prune"));
            self.prune_results.pop_front().unwrap_or(Ok(()))
        }
    }

    const STAGE_A: StageId = StageId("A");
    const STAGE_B: StageId = StageId("B");
    const STAGE_C: StageId = StageId("C");

    #[test]
    fn forward_runs_in_ordinal_order() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        let log: OpLog = Default::default();

        // pushed out of order on purpose
        let mut driver = SyncDriver::new()
            .push(TestStage::new(STAGE_B, 2, log.clone()))
            .push(TestStage::new(STAGE_A, 1, log.clone()))
            .push(TestStage::new(STAGE_C, 3, log.clone()));

        driver.run_cycle(&test.env, &mut ctx).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![("A", "forward"), ("B", "forward"), ("C", "forward")]
        );
        assert_eq!(test.stage_progress(STAGE_C), 10);
    }

    #[test]
    fn forward_failure_terminates_cycle() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        let log: OpLog = Default::default();

        let mut driver = SyncDriver::new()
            .push(TestStage::new(STAGE_A, 1, log.clone()))
            .push(
                TestStage::new(STAGE_B, 2, log.clone())
                    .add_forward(Err(StageError::InvalidBlock(5))),
            )
            .push(TestStage::new(STAGE_C, 3, log.clone()));

        let result = driver.run_cycle(&test.env, &mut ctx);
        assert_matches!(
            result,
            Err(PipelineError::Stage { stage, source: StageError::InvalidBlock(5) }) if stage == STAGE_B
        );
        // stage C never ran
        assert_eq!(
            *log.lock().unwrap(),
            vec![("A", "forward"), ("B", "forward")]
        );
        // the failed cycle dropped the watermark cache
        assert_eq!(test.stage_progress(STAGE_A), 10);
        assert_eq!(test.stage_progress(STAGE_C), 0);
    }

    #[test]
    fn disabled_stages_are_skipped() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        let log: OpLog = Default::default();

        let mut driver = SyncDriver::new()
            .push(TestStage::new(STAGE_A, 1, log.clone()))
            .push(TestStage::new(STAGE_B, 2, log.clone()).disabled());

        driver.run_cycle(&test.env, &mut ctx).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![("A", "forward")]);
    }

    #[test]
    fn unwind_runs_in_reverse_order_and_clears_signal() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        let log: OpLog = Default::default();

        let mut driver = SyncDriver::new()
            .push(TestStage::new(STAGE_A, 1, log.clone()))
            .push(TestStage::new(STAGE_B, 2, log.clone()))
            .push(TestStage::new(STAGE_C, 3, log.clone()));

        driver.run_cycle(&test.env, &mut ctx).unwrap();
        log.lock().unwrap().clear();
        ctx.clear_cache();

        ctx.set_unwind_height(Some(4));
        driver.run_cycle(&test.env, &mut ctx).unwrap();

        let ops = log.lock().unwrap().clone();
        // reverse order rollback, then the forward pass of the same cycle
        assert_eq!(
            &ops[..3],
            &[("C", "unwind"), ("B", "unwind"), ("A", "unwind")]
        );
        assert_eq!(ctx.unwind_height(), None);
    }

    #[test]
    fn unwind_skips_stages_at_or_below_height() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        let log: OpLog = Default::default();

        // stage A never ran forward, so its progress is 0
        let mut driver = SyncDriver::new()
            .push(TestStage::new(STAGE_A, 1, log.clone()).disabled())
            .push(TestStage::new(STAGE_B, 2, log.clone()));

        driver.run_cycle(&test.env, &mut ctx).unwrap();
        ctx.clear_cache();
        log.lock().unwrap().clear();

        ctx.set_unwind_height(Some(4));
        let mut driver = SyncDriver::new()
            .push(TestStage::new(STAGE_A, 1, log.clone()))
            .push(TestStage::new(STAGE_B, 2, log.clone()));
        driver.run_cycle(&test.env, &mut ctx).unwrap();

        let ops = log.lock().unwrap().clone();
        // only B was above the unwind height
        assert_eq!(ops.iter().filter(|(_, op)| *op == "unwind").count(), 1);
        assert_eq!(ops[0], ("B", "unwind"));
    }

    #[test]
    fn prune_continues_after_failure_and_surfaces_it() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        let log: OpLog = Default::default();

        let mut driver = SyncDriver::new()
            .push(
                TestStage::new(STAGE_A, 1, log.clone())
                    .with_pruning(Err(StageError::NotImplemented)),
            )
            .push(TestStage::new(STAGE_B, 2, log.clone()).with_pruning(Ok(())));

        let result = driver.run_cycle(&test.env, &mut ctx);
        assert_matches!(
            result,
            Err(PipelineError::Stage { stage, source: StageError::NotImplemented }) if stage == STAGE_A
        );
        // B still pruned
        let ops = log.lock().unwrap().clone();
        assert!(ops.contains(&("B", "prune")));
    }

    #[test]
    fn run_exits_once_done() {
        struct DoneStage;
        impl Stage for DoneStage {
            fn id(&self) -> StageId {
                StageId("Done")
            }
            fn ordinal(&self) -> u32 {
                1
            }
            fn forward(&mut self, _: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
                ctx.set_done();
                Ok(())
            }
            fn unwind(&mut self, _: &mut TxnManager<'_>, _: &mut SyncContext) -> StageResult {
                Ok(())
            }
        }

        let test = TestEnv::new();
        let mut ctx = test.ctx();
        let mut driver = SyncDriver::new().push(DoneStage);
        driver.run(&test.env, &mut ctx).unwrap();
        assert!(ctx.is_done());
        assert!(!ctx.is_first_cycle());
    }

    #[test]
    #[should_panic(expected = "duplicate stage ordinal")]
    fn duplicate_ordinals_are_rejected() {
        let log: OpLog = Default::default();
        let _ = SyncDriver::new()
            .push(TestStage::new(STAGE_A, 1, log.clone()))
            .push(TestStage::new(STAGE_B, 1, log));
    }
}
