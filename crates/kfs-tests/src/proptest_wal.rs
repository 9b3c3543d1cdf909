//! Property-Based Tests for the operation log and checkpoints

use std::future::Future;
use std::sync::Arc;

use kfs_meta::{CheckpointManager, MetaResult, RecordImage, SeqNo};

use crate::harness::{create_request, MetaTestEnv};

/// What one scripted log session observed.
#[derive(Debug)]
pub struct WalRun {
    pub released: Vec<SeqNo>,
    pub committed: SeqNo,
    pub checkpointed: SeqNo,
}

/// Runs `f` on a fresh single-threaded runtime.
pub fn block_on<F: Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
        .block_on(f)
}

/// Submits one request per entry of `plan`, taking a checkpoint after every
/// entry that is true, then closes the log and collects every result.
pub async fn run_plan(env: &MetaTestEnv, plan: &[bool]) -> MetaResult<WalRun> {
    let running = env.boot()?;
    let log = Arc::clone(&running.log);
    let mut cp = CheckpointManager::new(Arc::clone(&log), RecordImage::new());

    let mut released = Vec::new();
    for (i, &checkpoint) in plan.iter().enumerate() {
        log.add_pending(create_request(&format!("p{}", i)))?;
        if checkpoint {
            let outcome = cp.checkpoint().await?;
            released.extend(outcome.released.iter().map(|r| r.seqno));
        }
    }
    running.shutdown().await?;
    released.extend(cp.absorb()?.iter().map(|r| r.seqno));

    Ok(WalRun {
        released,
        committed: log.committed(),
        checkpointed: log.checkpointed(),
    })
}

/// Sequence number covered by the last checkpoint in `plan`, or 0.
pub fn last_checkpoint(plan: &[bool]) -> SeqNo {
    plan.iter().rposition(|&c| c).map_or(0, |i| i as SeqNo + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_meta::recover;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_seqnos_dense_and_ordered(plan in prop::collection::vec(any::<bool>(), 1..30)) {
            let env = MetaTestEnv::new();
            let run = block_on(run_plan(&env, &plan)).unwrap();
            let n = plan.len() as SeqNo;

            prop_assert_eq!(&run.released, &(1..=n).collect::<Vec<_>>());
            prop_assert_eq!(run.committed, n);
            prop_assert!(run.checkpointed <= run.committed);
            prop_assert_eq!(run.checkpointed, last_checkpoint(&plan));
        }

        #[test]
        fn prop_recovery_resumes_after_last_seqno(plan in prop::collection::vec(any::<bool>(), 1..20)) {
            let env = MetaTestEnv::new();
            block_on(run_plan(&env, &plan)).unwrap();
            let n = plan.len() as SeqNo;
            let covered = last_checkpoint(&plan);

            let point = recover(env.config()).unwrap();
            prop_assert_eq!(point.last_seqno, n);
            prop_assert_eq!(point.checkpointed, covered);
            let replayed: Vec<SeqNo> = point.replay.iter().map(|r| r.seqno).collect();
            prop_assert_eq!(replayed, (covered + 1..=n).collect::<Vec<_>>());
        }
    }
}
