//! A work-stealing pool that verifies transaction input scripts in
//! parallel, with short-circuit on the first failure.
//!
//! Callers drive the pool phase-by-phase: enqueue a batch with
//! [`VerifierPool::verify`], join it with [`VerifierPool::yield_success`],
//! then [`VerifierPool::reset`] before the next batch. The pool never
//! overlaps batches on its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use crossbeam_channel as chan;
use tracing::{debug, trace};

use sable_chain::transaction::Transaction;
use sable_chain::transparent::Output;

use crate::script;

struct Task {
    output: Output,
    txn: Arc<Transaction>,
    input_index: usize,
    strict_p2sh: bool,
    hash_type: u32,
}

#[derive(Default)]
struct Verdict {
    failed: bool,
    reason: String,
}

struct Shared {
    /// Write-once per batch: `false → true` under the writer lock; readers
    /// take the shared lock to short-circuit.
    verdict: RwLock<Verdict>,
    /// Tasks enqueued but not yet finished.
    pending: Mutex<usize>,
    all_done: Condvar,
}

impl Shared {
    fn already_failed(&self) -> bool {
        self.verdict
            .read()
            .expect("verifier lock is never poisoned")
            .failed
    }

    fn failed_with_reason(&self, reason: String) {
        let mut verdict = self
            .verdict
            .write()
            .expect("verifier lock is never poisoned");
        // Only the first failing task records its reason.
        if !verdict.failed {
            verdict.failed = true;
            verdict.reason = reason;
        }
    }

    fn task_finished(&self) {
        let mut pending = self
            .pending
            .lock()
            .expect("verifier lock is never poisoned");
        *pending -= 1;
        if *pending == 0 {
            self.all_done.notify_all();
        }
    }
}

/// A fixed set of worker threads evaluating script-verification tasks.
pub struct VerifierPool {
    shared: Arc<Shared>,
    sender: Option<chan::Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl VerifierPool {
    /// Create a pool with `threads` workers; zero selects the hardware
    /// parallelism (always at least one).
    pub fn new(threads: usize) -> VerifierPool {
        let threads = if threads == 0 {
            num_cpus::get().max(1)
        } else {
            threads
        };

        let shared = Arc::new(Shared {
            verdict: RwLock::new(Verdict::default()),
            pending: Mutex::new(0),
            all_done: Condvar::new(),
        });
        let (sender, receiver) = chan::unbounded::<Task>();

        let workers = (0..threads)
            .map(|index| {
                let shared = shared.clone();
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("script-verifier-{}", index))
                    .spawn(move || worker(shared, receiver))
                    .expect("spawning a verifier thread succeeds")
            })
            .collect();

        debug!(threads, "started script verifier pool");
        VerifierPool {
            shared,
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueue one input for verification.
    ///
    /// If the current batch has already failed, the task completes without
    /// doing any work.
    pub fn verify(
        &self,
        output: Output,
        txn: Arc<Transaction>,
        input_index: usize,
        strict_p2sh: bool,
        hash_type: u32,
    ) {
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("verifier lock is never poisoned");
            *pending += 1;
        }
        self.sender
            .as_ref()
            .expect("sender lives as long as the pool")
            .send(Task {
                output,
                txn,
                input_index,
                strict_p2sh,
                hash_type,
            })
            .expect("workers outlive the sender");
    }

    /// Wait for every enqueued task to complete, then report whether the
    /// whole batch succeeded.
    pub fn yield_success(&self) -> bool {
        let mut pending = self
            .shared
            .pending
            .lock()
            .expect("verifier lock is never poisoned");
        while *pending > 0 {
            pending = self
                .shared
                .all_done
                .wait(pending)
                .expect("verifier lock is never poisoned");
        }
        !self.shared.already_failed()
    }

    /// A human-readable description of the first failure, empty on success.
    pub fn reason(&self) -> String {
        self.shared
            .verdict
            .read()
            .expect("verifier lock is never poisoned")
            .reason
            .clone()
    }

    /// Re-enable the pool for a fresh batch.
    ///
    /// Callable only between batches: callers must have joined the previous
    /// batch with [`VerifierPool::yield_success`] first.
    pub fn reset(&self) {
        let pending = self
            .shared
            .pending
            .lock()
            .expect("verifier lock is never poisoned");
        assert_eq!(
            *pending, 0,
            "reset() called with verification tasks outstanding"
        );
        let mut verdict = self
            .shared
            .verdict
            .write()
            .expect("verifier lock is never poisoned");
        verdict.failed = false;
        verdict.reason.clear();
    }
}

impl Default for VerifierPool {
    fn default() -> Self {
        VerifierPool::new(0)
    }
}

impl Drop for VerifierPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(shared: Arc<Shared>, receiver: chan::Receiver<Task>) {
    static VERIFIED: AtomicUsize = AtomicUsize::new(0);

    for task in receiver.iter() {
        // No reason to waste time on a losing batch.
        if !shared.already_failed() {
            match script::verify_signature(
                &task.output,
                &task.txn,
                task.input_index,
                task.strict_p2sh,
                task.hash_type,
            ) {
                Ok(()) => {
                    let total = VERIFIED.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(total, "script verified");
                    metrics::counter!("script.verified", 1);
                }
                Err(error) => {
                    shared.failed_with_reason(format!(
                        "{} in transaction {} input {}",
                        error,
                        task.txn.hash(),
                        task.input_index,
                    ));
                }
            }
        }
        shared.task_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    use sable_chain::amount::Amount;
    use sable_chain::transaction::LockTime;
    use sable_chain::transparent::{Input, OutPoint, Script};

    const OP_1: u8 = 0x51;

    fn output(script: Vec<u8>) -> Output {
        Output {
            value: Amount::try_from(1_000).unwrap(),
            lock_script: Script(script),
        }
    }

    fn tx_with_inputs(count: usize) -> Arc<Transaction> {
        let inputs = (0..count)
            .map(|index| Input::PrevOut {
                outpoint: OutPoint {
                    hash: sable_chain::transaction::Hash([3u8; 32]),
                    index: index as u32,
                },
                unlock_script: Script(vec![]),
                sequence: 0xffff_ffff,
            })
            .collect();
        Arc::new(Transaction::new(
            1,
            inputs,
            vec![output(vec![OP_1])],
            LockTime::unlocked(),
        ))
    }

    #[test]
    fn all_valid_batch_succeeds() {
        sable_test::init();

        let pool = VerifierPool::new(4);
        let tx = tx_with_inputs(8);
        for index in 0..8 {
            pool.verify(output(vec![OP_1]), tx.clone(), index, true, 0);
        }
        assert!(pool.yield_success());
        assert_eq!(pool.reason(), "");
    }

    #[test]
    fn one_failure_fails_the_batch_and_reports_the_transaction() {
        sable_test::init();

        let pool = VerifierPool::new(4);
        let tx = tx_with_inputs(200);
        for index in 0..200 {
            // Input 117 spends an unspendable (empty) output.
            let lock = if index == 117 { vec![] } else { vec![OP_1] };
            pool.verify(output(lock), tx.clone(), index, true, 0);
        }
        assert!(!pool.yield_success());
        let reason = pool.reason();
        assert!(
            reason.contains(&tx.hash().to_string()),
            "reason must name the offending transaction: {}",
            reason
        );
    }

    #[test]
    fn reset_clears_failure_state() {
        sable_test::init();

        let pool = VerifierPool::new(2);
        let tx = tx_with_inputs(1);
        pool.verify(output(vec![]), tx.clone(), 0, true, 0);
        assert!(!pool.yield_success());

        pool.reset();
        assert_eq!(pool.reason(), "");
        pool.verify(output(vec![OP_1]), tx, 0, true, 0);
        assert!(pool.yield_success());
    }
}
