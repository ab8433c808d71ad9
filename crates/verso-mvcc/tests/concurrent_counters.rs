//! Zero-sum transfer stress: concurrent writers move units between cells;
//! every snapshot must observe a zero total and quiescence must leave no
//! versions or registry entries behind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use verso_mvcc::{MvccRuntime, Versioned};

fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

fn run_transfer_stress(nthreads: u64, iters: u64, nvars: u64, with_compression: bool) {
    let runtime = MvccRuntime::new();
    let vars: Arc<Vec<Versioned<i64>>> = Arc::new(
        (0..nvars)
            .map(|_| Versioned::new(&runtime, 0_i64))
            .collect(),
    );
    let barrier = Arc::new(Barrier::new(usize::try_from(nthreads).unwrap()));
    let conflicts = Arc::new(AtomicU64::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let compressor = with_compression.then(|| {
        let runtime = runtime.clone();
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            while !finished.load(Ordering::Acquire) {
                runtime.compress_epochs().expect("compression stays valid");
                thread::yield_now();
            }
        })
    });

    let workers: Vec<_> = (0..nthreads)
        .map(|thread_id| {
            let runtime = runtime.clone();
            let vars = Arc::clone(&vars);
            let barrier = Arc::clone(&barrier);
            let conflicts = Arc::clone(&conflicts);
            thread::spawn(move || {
                barrier.wait();
                let mut rng = thread_id
                    .wrapping_add(1)
                    .wrapping_mul(0x9E37_79B9_7F4A_7C15);
                for _ in 0..iters {
                    let from = usize::try_from(lcg_next(&mut rng) % nvars).unwrap();
                    let to = usize::try_from(lcg_next(&mut rng) % nvars).unwrap();

                    let mut txn = runtime.begin();
                    loop {
                        let total: i64 = vars.iter().map(|v| v.read_in(&txn)).sum();
                        assert_eq!(
                            total,
                            0,
                            "snapshot at {:?} saw a non-zero total\n{}",
                            txn.epoch(),
                            runtime.dump()
                        );

                        *vars[from].mutate_in(&mut txn) -= 1;
                        *vars[to].mutate_in(&mut txn) += 1;
                        if txn.commit() {
                            break;
                        }
                        // The snapshot restarted at the current epoch with a
                        // clean staging area; retry against the new view.
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    finished.store(true, Ordering::Release);
    if let Some(compressor) = compressor {
        compressor.join().unwrap();
    }

    let total: i64 = vars.iter().map(|v| v.read()).sum();
    assert_eq!(total, 0);
    for var in vars.iter() {
        assert_eq!(var.history_size(), 0, "{}", var.dump());
        var.validate().unwrap();
    }
    assert_eq!(runtime.entry_count(), 0, "{}", runtime.dump());
    runtime.validate().unwrap();

    runtime.collect();
    assert!(runtime.reclaim_stats().retired >= runtime.reclaim_stats().reclaimed);
}

#[test]
fn transfers_balance_with_two_writers() {
    run_transfer_stress(2, 200, 2, false);
}

#[test]
fn transfers_balance_with_many_writers_and_cells() {
    run_transfer_stress(6, 150, 8, false);
}

#[test]
fn transfers_balance_under_concurrent_compression() {
    run_transfer_stress(4, 100, 4, true);
}

#[test]
fn transfers_balance_on_a_single_contended_cell() {
    run_transfer_stress(4, 100, 1, false);
}
