// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use threadpool::ThreadPool;
use word_stm as stm;
use word_stm::{AbortReason, TWord};

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[test]
fn test_sequential_read_modify_write() {
    thread::spawn(|| {
        static X: TWord = TWord::new(10);

        stm::set_tls(ptr::null_mut());
        for _ in 0..1000 {
            stm::perform_transaction(|_retry| {
                let value = stm::read_word(&X)?;
                stm::write_word(&X, value + 1)
            });
        }

        let stats = stm::stats();
        assert_eq!(X.get(), 1010);
        assert_eq!(stats.commits, 1000);
        assert_eq!(stats.total_aborts(), 0);
        stm::del_tls();
    })
    .join()
    .expect("Failed to join worker thread");
}

#[test]
fn test_contended_counter() {
    static COUNTER: TWord = TWord::new(0);
    const WORKERS: usize = 2;
    const INCREMENTS: u64 = 10_000;

    let commits = Arc::new(AtomicU64::new(0));
    let pool = ThreadPool::new(WORKERS);

    for _ in 0..WORKERS {
        let commits = commits.clone();
        pool.execute(move || {
            stm::set_tls(ptr::null_mut());
            for _ in 0..INCREMENTS {
                stm::perform_transaction(|_retry| {
                    let value = stm::read_word(&COUNTER)?;
                    stm::write_word(&COUNTER, value + 1)
                });
            }
            commits.fetch_add(stm::stats().commits, Ordering::SeqCst);
            stm::del_tls();
        });
    }

    // synchronize all running worker threads
    pool.join();

    assert_eq!(COUNTER.get(), (WORKERS as u64 * INCREMENTS) as usize);
    assert_eq!(commits.load(Ordering::SeqCst), WORKERS as u64 * INCREMENTS);
}

#[test]
fn test_disjoint_writes_do_not_conflict() {
    static SLOTS: [TWord; 2] = [TWord::new(0), TWord::new(0)];
    const INCREMENTS: usize = 5000;

    let mut workers = Vec::new();
    for slot in 0..SLOTS.len() {
        workers.push(thread::spawn(move || {
            stm::set_tls(ptr::null_mut());
            for _ in 0..INCREMENTS {
                stm::perform_transaction(|_retry| {
                    let value = stm::read_word(&SLOTS[slot])?;
                    stm::write_word(&SLOTS[slot], value + 1)
                });
            }

            // adjacent words land on distinct stripes, so neither thread
            // may ever observe the other as a conflict
            let stats = stm::stats();
            assert_eq!(stats.aborts[AbortReason::CommitNewer as usize], 0);
            assert_eq!(stats.aborts[AbortReason::CommitLocked as usize], 0);
            assert_eq!(stats.aborts[AbortReason::AcquireLocked as usize], 0);
            stm::del_tls();
        }));
    }
    for worker in workers {
        worker.join().expect("Failed to join worker thread");
    }

    assert_eq!(SLOTS[0].get(), INCREMENTS);
    assert_eq!(SLOTS[1].get(), INCREMENTS);
}

#[test]
fn test_inevitable_transactions_exclude_each_other() {
    static X: TWord = TWord::new(0);
    static INSIDE: AtomicBool = AtomicBool::new(false);
    const WORKERS: usize = 4;
    const ROUNDS: usize = 100;

    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        workers.push(thread::spawn(|| {
            stm::set_tls(ptr::null_mut());
            for _ in 0..ROUNDS {
                stm::perform_transaction(|_retry| {
                    stm::try_inevitable("irreversible section")?;

                    let overlapped = INSIDE.swap(true, Ordering::SeqCst);
                    assert!(!overlapped, "two inevitable transactions overlap");

                    let value = stm::read_word(&X)?;
                    stm::write_word(&X, value + 1)?;

                    INSIDE.store(false, Ordering::SeqCst);
                    Ok(())
                });
            }
            stm::del_tls();
        }));
    }
    for worker in workers {
        worker.join().expect("Failed to join worker thread");
    }

    assert_eq!(X.get(), WORKERS * ROUNDS);
}

#[test]
fn test_read_set_validation_aborts_stale_writer() {
    static X: TWord = TWord::new(0);
    static Y: TWord = TWord::new(0);

    let (ready_tx, ready_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();

    let stale_writer = thread::spawn(move || {
        stm::set_tls(ptr::null_mut());
        let seen = stm::perform_transaction(|retry| {
            let x = stm::read_word(&X)?;
            if retry == 0 {
                // let the other thread commit X behind our back
                ready_tx.send(()).unwrap();
                resume_rx.recv().unwrap();
            }
            stm::write_word(&Y, 99)?;
            Ok(x)
        });

        let stats = stm::stats();
        assert_eq!(seen, 1, "the restart must observe the new value");
        assert!(stats.aborts[AbortReason::CommitNewer as usize] >= 1);
        stm::del_tls();
    });

    ready_rx.recv().unwrap();
    thread::spawn(|| {
        stm::set_tls(ptr::null_mut());
        stm::perform_transaction(|_retry| stm::write_word(&X, 1));
        stm::del_tls();
    })
    .join()
    .expect("Failed to join committing thread");
    resume_tx.send(()).unwrap();

    stale_writer.join().expect("Failed to join stale writer");
    assert_eq!(X.get(), 1);
    assert_eq!(Y.get(), 99);
}

#[test]
fn test_abort_and_retry_reenters_the_body() {
    static X: TWord = TWord::new(0);

    thread::spawn(|| {
        stm::set_tls(ptr::null_mut());
        stm::perform_transaction(|retry| {
            if retry == 0 {
                return Err(stm::abort_and_retry());
            }
            stm::write_word(&X, 7)
        });

        let stats = stm::stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.aborts[AbortReason::Explicit as usize], 1);
        stm::del_tls();
    })
    .join()
    .expect("Failed to join worker thread");

    assert_eq!(X.get(), 7);
}

#[test]
fn test_repeated_reads_are_consistent() {
    static X: TWord = TWord::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);
    const READS: usize = 2000;

    let writer = thread::spawn(|| {
        stm::set_tls(ptr::null_mut());
        while !STOP.load(Ordering::SeqCst) {
            stm::perform_transaction(|_retry| {
                let value = stm::read_word(&X)?;
                stm::write_word(&X, value + 1)
            });
        }
        stm::del_tls();
    });

    let reader = thread::spawn(|| {
        stm::set_tls(ptr::null_mut());
        for _ in 0..READS {
            stm::perform_transaction(|_retry| {
                let first = stm::read_word(&X)?;
                let second = stm::read_word(&X)?;
                assert_eq!(first, second, "snapshot must be stable within the body");
                Ok(())
            });
        }
        stm::del_tls();
        STOP.store(true, Ordering::SeqCst);
    });

    reader.join().expect("Failed to join reader thread");
    writer.join().expect("Failed to join writer thread");
}

#[test]
fn test_transfer_preserves_the_total() {
    const ACCOUNTS: usize = 8;
    const WORKERS: usize = 4;
    const TRANSFERS: usize = 2500;
    const INITIAL: usize = 1000;

    static BANK: [TWord; ACCOUNTS] = [
        TWord::new(INITIAL),
        TWord::new(INITIAL),
        TWord::new(INITIAL),
        TWord::new(INITIAL),
        TWord::new(INITIAL),
        TWord::new(INITIAL),
        TWord::new(INITIAL),
        TWord::new(INITIAL),
    ];

    let pool = ThreadPool::new(WORKERS);
    for seed in 0..WORKERS {
        pool.execute(move || {
            use rand::{rngs::StdRng, Rng, SeedableRng};
            let mut rng = StdRng::seed_from_u64(seed as u64);

            stm::set_tls(ptr::null_mut());
            for _ in 0..TRANSFERS {
                let from = rng.gen_range(0..ACCOUNTS);
                let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                let amount = rng.gen_range(0..8);

                stm::perform_transaction(|_retry| {
                    let debit = stm::read_word(&BANK[from])?;
                    let credit = stm::read_word(&BANK[to])?;
                    stm::write_word(&BANK[from], debit.wrapping_sub(amount))?;
                    stm::write_word(&BANK[to], credit.wrapping_add(amount))
                });
            }
            stm::del_tls();
        });
    }
    pool.join();

    let total = BANK
        .iter()
        .fold(0usize, |sum, account| sum.wrapping_add(account.get()));
    assert_eq!(total, ACCOUNTS * INITIAL, "transfers must conserve the sum");
}
