//! End-to-end scenarios for the token hierarchy: cold fills, token
//! splitting, write propagation, writeback, rerouting under pressure and
//! root striping, plus randomized multi-client runs checked against a
//! sequential reference model.

use proptest::prelude::*;

use crate::mem::cdma::cache::LineState;
use crate::mem::cdma::root::RootLineState;
use crate::test_utils::{cdma_harness, pattern, Op, LINE};

const A: u64 = 0x0000;

#[test]
fn cold_read_fills_line_with_all_tokens() {
    let mut h = cdma_harness(4, false, &[]);
    h.preload(A, &pattern(0x10));

    h.clients[0].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(1));
    h.quiesce(2000);

    let state = h.clients[0].state.borrow();
    assert_eq!(state.last_read(A).expect("read completed"), &pattern(0x10)[..]);
    drop(state);

    let mem = h.mem.borrow();
    let snap = mem.line_snapshot(A);
    assert_eq!(snap.caches.len(), 1);
    assert_eq!(snap.caches[0].state, LineState::Full);
    assert_eq!(snap.caches[0].tokens, 4);
    assert!(!snap.caches[0].dirty);
    let root = snap.root.as_ref().expect("root tracks the line");
    assert_eq!(root.state, RootLineState::Full);
    assert_eq!(root.tokens, 0);
    assert_eq!(mem.external_reads(), 1, "exactly one DDR fetch");
    mem.check_invariants(true);
}

#[test]
fn read_after_read_splits_tokens() {
    let mut h = cdma_harness(4, false, &[]);
    h.preload(A, &pattern(0x20));

    h.clients[0].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(1));
    h.quiesce(2000);

    h.clients[2].push(Op::Read(A));
    h.clients[2].push(Op::WaitReads(1));
    h.quiesce(2000);

    assert_eq!(
        h.clients[2].state.borrow().last_read(A).unwrap(),
        &pattern(0x20)[..]
    );

    let mem = h.mem.borrow();
    let snap = mem.line_snapshot(A);
    assert_eq!(snap.caches.len(), 2, "both caches hold the line: {snap:?}");
    for holder in &snap.caches {
        assert_eq!(holder.state, LineState::Full);
        assert_eq!(holder.tokens, 2, "even split expected: {snap:?}");
    }
    mem.check_invariants(true);
}

#[test]
fn shared_write_updates_all_copies_and_backing_store() {
    let mut h = cdma_harness(4, false, &[]);
    h.preload(A, &pattern(0x30));

    // Establish two copies with two tokens each.
    h.clients[0].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(1));
    h.quiesce(2000);
    h.clients[2].push(Op::Read(A));
    h.clients[2].push(Op::WaitReads(1));
    h.quiesce(2000);

    // Partial-token write propagates as an update.
    h.clients[2].push(Op::Write(A, 0, vec![0xAA; 8]));
    h.clients[2].push(Op::WaitWrites(1));
    h.quiesce(2000);

    // The other copy observes the new bytes on a local hit.
    h.clients[0].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(2));
    h.quiesce(2000);
    let reads = &h.clients[0].state.borrow().reads;
    let data = &reads.last().unwrap().1;
    assert_eq!(&data[..8], &[0xAA; 8]);
    assert_eq!(data[8], pattern(0x30)[8]);

    // The home root committed the bytes in passing.
    assert_eq!(h.store_byte(A), 0xAA);

    let mem = h.mem.borrow();
    let snap = mem.line_snapshot(A);
    // Copies stay; nobody is dirty without the full budget.
    assert_eq!(snap.caches.len(), 2);
    assert!(snap.caches.iter().all(|c| !c.dirty));
    assert_eq!(snap.visible_tokens(), 4);
    mem.check_invariants(true);
}

#[test]
fn exclusive_write_miss_grants_whole_budget() {
    let mut h = cdma_harness(4, false, &[]);
    let b = 0x1000;
    h.preload(b, &pattern(0x40));

    h.clients[2].push(Op::Write(b, 4, vec![0x55; 4]));
    h.clients[2].push(Op::WaitWrites(1));
    h.quiesce(2000);

    let mem = h.mem.borrow();
    let snap = mem.line_snapshot(b);
    assert_eq!(snap.caches.len(), 1);
    assert_eq!(snap.caches[0].tokens, 4);
    assert!(snap.caches[0].dirty, "sole owner of a written line is dirty");
    mem.check_invariants(true);
}

#[test]
fn dirty_eviction_writes_back_and_clears_root_line() {
    let mut h = cdma_harness(4, false, &[]);
    let b = 0x1000;
    h.preload(b, &pattern(0x40));

    // Exclusive dirty line in cache 2.
    h.clients[2].push(Op::Write(b, 0, vec![0x77; LINE]));
    h.clients[2].push(Op::WaitWrites(1));
    h.quiesce(2000);

    // Force the eviction: with DIRECT mapping, 4 sets and 2 ways, these
    // two lines land in b's set and push it out as the LRU entry.
    let conflict1 = b + 4 * LINE as u64;
    let conflict2 = b + 8 * LINE as u64;
    h.clients[2].push(Op::Read(conflict1));
    h.clients[2].push(Op::Read(conflict2));
    h.clients[2].push(Op::WaitReads(2));
    h.quiesce(4000);

    // Exactly one external write carried the line down.
    assert_eq!(h.store_byte(b), 0x77);
    assert_eq!(h.store_byte(b + 63), 0x77);
    let mem = h.mem.borrow();
    assert_eq!(mem.external_writes(), 1);
    let snap = mem.line_snapshot(b);
    assert!(snap.caches.is_empty());
    assert!(snap.root.is_none(), "all-token eviction deletes the line");
    drop(mem);

    // A later reader sees the written bytes from memory.
    h.clients[1].push(Op::Read(b));
    h.clients[1].push(Op::WaitReads(1));
    h.quiesce(2000);
    assert_eq!(
        h.clients[1].state.borrow().last_read(b).unwrap(),
        &[0x77; LINE][..]
    );
}

#[test]
fn eviction_of_sole_clean_copy_returns_tokens_to_root() {
    let mut h = cdma_harness(4, false, &[]);
    let b = 0x2000;
    h.preload(b, &pattern(0x50));

    h.clients[0].push(Op::Read(b));
    h.clients[0].push(Op::WaitReads(1));
    h.quiesce(2000);

    let conflict1 = b + 4 * LINE as u64;
    let conflict2 = b + 8 * LINE as u64;
    h.clients[0].push(Op::Read(conflict1));
    h.clients[0].push(Op::Read(conflict2));
    h.clients[0].push(Op::WaitReads(3));
    h.quiesce(4000);

    let mem = h.mem.borrow();
    // Clean eviction: no external write, line gone everywhere.
    assert_eq!(mem.external_writes(), 0);
    let snap = mem.line_snapshot(b);
    assert!(snap.caches.is_empty());
    assert!(snap.root.is_none());
    mem.check_invariants(true);
}

#[test]
fn two_level_traffic_keeps_directory_counters_consistent() {
    // Two rings of two caches behind directories, one root.
    let mut h = cdma_harness(4, true, &[("NumL2CachesPerRing", "2")]);
    for i in 0..8u64 {
        h.preload(i * LINE as u64, &pattern(i as u8));
    }

    // Cross-ring sharing on a small working set.
    for (c, lines) in [(0usize, [0u64, 1, 2]), (1, [1, 2, 3]), (2, [0, 2, 3]), (3, [0, 1, 3])] {
        for l in lines {
            h.clients[c].push(Op::Read(l * LINE as u64));
        }
        h.clients[c].push(Op::WaitReads(3));
    }
    h.quiesce(8000);

    for c in 0..4 {
        let state = h.clients[c].state.borrow();
        assert_eq!(state.reads.len(), 3, "client {c} saw {:?}", state.reads);
    }
    let mem = h.mem.borrow();
    mem.check_invariants(true);
    let dump = mem.dump_state();
    assert!(dump.contains("lines tracked"));
    assert!(dump.contains("rootdir0"));
}

#[test]
fn saturated_rings_still_deliver_under_rerouting() {
    // Tiny node buffers and cross-ring traffic squeeze the shortcut path;
    // messages taking the long way must not corrupt any counter.
    let mut h = cdma_harness(
        6,
        true,
        &[("NumL2CachesPerRing", "2"), ("NodeBufferSize", "2")],
    );
    for i in 0..6u64 {
        h.preload(i * LINE as u64, &pattern(i as u8));
    }
    for c in 0..6usize {
        for l in 0..6u64 {
            h.clients[c].push(Op::Read(l * LINE as u64));
        }
        h.clients[c].push(Op::WaitReads(6));
    }
    h.quiesce(20_000);

    for c in 0..6 {
        assert_eq!(h.clients[c].state.borrow().reads.len(), 6);
    }
    let mem = h.mem.borrow();
    mem.check_invariants(true);
}

#[test]
fn addresses_stripe_across_roots() {
    let mut h = cdma_harness(4, false, &[("NumRootDirectories", "2")]);
    let a0 = 0u64;
    let a1 = LINE as u64;
    h.preload(a0, &pattern(1));
    h.preload(a1, &pattern(2));

    h.clients[0].push(Op::Read(a0));
    h.clients[1].push(Op::Read(a1));
    h.clients[0].push(Op::WaitReads(1));
    h.clients[1].push(Op::WaitReads(1));
    h.quiesce(4000);

    assert_eq!(h.clients[0].state.borrow().last_read(a0).unwrap(), &pattern(1)[..]);
    assert_eq!(h.clients[1].state.borrow().last_read(a1).unwrap(), &pattern(2)[..]);

    let mem = h.mem.borrow();
    let s0 = mem.line_snapshot(a0);
    let s1 = mem.line_snapshot(a1);
    // Consecutive lines belong to different roots.
    assert_eq!(s0.root.as_ref().unwrap().name, "cdma.rootdir0");
    assert_eq!(s1.root.as_ref().unwrap().name, "cdma.rootdir1");
    assert_eq!(mem.root_reads(), vec![1, 1]);
}

#[test]
fn concurrent_readers_of_loading_line_share_one_fill() {
    // Two clients on the same cache: the second read arrives while the
    // line is still loading and drains from the same reply.
    let mut h = cdma_harness(2, false, &[("NumClientsPerL2Cache", "2")]);
    h.preload(A, &pattern(0x60));

    h.clients[0].push(Op::Read(A));
    h.clients[1].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(1));
    h.clients[1].push(Op::WaitReads(1));
    h.quiesce(2000);

    let d0 = h.clients[0].state.borrow().last_read(A).unwrap().to_vec();
    let d1 = h.clients[1].state.borrow().last_read(A).unwrap().to_vec();
    assert_eq!(d0, d1, "both waiters see the data of the single fill");
    let mem = h.mem.borrow();
    assert_eq!(mem.external_reads(), 1, "one DDR fetch serves both");
}

#[test]
fn lru_evicts_the_oldest_full_line() {
    // Associativity 2, so the third line in a set pushes out the least
    // recently used of the first two.
    let mut h = cdma_harness(1, false, &[]);
    let base = 0x1000u64;
    let in_set = |n: u64| base + n * 4 * LINE as u64;
    for n in 0..3 {
        h.preload(in_set(n), &pattern(n as u8));
    }

    h.clients[0].push(Op::Read(in_set(0)));
    h.clients[0].push(Op::Read(in_set(1)));
    h.clients[0].push(Op::WaitReads(2));
    // Touch line 0 again so line 1 becomes the LRU entry.
    h.clients[0].push(Op::Read(in_set(0)));
    h.clients[0].push(Op::WaitReads(3));
    h.clients[0].push(Op::Read(in_set(2)));
    h.clients[0].push(Op::WaitReads(4));
    h.quiesce(6000);

    let mem = h.mem.borrow();
    assert!(mem.line_snapshot(in_set(0)).caches.len() == 1, "recently used stays");
    assert!(mem.line_snapshot(in_set(1)).caches.is_empty(), "LRU went");
    assert!(mem.line_snapshot(in_set(2)).caches.len() == 1);
    mem.check_invariants(true);
}

#[test]
fn back_to_back_shared_writes_each_get_their_ack() {
    let mut h = cdma_harness(4, false, &[]);
    h.preload(A, &pattern(0x70));

    // Two sharers so writes take the update path.
    h.clients[0].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(1));
    h.quiesce(2000);
    h.clients[2].push(Op::Read(A));
    h.clients[2].push(Op::WaitReads(1));
    h.quiesce(2000);

    h.clients[2].push(Op::Write(A, 0, vec![1; 4]));
    h.clients[2].push(Op::Write(A, 4, vec![2; 4]));
    h.clients[2].push(Op::Write(A, 8, vec![3; 4]));
    h.clients[2].push(Op::WaitWrites(3));
    h.quiesce(4000);

    assert_eq!(h.clients[2].state.borrow().write_acks.len(), 3);
    // All three updates reached the other copy.
    h.clients[0].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(2));
    h.quiesce(2000);
    let reads = &h.clients[0].state.borrow().reads;
    let data = &reads.last().unwrap().1;
    assert_eq!(&data[..12], &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    h.mem.borrow().check_invariants(true);
}

#[test]
fn address_tracing_toggles() {
    let mut h = cdma_harness(2, false, &[]);
    h.mem.borrow_mut().trace_address(A, true);
    h.preload(A, &pattern(1));
    h.clients[0].push(Op::Read(A));
    h.clients[0].push(Op::WaitReads(1));
    h.quiesce(2000);
    h.mem.borrow_mut().trace_address(A, false);
    // Tracing is observational only; the protocol outcome is unchanged.
    assert_eq!(
        h.clients[0].state.borrow().last_read(A).unwrap(),
        &pattern(1)[..]
    );
}

#[test]
fn writer_snoops_reach_co_clients_of_the_same_cache() {
    let mut h = cdma_harness(2, false, &[("NumClientsPerL2Cache", "2")]);
    h.preload(A, &pattern(2));
    h.clients[0].push(Op::Write(A, 0, vec![9; 8]));
    h.clients[0].push(Op::WaitWrites(1));
    h.quiesce(2000);
    let snoops = &h.clients[1].state.borrow().snoops;
    assert_eq!(snoops.len(), 1);
    assert_eq!(&snoops[0].1[..8], &[9; 8]);
    assert!(h.clients[0].state.borrow().snoops.is_empty());
}

// --- randomized model check ------------------------------------------------

/// One generated operation: (client, line index, optional write seed).
type RandomOp = (usize, u64, Option<u8>);

fn random_ops(clients: usize, lines: u64) -> impl Strategy<Value = Vec<RandomOp>> {
    prop::collection::vec(
        (0..clients, 0..lines, prop::option::of(any::<u8>())),
        1..40,
    )
}

/// Apply the scripts to the hierarchy and compare the final line contents
/// with a flat reference model. Each client writes only its own byte range
/// so racing writes cannot make the outcome ambiguous.
fn run_model_check(mut h: crate::test_utils::Harness<super::CdmaMemory>, ops: Vec<RandomOp>) {
    let lines = 4u64;
    let mut reference: Vec<Vec<u8>> = (0..lines).map(|l| pattern(l as u8)).collect();
    for l in 0..lines {
        h.preload(l * LINE as u64, &reference[l as usize].clone());
    }

    let mut writes_per_client = vec![0usize; h.clients.len()];
    for (client, line, write) in &ops {
        let addr = line * LINE as u64;
        match write {
            Some(seed) => {
                let offset = client * 8;
                let bytes = vec![*seed; 8];
                reference[*line as usize][offset..offset + 8].copy_from_slice(&bytes);
                h.clients[*client].push(Op::Write(addr, offset, bytes));
                writes_per_client[*client] += 1;
            }
            None => {
                h.clients[*client].push(Op::Read(addr));
            }
        }
    }
    for (c, n) in writes_per_client.iter().enumerate() {
        if *n > 0 {
            h.clients[c].push(Op::WaitWrites(*n));
        }
    }
    h.quiesce(40_000);
    h.mem.borrow().check_invariants(true);

    // Read every line back through client 0 and compare with the model.
    let already = h.clients[0].state.borrow().reads.len();
    for l in 0..lines {
        h.clients[0].push(Op::Read(l * LINE as u64));
    }
    h.clients[0].push(Op::WaitReads(already + lines as usize));
    h.quiesce(40_000);

    let state = h.clients[0].state.borrow();
    for l in 0..lines {
        let got = state.last_read(l * LINE as u64).expect("final read");
        assert_eq!(
            got,
            &reference[l as usize][..],
            "line {l} diverged from the reference model"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn random_traffic_matches_reference_model(ops in random_ops(3, 4)) {
        run_model_check(cdma_harness(3, false, &[]), ops);
    }

    #[test]
    fn random_traffic_matches_reference_model_two_level(ops in random_ops(4, 4)) {
        run_model_check(
            cdma_harness(4, true, &[("NumL2CachesPerRing", "2")]),
            ops,
        );
    }
}
