//! End-to-end protocol scenarios
//!
//! Builds a small cluster of engines wired through an in-process transport
//! that delivers records synchronously, with mock page-table and memory
//! hooks, and drives whole faults through the public entry points.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::engine::{CoherenceEngine, EngineConfig, FaultDisposition, PageFault};
use crate::error::{CoherenceError, Result};
use crate::fault::{HandleFlags, LocalBegin};
use crate::frame::{MappingId, PageFlags, Pfn, PAGE_SIZE, PAGE_SHIFT};
use crate::message::{Message, MessageKind, Payload};
use crate::transport::Transport;
use crate::vm::{AccessSample, PageMemory, SampleSource, VmPages};

pub(crate) mod mocks {
    use super::*;
    use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
    use spin::{Mutex, RwLock};

    /// Physical base of the fake HDM window.
    pub const CXL_BASE: u64 = 0x1e_8000_0000;
    pub const CXL_BASE_PFN: u64 = CXL_BASE >> PAGE_SHIFT;

    /// Recording page-table mock.
    #[derive(Default)]
    pub struct MockVm {
        pub unmaps: Mutex<Vec<(MappingId, u64, u64)>>,
        pub cleans: Mutex<Vec<(MappingId, u64, u64)>>,
        young: Mutex<BTreeSet<(u64, u64)>>,
        sample_map: Mutex<BTreeMap<(u32, u64), u64>>,
    }

    impl MockVm {
        pub fn new() -> Self {
            Self::default()
        }

        /// Mark the page's accessed bit set, as the hardware would.
        pub fn set_young(&self, mapping: MappingId, index: u64) {
            self.young.lock().insert((mapping.0, index));
        }

        /// Route a `(pid, va)` sample to a frame.
        pub fn map_sample(&self, pid: u32, va: u64, pfn: Pfn) {
            self.sample_map.lock().insert((pid, va), pfn.as_u64());
        }

        pub fn unmap_count(&self) -> usize {
            self.unmaps.lock().len()
        }
    }

    impl VmPages for MockVm {
        fn unmap_pages(&self, mapping: MappingId, index: u64, count: u64) {
            self.unmaps.lock().push((mapping, index, count));
        }

        fn clean_pages(&self, mapping: MappingId, index: u64, count: u64) {
            self.cleans.lock().push((mapping, index, count));
        }

        fn test_and_clear_young(&self, mapping: MappingId, index: u64) -> bool {
            self.young.lock().remove(&(mapping.0, index))
        }

        fn resolve_sample(&self, pid: u32, va: u64) -> Option<Pfn> {
            self.sample_map.lock().get(&(pid, va)).copied().map(Pfn::new)
        }
    }

    impl VmPages for Arc<MockVm> {
        fn unmap_pages(&self, mapping: MappingId, index: u64, count: u64) {
            (**self).unmap_pages(mapping, index, count)
        }
        fn clean_pages(&self, mapping: MappingId, index: u64, count: u64) {
            (**self).clean_pages(mapping, index, count)
        }
        fn test_and_clear_young(&self, mapping: MappingId, index: u64) -> bool {
            (**self).test_and_clear_young(mapping, index)
        }
        fn resolve_sample(&self, pid: u32, va: u64) -> Option<Pfn> {
            (**self).resolve_sample(pid, va)
        }
    }

    /// Page store backing both the shared HDM window (one copy for the
    /// whole cluster) and this host's private DRAM.
    pub struct MockMemory {
        cxl: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>,
        dram: Mutex<BTreeMap<u64, Vec<u8>>>,
        next_dram: AtomicU64,
        fail_allocs: AtomicU32,
        pub flushes: Mutex<Vec<u64>>,
    }

    impl MockMemory {
        pub fn new(shared_cxl: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>, dram_base: u64) -> Self {
            Self {
                cxl: shared_cxl,
                dram: Mutex::new(BTreeMap::new()),
                next_dram: AtomicU64::new(dram_base),
                fail_allocs: AtomicU32::new(0),
                flushes: Mutex::new(Vec::new()),
            }
        }

        /// Make the next `n` allocations fail, as under memory pressure.
        pub fn fail_next_allocs(&self, n: u32) {
            self.fail_allocs.store(n, Ordering::Release);
        }

        pub fn fill_page(&self, pfn: Pfn, value: u8) {
            let mut page = Vec::new();
            page.resize(PAGE_SIZE, value);
            if pfn.as_u64() >= CXL_BASE_PFN {
                self.cxl.lock().insert(pfn.as_u64(), page);
            } else {
                self.dram.lock().insert(pfn.as_u64(), page);
            }
        }

        pub fn read_byte(&self, pfn: Pfn) -> u8 {
            let read = |map: &BTreeMap<u64, Vec<u8>>| {
                map.get(&pfn.as_u64()).map(|page| page[0]).unwrap_or(0)
            };
            if pfn.as_u64() >= CXL_BASE_PFN {
                read(&self.cxl.lock())
            } else {
                read(&self.dram.lock())
            }
        }

        fn read_page(&self, pfn: u64) -> Vec<u8> {
            let read = |map: &BTreeMap<u64, Vec<u8>>| {
                map.get(&pfn)
                    .cloned()
                    .unwrap_or_else(|| {
                        let mut page = Vec::new();
                        page.resize(PAGE_SIZE, 0);
                        page
                    })
            };
            if pfn >= CXL_BASE_PFN {
                read(&self.cxl.lock())
            } else {
                read(&self.dram.lock())
            }
        }

        fn write_page(&self, pfn: u64, data: Vec<u8>) {
            if pfn >= CXL_BASE_PFN {
                self.cxl.lock().insert(pfn, data);
            } else {
                self.dram.lock().insert(pfn, data);
            }
        }
    }

    impl PageMemory for MockMemory {
        fn alloc_pages(&self, order: u32) -> Result<Pfn> {
            if self
                .fail_allocs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CoherenceError::OutOfMemory {
                    resource: "dram page",
                });
            }
            let base = self.next_dram.fetch_add(1 << order, Ordering::AcqRel);
            let mut dram = self.dram.lock();
            for i in 0..(1u64 << order) {
                let mut page = Vec::new();
                page.resize(PAGE_SIZE, 0);
                dram.insert(base + i, page);
            }
            Ok(Pfn::new(base))
        }

        fn free_pages(&self, pfn: Pfn, order: u32) {
            let mut dram = self.dram.lock();
            for i in 0..(1u64 << order) {
                dram.remove(&(pfn.as_u64() + i));
            }
        }

        fn copy_page(&self, src: Pfn, dst: Pfn, order: u32) {
            for i in 0..(1u64 << order) {
                let data = self.read_page(src.as_u64() + i);
                self.write_page(dst.as_u64() + i, data);
            }
        }

        fn flush_page_caches(&self, pfn: Pfn, _order: u32) {
            self.flushes.lock().push(pfn.as_u64());
        }
    }

    impl PageMemory for Arc<MockMemory> {
        fn alloc_pages(&self, order: u32) -> Result<Pfn> {
            (**self).alloc_pages(order)
        }
        fn free_pages(&self, pfn: Pfn, order: u32) {
            (**self).free_pages(pfn, order)
        }
        fn copy_page(&self, src: Pfn, dst: Pfn, order: u32) {
            (**self).copy_page(src, dst, order)
        }
        fn flush_page_caches(&self, pfn: Pfn, order: u32) {
            (**self).flush_page_caches(pfn, order)
        }
    }

    /// Queue-backed sample source.
    #[derive(Default)]
    pub struct MockSampler {
        queue: Mutex<VecDeque<AccessSample>>,
    }

    impl MockSampler {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, va: u64, pid: u32) {
            self.queue.lock().push_back(AccessSample { va, pid });
        }
    }

    impl SampleSource for MockSampler {
        fn poll(&self) -> Option<AccessSample> {
            self.queue.lock().pop_front()
        }
    }

    impl SampleSource for Arc<MockSampler> {
        fn poll(&self) -> Option<AccessSample> {
            (**self).poll()
        }
    }

    /// Engines wired together; records are delivered synchronously on the
    /// sender's thread, like the ring poller calling straight into the
    /// dispatcher.
    pub struct Cluster {
        nodes: RwLock<Vec<Arc<CoherenceEngine>>>,
        pub delivered: AtomicUsize,
    }

    pub struct ClusterTransport {
        cluster: Arc<Cluster>,
        node_id: i32,
    }

    impl Transport for ClusterTransport {
        fn name(&self) -> &'static str {
            "test-cluster"
        }

        fn node_count(&self) -> usize {
            self.cluster.nodes.read().len()
        }

        fn unicast(
            &self,
            kind: MessageKind,
            ws_id: i32,
            dest_node: i32,
            payload: &Payload,
        ) -> Result<()> {
            let node = self
                .cluster
                .nodes
                .read()
                .get(dest_node as usize)
                .cloned()
                .ok_or(CoherenceError::Transport { code: -22 })?;
            self.cluster.delivered.fetch_add(1, Ordering::Relaxed);
            let msg = Message::new(kind, ws_id, self.node_id, dest_node, payload);
            let _ = node.dispatch_message(&msg);
            Ok(())
        }

        fn broadcast(&self, kind: MessageKind, ws_id: i32, payload: &Payload) -> Result<()> {
            let nodes: Vec<_> = self.cluster.nodes.read().clone();
            for (idx, node) in nodes.iter().enumerate() {
                if idx as i32 == self.node_id {
                    continue;
                }
                self.cluster.delivered.fetch_add(1, Ordering::Relaxed);
                let msg = Message::new(kind, ws_id, self.node_id, idx as i32, payload);
                let _ = node.dispatch_message(&msg);
            }
            Ok(())
        }

        fn done(&self, _msg: &Message) {}
    }

    /// One host plus handles on its mocks.
    pub struct TestNode {
        pub engine: Arc<CoherenceEngine>,
        pub vm: Arc<MockVm>,
        pub memory: Arc<MockMemory>,
        pub sampler: Arc<MockSampler>,
        pub cluster: Arc<Cluster>,
    }

    pub fn build_cluster(count: usize) -> Vec<TestNode> {
        let shared_cxl = Arc::new(Mutex::new(BTreeMap::new()));
        let cluster = Arc::new(Cluster {
            nodes: RwLock::new(Vec::new()),
            delivered: AtomicUsize::new(0),
        });

        let mut out = Vec::new();
        for i in 0..count {
            let vm = Arc::new(MockVm::new());
            let memory = Arc::new(MockMemory::new(
                Arc::clone(&shared_cxl),
                0x10_0000 + (i as u64) * 0x1_0000,
            ));
            let sampler = Arc::new(MockSampler::new());
            let engine = Arc::new(CoherenceEngine::new(
                EngineConfig {
                    cxl_hdm_base: CXL_BASE,
                },
                Box::new(Arc::clone(&vm)),
                Box::new(Arc::clone(&memory)),
                Box::new(Arc::clone(&sampler)),
            ));
            engine.enable();
            cluster.nodes.write().push(Arc::clone(&engine));
            out.push(TestNode {
                engine,
                vm,
                memory,
                sampler,
                cluster: Arc::clone(&cluster),
            });
        }

        for (i, node) in out.iter().enumerate() {
            node.engine
                .transport()
                .register(Box::new(ClusterTransport {
                    cluster: Arc::clone(&cluster),
                    node_id: i as i32,
                }))
                .unwrap();
        }
        out
    }
}

use mocks::*;

fn test_pfn(slot: u64) -> Pfn {
    Pfn::new(CXL_BASE_PFN + slot)
}

fn fault_at(pfn: Pfn, is_write: bool) -> PageFault<'static> {
    PageFault {
        pfn,
        file_name: "vectors.dat",
        mapping: MappingId(1),
        index: pfn.as_u64() - CXL_BASE_PFN,
        is_write,
        order: 0,
    }
}

fn mapped(disposition: FaultDisposition) -> Pfn {
    match disposition {
        FaultDisposition::Mapped(pfn) => pfn,
        other => panic!("expected a mapped fault, got {:?}", other),
    }
}

#[test]
fn read_only_import_moves_idle_to_shared() {
    let nodes = build_cluster(2);
    let (a, b) = (&nodes[0], &nodes[1]);
    let pfn = test_pfn(1);

    let disposition = a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    assert_eq!(mapped(disposition), pfn);

    let frame = a.engine.frames.lookup(pfn).unwrap();
    assert!(frame.is_shared());
    assert!(!frame.is_modified());
    assert!(frame.is_coherence());

    // peer answered from I without writing anything back
    assert!(b.memory.flushes.lock().is_empty());
    assert_eq!(b.vm.unmap_count(), 0);

    // the async fetch completed: one record for the worker, none in flight
    assert_eq!(a.engine.async_queue.len(), 1);
    assert_eq!(a.engine.async_worker_tick(), 1);
    assert!(a.engine.async_inflight.lock().is_empty());
    assert_eq!(a.engine.stations.in_use(), 0);

    // no replica was created for a first touch
    assert!(a.engine.replica_pfn(&frame).is_none());

    let stats = a.engine.stats().snapshot();
    assert_eq!(stats.fault_count, 1);
    assert_eq!(stats.fault_read_count, 1);
}

#[test]
fn write_upgrade_invalidates_the_sharer() {
    let nodes = build_cluster(2);
    let (a, b) = (&nodes[0], &nodes[1]);
    let pfn = test_pfn(2);

    // both hosts import the page read-shared
    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    b.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    assert!(b.engine.frames.lookup(pfn).unwrap().is_shared());

    // A upgrades
    let disposition = a.engine.handle_fault(&fault_at(pfn, true)).unwrap();
    assert_eq!(mapped(disposition), pfn);

    let a_frame = a.engine.frames.lookup(pfn).unwrap();
    assert!(a_frame.is_modified());
    assert!(!a_frame.is_shared());

    // B dropped its copy and unmapped it before ACKing
    let b_frame = b.engine.frames.lookup(pfn).unwrap();
    assert!(!b_frame.is_shared());
    assert!(!b_frame.is_modified());
    assert_eq!(b.vm.unmap_count(), 1);

    assert_eq!(a.engine.stations.in_use(), 0);
    assert_eq!(b.engine.stations.in_use(), 0);
}

#[test]
fn read_of_replicated_shared_page_maps_replica_without_broadcast() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let pfn = test_pfn(3);
    a.memory.fill_page(pfn, 0xAA);

    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();

    let frame = a.engine.frames.lookup(pfn).unwrap();
    a.engine.create_replica(&frame, 0).unwrap();
    let replica = a.engine.replica_pfn(&frame).unwrap();
    assert_eq!(a.memory.read_byte(replica), 0xAA);

    // the original changes under the replica; a shared-state read must not
    // refresh it and must not talk to any peer
    a.memory.fill_page(pfn, 0xBB);
    let delivered_before = a.cluster.delivered.load(core::sync::atomic::Ordering::Relaxed);

    let disposition = a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    assert_eq!(mapped(disposition), replica);
    assert_eq!(a.memory.read_byte(replica), 0xAA);
    assert_eq!(
        a.cluster.delivered.load(core::sync::atomic::Ordering::Relaxed),
        delivered_before
    );
    assert_eq!(a.engine.stats().snapshot().replica_found_count, 1);
}

#[test]
fn concurrent_writes_tiebreak_on_acked_count() {
    let nodes = build_cluster(2);
    let (a, b) = (&nodes[0], &nodes[1]);
    let pfn = test_pfn(4);

    // both hosts share the page
    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    b.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();
    b.engine.async_worker_tick();

    // A has completed more ACKs than B, so B has priority
    a.engine.acked_fault_count.store(5, core::sync::atomic::Ordering::Release);
    b.engine.acked_fault_count.store(3, core::sync::atomic::Ordering::Release);

    // A's write fault is mid-flight when B's INVALIDATE arrives
    let a_frame = a.engine.frames.lookup(pfn).unwrap();
    let LocalBegin::Started(a_handle) = a
        .engine
        .faults
        .begin_local(pfn, true, || a.engine.meta_flags(&a_frame))
        .unwrap()
    else {
        panic!("expected to own the handle");
    };

    let disposition = b.engine.handle_fault(&fault_at(pfn, true)).unwrap();
    assert_eq!(mapped(disposition), pfn);
    assert!(b.engine.frames.lookup(pfn).unwrap().is_modified());

    // B won: A was invalidated and its local fault marked for re-execution
    assert!(a_handle.flags().contains(HandleFlags::RETRY));
    assert!(!a_frame.is_shared());
    assert!(a.engine.faults.finish_local(&a_handle));

    // the kernel retries A's fault; it lands on B as a remote INVALIDATE
    let b_flushes_before = b.memory.flushes.lock().len();
    let disposition = a.engine.handle_fault(&fault_at(pfn, true)).unwrap();
    assert_eq!(mapped(disposition), pfn);

    assert!(a_frame.is_modified());
    let b_frame = b.engine.frames.lookup(pfn).unwrap();
    assert!(!b_frame.is_modified());
    assert!(!b_frame.is_shared());
    // B's M copy was written back before the ACK
    assert!(b.memory.flushes.lock().len() > b_flushes_before);
}

#[test]
fn cold_replica_ages_out_and_is_flushed() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let pfn = test_pfn(5);

    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();
    let frame = a.engine.frames.lookup(pfn).unwrap();
    a.engine.create_replica(&frame, 0).unwrap();
    assert_eq!(a.engine.stats().snapshot().allocated_pages, 1);

    // pass 1: never referenced, so the replica moves active -> inactive
    assert_eq!(a.engine.age_active_to_inactive(64), 1);
    assert_eq!(
        a.engine.replicas.list_len(crate::replica::LruList::Inactive),
        1
    );

    // pass 2: still cold, so it is flushed and its DRAM freed
    assert_eq!(a.engine.reclaim_from_inactive(64), 1);
    assert_eq!(a.engine.stats().snapshot().allocated_pages, 0);
    assert!(a.engine.replicas.is_empty());

    // the next fault maps the original again, not a replica
    let disposition = a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    assert_eq!(mapped(disposition), pfn);
}

#[test]
fn referenced_replica_survives_reclaim() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let pfn = test_pfn(6);

    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();
    let frame = a.engine.frames.lookup(pfn).unwrap();
    a.engine.create_replica(&frame, 0).unwrap();

    // accessed between aging passes: stays on the active list
    a.vm.set_young(MappingId(1), pfn.as_u64() - CXL_BASE_PFN);
    assert_eq!(a.engine.age_active_to_inactive(64), 0);
    assert_eq!(
        a.engine.replicas.list_len(crate::replica::LruList::Active),
        1
    );
}

#[test]
fn sync_nack_unwinds_to_fault_retry() {
    let nodes = build_cluster(2);
    let (a, b) = (&nodes[0], &nodes[1]);
    let pfn = test_pfn(7);

    // A holds a clean replica, so a read fault issues a synchronous fetch
    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();
    let frame = a.engine.frames.lookup(pfn).unwrap();
    a.engine.create_replica(&frame, 0).unwrap();
    frame.clear_flags(PageFlags::SHARED | PageFlags::MODIFIED);

    // B is busy writing the same page
    let b_frame = b.engine.frames.frame(pfn);
    let LocalBegin::Started(b_handle) = b
        .engine
        .faults
        .begin_local(pfn, true, || b.engine.meta_flags(&b_frame))
        .unwrap()
    else {
        panic!("expected to own the handle");
    };

    let disposition = a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    assert_eq!(disposition, FaultDisposition::Retry);
    // the handle was destroyed so the retried fault starts clean
    assert!(!a.engine.faults.contains(pfn));
    assert_eq!(a.engine.stations.in_use(), 0);

    b.engine.faults.finish_local(&b_handle);
}

#[test]
fn nacked_async_fetch_is_reissued_not_dropped() {
    let nodes = build_cluster(2);
    let (a, b) = (&nodes[0], &nodes[1]);
    let pfn = test_pfn(8);

    // B is busy writing, so A's async fetch gets NACKed
    let b_frame = b.engine.frames.frame(pfn);
    let LocalBegin::Started(b_handle) = b
        .engine
        .faults
        .begin_local(pfn, true, || b.engine.meta_flags(&b_frame))
        .unwrap()
    else {
        panic!("expected to own the handle");
    };

    let disposition = a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    assert_eq!(mapped(disposition), pfn);
    let work = a.engine.async_queue.pop().unwrap();
    assert!(work.nacked);
    a.engine.async_queue.push(work).unwrap();

    // worker re-issues; B still busy, so the retry is NACKed again
    assert_eq!(a.engine.async_worker_tick(), 1);
    assert_eq!(a.engine.async_queue.len(), 1);
    assert!(a.engine.async_queue.pop().unwrap().nacked);

    // B finishes; the next retry completes and clears the transient
    b.engine.faults.finish_local(&b_handle);
    a.engine
        .async_queue
        .push(crate::async_work::AsyncWork {
            original: pfn,
            nacked: true,
        })
        .unwrap();
    // first tick re-issues; the acked completion lands back in the queue
    assert_eq!(a.engine.async_worker_tick(), 1);
    // second tick finalizes the successful fetch
    assert_eq!(a.engine.async_worker_tick(), 1);
    assert!(a.engine.async_inflight.lock().is_empty());
    assert_eq!(a.engine.stations.in_use(), 0);
}

#[test]
fn fetch_then_invalidate_leaves_host_idle() {
    let nodes = build_cluster(2);
    let (a, b) = (&nodes[0], &nodes[1]);
    let pfn = test_pfn(9);
    a.memory.fill_page(pfn, 0x5A);

    // A takes the page exclusive
    a.engine.handle_fault(&fault_at(pfn, true)).unwrap();
    let a_frame = a.engine.frames.lookup(pfn).unwrap();
    assert!(a_frame.is_modified());

    // B fetches: A writes back and downgrades M -> S
    b.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    b.engine.async_worker_tick();
    assert!(a_frame.is_shared());
    assert!(!a_frame.is_modified());
    assert!(!a.memory.flushes.lock().is_empty());

    // B upgrades: A invalidates S -> I
    b.engine.handle_fault(&fault_at(pfn, true)).unwrap();
    assert!(!a_frame.is_shared());
    assert!(!a_frame.is_modified());
    assert!(a.vm.unmap_count() >= 1);
    assert!(b.engine.frames.lookup(pfn).unwrap().is_modified());
}

#[test]
fn metadata_files_and_foreign_frames_bypass_the_engine() {
    let nodes = build_cluster(2);
    let a = &nodes[0];

    for name in ["store.log", "fs.superblock"] {
        let mut fault = fault_at(test_pfn(10), true);
        fault.file_name = name;
        assert_eq!(
            a.engine.handle_fault(&fault).unwrap(),
            FaultDisposition::Bypass
        );
    }

    // below the HDM base: not coherence-managed
    let fault = PageFault {
        pfn: Pfn::new(CXL_BASE_PFN - 1),
        ..fault_at(test_pfn(0), false)
    };
    assert_eq!(
        a.engine.handle_fault(&fault).unwrap(),
        FaultDisposition::Bypass
    );

    // disabled engine: everything passes through
    a.engine.disable();
    assert_eq!(
        a.engine.handle_fault(&fault_at(test_pfn(10), false)).unwrap(),
        FaultDisposition::Bypass
    );
    a.engine.enable();

    assert_eq!(a.engine.stats().snapshot().fault_count, 0);
}

#[test]
fn overload_promotes_async_fetch_to_sync() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let pfn = test_pfn(11);

    a.engine.in_flight.store(
        crate::wait_station::WAIT_STATION_THRESHOLD as i64 + 1,
        core::sync::atomic::Ordering::Release,
    );

    let disposition = a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    assert_eq!(mapped(disposition), pfn);

    // the fetch ran synchronously: nothing parked for the async worker
    assert!(a.engine.async_queue.is_empty());
    assert!(a.engine.async_inflight.lock().is_empty());
    assert!(a.engine.frames.lookup(pfn).unwrap().is_shared());
}

#[test]
fn concurrent_local_writes_serialize_like_serial_execution() {
    extern crate std;
    use std::thread;

    let nodes = build_cluster(1);
    let a = &nodes[0];
    let pfn = test_pfn(12);

    let mut workers = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&a.engine);
        workers.push(thread::spawn(move || loop {
            match engine.handle_fault(&fault_at(pfn, true)).unwrap() {
                FaultDisposition::Mapped(mapped) => break mapped,
                FaultDisposition::Retry => continue,
                FaultDisposition::Bypass => panic!("fault must be coherence-managed"),
            }
        }));
    }
    for worker in workers {
        assert_eq!(worker.join().unwrap(), pfn);
    }

    let frame = a.engine.frames.lookup(pfn).unwrap();
    assert!(frame.is_modified());
    assert!(!frame.is_shared());
    // singleton invariant: no handle left behind
    assert!(!a.engine.faults.contains(pfn));
    // a loser that had to re-execute is counted once per entry
    assert!(a.engine.stats().snapshot().fault_write_count >= 2);
}

#[test]
fn replica_create_then_flush_preserves_contents() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let pfn = test_pfn(13);
    a.memory.fill_page(pfn, 0x77);

    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();
    let frame = a.engine.frames.lookup(pfn).unwrap();
    a.engine.create_replica(&frame, 0).unwrap();

    let slot = frame.replica_slot().unwrap();
    let claimed = a.engine.replicas.claim(slot).unwrap();
    a.engine.flush_replica(claimed).unwrap();

    // user-visible contents of the original are untouched
    assert_eq!(a.memory.read_byte(pfn), 0x77);
    assert!(frame.replica_slot().is_none());
    // access tracking survived the round trip
    assert!(matches!(
        frame.tag(),
        crate::frame::TagWord::Access { .. }
    ));
}

#[test]
fn replica_allocation_retries_through_pressure() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let pfn = test_pfn(14);

    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();
    let frame = a.engine.frames.lookup(pfn).unwrap();

    // two failures are absorbed by the retry loop
    a.memory.fail_next_allocs(2);
    a.engine.create_replica(&frame, 0).unwrap();
    assert!(a.engine.replica_pfn(&frame).is_some());

    // more failures than retries surface as out-of-memory
    let pfn2 = test_pfn(15);
    a.engine.handle_fault(&fault_at(pfn2, false)).unwrap();
    a.engine.async_worker_tick();
    let frame2 = a.engine.frames.lookup(pfn2).unwrap();
    a.memory.fail_next_allocs(10);
    assert!(matches!(
        a.engine.create_replica(&frame2, 0),
        Err(CoherenceError::OutOfMemory { .. })
    ));
    a.memory.fail_next_allocs(0);
}

#[test]
fn duplicate_replica_is_rejected() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let pfn = test_pfn(16);

    a.engine.handle_fault(&fault_at(pfn, false)).unwrap();
    a.engine.async_worker_tick();
    let frame = a.engine.frames.lookup(pfn).unwrap();
    a.engine.create_replica(&frame, 0).unwrap();
    assert!(matches!(
        a.engine.create_replica(&frame, 0),
        Err(CoherenceError::AlreadyReplicated { .. })
    ));
}

#[test]
fn daemon_replicates_hot_pages_and_evicts_cold_ones() {
    let nodes = build_cluster(2);
    let a = &nodes[0];
    let hot = test_pfn(20);
    let cold = test_pfn(21);

    a.engine.handle_fault(&fault_at(hot, false)).unwrap();
    a.engine.handle_fault(&fault_at(cold, false)).unwrap();
    a.engine.async_worker_tick();

    a.engine.replication_start(1000, 20).unwrap();
    assert!(a.engine.replication_running());

    // the cold page already carries a replica with a tiny access count
    let cold_frame = a.engine.frames.lookup(cold).unwrap();
    a.engine.create_replica(&cold_frame, 0).unwrap();

    // hammer the hot page past the default threshold
    a.vm.map_sample(7, 0x7000, hot);
    let needed = 1u32 << crate::replication::DEFAULT_HOTNESS_THRESHOLD;
    for _ in 0..=needed {
        a.sampler.push(0x7000, 7);
    }
    let handled = a.engine.replication_poll();
    assert!(handled as u32 >= needed);

    // histogram conservation: both sampled pages are accounted once
    let hist = a.engine.replication.histogram();
    assert_eq!(hist.iter().sum::<u64>(), 1);

    a.engine.replication_sweep();

    let hot_frame = a.engine.frames.lookup(hot).unwrap();
    assert!(a.engine.replica_pfn(&hot_frame).is_some());
    assert!(a.engine.replica_pfn(&cold_frame).is_none());

    a.engine.replication_stop();
    assert!(!a.engine.replication_running());
}

#[test]
fn samples_off_the_coherence_window_are_dropped() {
    let nodes = build_cluster(2);
    let a = &nodes[0];

    // resolvable, but below the CXL range and never faulted through us
    a.vm.map_sample(3, 0x3000, Pfn::new(0x500));
    a.sampler.push(0x3000, 3);
    // not resolvable at all
    a.sampler.push(0x4000, 3);

    assert_eq!(a.engine.replication_poll(), 0);
    assert_eq!(a.engine.replication.histogram().iter().sum::<u64>(), 0);
}

#[test]
fn double_replication_start_is_busy() {
    let nodes = build_cluster(1);
    let a = &nodes[0];
    a.engine.replication_start(500, 10).unwrap();
    assert!(matches!(
        a.engine.replication_start(500, 10),
        Err(CoherenceError::Busy { .. })
    ));
    a.engine.replication_stop();
}
