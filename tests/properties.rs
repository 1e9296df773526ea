//! Property-based tests for the scheduler and the event queue

use std::sync::Arc;

use aegis_kernel::arch::SoftArch;
use aegis_kernel::interrupt::{Event, EventKind, EventQueue};
use aegis_kernel::kern::ThreadState;
use aegis_kernel::memory::BumpMemory;
use aegis_kernel::scheduler::{SchedClass, SchedEntity};
use aegis_kernel::{Kernel, KernelConfig, KernelError};
use proptest::prelude::*;

fn boot(cmdline: &str) -> Arc<Kernel<BumpMemory, SoftArch>> {
    let config = KernelConfig::from_cmdline(cmdline).unwrap();
    Kernel::new(config, Arc::new(BumpMemory::with_default_arena()), SoftArch::new()).unwrap()
}

fn sched_class() -> impl Strategy<Value = SchedClass> {
    prop_oneof![
        Just(SchedClass::RealTime),
        Just(SchedClass::Fair),
        Just(SchedClass::Deadline),
    ]
}

#[derive(Debug, Clone, Copy)]
enum CpuOp {
    Tick(usize),
    Block(usize),
    Wake(usize),
}

fn cpu_op() -> impl Strategy<Value = CpuOp> {
    prop_oneof![
        3 => (0usize..3).prop_map(CpuOp::Tick),
        1 => (0usize..8).prop_map(CpuOp::Block),
        1 => (0usize..8).prop_map(CpuOp::Wake),
    ]
}

// ════════════════════════════════════════════════════════════
// Event queue
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Posts beyond capacity fail and never disturb the queued order
    #[test]
    fn event_queue_is_bounded_fifo(posts in 0usize..1500) {
        let q = EventQueue::new();
        let mut accepted = 0;
        for id in 0..posts {
            match q.post(Arc::new(Event::new(EventKind::Timer, id as u64))) {
                Ok(()) => accepted += 1,
                Err(e) => prop_assert_eq!(e, KernelError::ResourceExhausted),
            }
            prop_assert!(q.len() <= q.capacity());
        }
        prop_assert_eq!(accepted, posts.min(1024));

        for id in 0..accepted {
            prop_assert_eq!(q.pop().map(|e| e.id), Some(id as u64));
        }
        prop_assert!(q.is_empty());
    }

    /// Interleaved posts and pops behave like a bounded VecDeque
    #[test]
    fn event_queue_matches_model(ops in prop::collection::vec(any::<bool>(), 0..400)) {
        let q = EventQueue::new();
        let mut model = std::collections::VecDeque::new();
        for (id, post) in ops.into_iter().enumerate() {
            if post {
                q.post(Arc::new(Event::new(EventKind::Io, id as u64))).unwrap();
                model.push_back(id as u64);
            } else {
                prop_assert_eq!(q.pop().map(|e| e.id), model.pop_front());
            }
        }
        prop_assert_eq!(q.len(), model.len());
    }
}

// ════════════════════════════════════════════════════════════
// Scheduler
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The Fair pick is the first entity holding the minimum vruntime
    #[test]
    fn fair_pick_is_minimum(vruntimes in prop::collection::vec(0u64..50, 1..32)) {
        let k = boot("cpus=1");
        let pid = k.pmgr().create_process("p", 0, 0).unwrap();

        let mut tids = Vec::new();
        for &v in &vruntimes {
            let thread = k.pmgr().create_thread(pid, 0, 0).unwrap();
            thread.set_state(ThreadState::Ready);
            let mut se = SchedEntity::new(&thread, SchedClass::Fair);
            se.fair.vruntime = v;
            k.scheduler().enqueue(se).unwrap();
            tids.push(thread.tid());
        }

        let min = *vruntimes.iter().min().unwrap();
        let first = vruntimes.iter().position(|&v| v == min).unwrap();
        let next = k.scheduler().pick_next(0).unwrap().unwrap();
        prop_assert_eq!(next.tid(), tids[first]);
        prop_assert_eq!(k.scheduler().min_vruntime(), min);
        prop_assert_eq!(k.scheduler().total_weight(), 1024 * vruntimes.len() as u64);
    }

    /// Total Fair weight tracks the number of Fair entities through class
    /// changes and dequeues
    #[test]
    fn fair_weight_follows_class(
        classes in prop::collection::vec(sched_class(), 1..16),
        retag in prop::collection::vec(sched_class(), 1..16),
    ) {
        let k = boot("cpus=1");
        let pid = k.pmgr().create_process("p", 0, 0).unwrap();

        let mut tids = Vec::new();
        for &class in &classes {
            tids.push(k.spawn_thread(pid, 0, 0, class).unwrap());
        }
        let mut current = classes.clone();
        for (i, &class) in retag.iter().enumerate() {
            let slot = i % tids.len();
            k.scheduler().set_class(tids[slot], class).unwrap();
            current[slot] = class;
        }

        let fair = current.iter().filter(|&&c| c == SchedClass::Fair).count() as u64;
        prop_assert_eq!(k.scheduler().total_weight(), 1024 * fair);

        k.kill_process(pid).unwrap();
        prop_assert_eq!(k.scheduler().total_weight(), 0);
        prop_assert!(k.scheduler().is_empty());
    }

    /// No thread is ever held by two CPUs, whatever the mix of ticks,
    /// blocks and wakes
    #[test]
    fn one_running_thread_per_cpu(
        threads in 1usize..8,
        ops in prop::collection::vec(cpu_op(), 1..80),
    ) {
        let k = boot("cpus=3 sched.quantum=2");
        let pid = k.pmgr().create_process("p", 0, 0).unwrap();
        let mut tids = Vec::new();
        for _ in 0..threads {
            tids.push(k.spawn_thread(pid, 0, 0, SchedClass::Fair).unwrap());
        }

        for op in ops {
            match op {
                CpuOp::Tick(cpu) => {
                    k.timer_tick(cpu).unwrap();
                }
                CpuOp::Block(i) => {
                    let _ = k.block_thread(tids[i % tids.len()]);
                }
                CpuOp::Wake(i) => {
                    let _ = k.wake_thread(tids[i % tids.len()]);
                }
            }

            let held: Vec<_> = (0..3).filter_map(|cpu| k.current_thread(cpu)).map(|t| t.tid()).collect();
            for (i, tid) in held.iter().enumerate() {
                prop_assert!(!held[i + 1..].contains(tid));
            }

            let running: Vec<_> = tids
                .iter()
                .filter_map(|&tid| k.pmgr().get_thread(tid))
                .filter(|t| t.state() == ThreadState::Running)
                .collect();
            prop_assert!(running.len() <= 3);
            for t in &running {
                let on_cpu = k.current_thread(t.cpu()).map(|c| c.tid());
                prop_assert_eq!(on_cpu, Some(t.tid()));
            }
        }
    }
}
