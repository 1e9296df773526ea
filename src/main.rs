//! Aegis hosted simulator
//!
//! Boots the kernel core on the software architecture backend, spawns a few
//! processes across the scheduling classes and drives the timer interrupt.
//! Arguments are read as a kernel command line, e.g.
//! `aegis-sim cpus=2 sched.quantum=4 loglevel=debug`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aegis_kernel::arch::SoftArch;
use aegis_kernel::console::{init_logger, StdoutSink};
use aegis_kernel::interrupt::{Event, EventKind, InterruptTrigger};
use aegis_kernel::memory::BumpMemory;
use aegis_kernel::scheduler::SchedClass;
use aegis_kernel::types::DevId;
use aegis_kernel::{Dispatch, Kernel, KernelConfig, KernelResult, NAME, VERSION};

/// Timer interrupts delivered per CPU
const SIM_TICKS: u64 = 40;
/// IRQ line of the simulated disk
const DISK_IRQ: u32 = 14;

fn main() {
    let cmdline = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if let Err(e) = run(&cmdline) {
        eprintln!("aegis-sim: {}", e);
        std::process::exit(1);
    }
}

fn run(cmdline: &str) -> KernelResult<()> {
    let config = KernelConfig::from_cmdline(cmdline)?;
    init_logger(Box::new(StdoutSink), config.log_level);
    log::info!("{} {} simulator", NAME, VERSION);

    let cpus = config.max_cpus;
    let kernel = Kernel::new(config, Arc::new(BumpMemory::with_default_arena()), SoftArch::new())?;
    kernel.install_timer()?;

    let (init, _) = kernel.spawn_process("init", 0x40_0000, 0, SchedClass::RealTime)?;
    let (shell, shell_tid) = kernel.spawn_process("shell", 0x50_0000, 10, SchedClass::Fair)?;
    kernel.spawn_thread(shell, 0x50_1000, 1, SchedClass::Fair)?;
    let (_, batch) = kernel.spawn_process("batch", 0x60_0000, 20, SchedClass::Fair)?;
    let (_, rt) = kernel.spawn_process("rt-audio", 0x70_0000, 0, SchedClass::Deadline)?;
    kernel.scheduler().set_deadline_params(rt, 2, 8, 16)?;

    // init does its work and leaves
    for tid in kernel.pmgr().thread_ids(init)? {
        kernel.exit_thread(tid)?;
    }

    // Disk completions are deferred to the event queue
    let completions = Arc::new(AtomicU64::new(0));
    let irq_kernel = Arc::downgrade(&kernel);
    let done = completions.clone();
    kernel.irq().register_irq(
        DISK_IRQ,
        move |irq, dev| {
            let done = done.clone();
            let event = Event::new(EventKind::Io, u64::from(irq))
                .with_data(Arc::new(dev))
                .with_handler(move |e| {
                    done.fetch_add(1, Ordering::Relaxed);
                    log::debug!("io completion from {:?}", e.data_as::<Option<DevId>>());
                });
            if let Some(kernel) = irq_kernel.upgrade() {
                let _ = kernel.irq().post_event(Arc::new(event));
            }
        },
        Some(DevId(0xd15c)),
        InterruptTrigger::Level,
    )?;

    let timer = kernel.config().timer_irq;
    for tick in 0..SIM_TICKS {
        for cpu in 0..cpus {
            kernel.arch().set_current_cpu(cpu);
            kernel.irq().dispatch_irq(timer)?;
        }

        match tick {
            5 => kernel.block_thread(shell_tid)?,
            12 => kernel.wake_thread(shell_tid)?,
            20 => kernel.kill_thread(batch)?,
            _ => {}
        }
        if tick % 7 == 0 {
            kernel.irq().dispatch_irq(DISK_IRQ)?;
        }
        kernel.irq().process_events();
    }

    for cpu in 0..cpus {
        match kernel.current_thread(cpu) {
            Some(thread) => log::info!("cpu {}: running thread {}", cpu, thread.tid()),
            None => log::info!("cpu {}: {:?}", cpu, Dispatch::Idle),
        }
    }
    for pid in kernel.pmgr().pids() {
        if let Some(info) = kernel.pmgr().get_process(pid) {
            log::info!(
                "process {} '{}': {:?}, {} threads, {} ticks",
                info.pid,
                info.name,
                info.state,
                info.thread_count,
                info.cpu_time
            );
        }
    }

    let report = kernel.balance_load();
    log::info!(
        "load: avg {} overloaded {:?} underloaded {:?}",
        report.average,
        report.overloaded,
        report.underloaded
    );
    log::info!("io completions handled: {}", completions.load(Ordering::Relaxed));
    kernel.counters().log();
    Ok(())
}
