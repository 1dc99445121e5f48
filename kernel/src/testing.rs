//! Host Test Harness
//!
//! Implements the kernel services the I/O core consumes on top of host
//! threads, so tests can drive the core from ordinary `#[test]` functions
//! and `std::thread` workers.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;
use std::collections::HashMap;
use std::thread::ThreadId;

use crate::config::IoConfig;
use crate::io::IoManager;
use crate::ke::{KProcessorMode, Kirql, Scheduler, PASSIVE_LEVEL};
use crate::mm::{LockOperation, Mdl, MdlFlags, MemoryManager, NonPagedPool, UserBuffer};
use crate::ntstatus::{NtStatus, STATUS_ACCESS_VIOLATION};
use crate::ps::{EThread, QuotaBlock};

/// Per host thread dispatcher state
#[derive(Clone, Default)]
struct HostThreadState {
    irql: Kirql,
    processor: usize,
    thread: Option<Arc<EThread>>,
}

/// Scheduler over host threads
///
/// Each host thread has its own IRQL, processor number and current
/// `EThread`, all starting at passive level on processor 0 with no thread.
pub struct HostScheduler {
    processors: usize,
    threads: Mutex<HashMap<ThreadId, HostThreadState>>,
}

impl HostScheduler {
    pub fn new(processors: usize) -> Self {
        Self {
            processors: processors.max(1),
            threads: Mutex::new(HashMap::new()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HostThreadState) -> R) -> R {
        let mut threads = self.threads.lock();
        f(threads.entry(std::thread::current().id()).or_insert_with(|| HostThreadState {
            irql: PASSIVE_LEVEL,
            ..HostThreadState::default()
        }))
    }

    /// Make `thread` the current thread of the calling host thread
    pub fn set_current_thread(&self, thread: Option<Arc<EThread>>) {
        self.with_state(|state| state.thread = thread);
    }

    /// Pin the calling host thread to `processor`
    pub fn set_current_processor(&self, processor: usize) {
        assert!(processor < self.processors);
        self.with_state(|state| state.processor = processor);
    }
}

impl Scheduler for HostScheduler {
    fn processor_count(&self) -> usize {
        self.processors
    }

    fn current_processor(&self) -> usize {
        self.with_state(|state| state.processor)
    }

    fn current_thread(&self) -> Option<Arc<EThread>> {
        self.with_state(|state| state.thread.clone())
    }

    fn current_irql(&self) -> Kirql {
        self.with_state(|state| state.irql)
    }

    fn raise_irql(&self, new_irql: Kirql) -> Kirql {
        self.with_state(|state| {
            let old = state.irql;
            state.irql = old.max(new_irql);
            old
        })
    }

    fn lower_irql(&self, new_irql: Kirql) {
        self.with_state(|state| state.irql = new_irql);
    }

    fn delay_execution(&self, interval_ms: u32) {
        if interval_ms == 0 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(std::time::Duration::from_millis(interval_ms as u64));
        }
    }
}

/// Memory manager that counts page locks
#[derive(Default)]
pub struct CountingMemoryManager {
    unlocked: AtomicUsize,
    recursive_fault: AtomicBool,
}

impl CountingMemoryManager {
    /// MDLs unlocked so far
    pub fn unlocked(&self) -> usize {
        self.unlocked.load(Ordering::SeqCst)
    }

    /// Report every fault as recursive until cleared
    pub fn set_recursive_fault(&self, recursive: bool) {
        self.recursive_fault.store(recursive, Ordering::SeqCst);
    }
}

impl MemoryManager for CountingMemoryManager {
    fn probe_and_lock_pages(
        &self,
        mdl: &mut Mdl,
        _access_mode: KProcessorMode,
        _operation: LockOperation,
    ) -> Result<(), NtStatus> {
        mdl.flags |= MdlFlags::PAGES_LOCKED;
        Ok(())
    }

    fn unlock_pages(&self, mdl: &mut Mdl) {
        mdl.flags.remove(MdlFlags::PAGES_LOCKED);
        self.unlocked.fetch_add(1, Ordering::SeqCst);
    }

    fn is_recursive_io_fault(&self) -> bool {
        self.recursive_fault.load(Ordering::SeqCst)
    }
}

/// Caller buffer backed by a vector, optionally faulting on write
pub struct VecUserBuffer {
    data: Mutex<Vec<u8>>,
    faulting: AtomicBool,
}

impl VecUserBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; len]),
            faulting: AtomicBool::new(false),
        }
    }

    pub fn set_faulting(&self, faulting: bool) {
        self.faulting.store(faulting, Ordering::SeqCst);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl UserBuffer for VecUserBuffer {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), NtStatus> {
        if self.faulting.load(Ordering::SeqCst) {
            return Err(STATUS_ACCESS_VIOLATION);
        }

        let mut data = self.data.lock();
        let end = offset.checked_add(bytes.len()).filter(|&end| end <= data.len());
        match end {
            Some(end) => {
                data[offset..end].copy_from_slice(bytes);
                Ok(())
            }
            None => Err(STATUS_ACCESS_VIOLATION),
        }
    }
}

/// An I/O manager wired to host services, with a current thread
pub struct TestSystem {
    pub io: Arc<IoManager>,
    pub scheduler: Arc<HostScheduler>,
    pub memory: Arc<CountingMemoryManager>,
    /// Current thread of the host thread that built the system
    pub thread: Arc<EThread>,
}

impl TestSystem {
    pub fn new(processors: usize) -> Self {
        Self::with_config(processors, IoConfig::default())
    }

    pub fn with_config(processors: usize, config: IoConfig) -> Self {
        Self::with_pool(processors, config, Arc::new(NonPagedPool::new()))
    }

    /// A system whose pool refuses allocations past `limit` bytes
    pub fn with_pool_limit(processors: usize, config: IoConfig, limit: usize) -> Self {
        Self::with_pool(processors, config, Arc::new(NonPagedPool::with_limit(limit)))
    }

    fn with_pool(processors: usize, config: IoConfig, pool: Arc<NonPagedPool>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let scheduler = Arc::new(HostScheduler::new(processors));
        let memory = Arc::new(CountingMemoryManager::default());
        let thread = EThread::new(1, Arc::new(QuotaBlock::new()));
        scheduler.set_current_thread(Some(thread.clone()));

        let io = IoManager::with_pool(config, scheduler.clone(), memory.clone(), pool);
        Self {
            io,
            scheduler,
            memory,
            thread,
        }
    }
}
