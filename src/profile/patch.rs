//! Wrapping of the host's allocator domains.
//!
//! Wrapping the host's allocators is not as simple as swapping in a
//! function that logs and delegates. Two subtleties, both inherited from
//! the host's allocation contract:
//!
//! 1. The Memory and Object domains are always invoked with the host's
//!    global coordination lock held, so calls into the profiler from those
//!    domains are already serialized. Raw-domain calls can arrive with no
//!    locking at all, so for those (and only those) a dedicated mutex is
//!    taken around the profiler call. Taking it for the other domains
//!    would deadlock against the host's lock ordering.
//! 2. Domains call each other; an Object malloc may delegate to the Memory
//!    domain for large requests. The [`ReentryGuard`] makes sure only the
//!    outermost call on a thread is profiled, so chained allocations are
//!    not double-counted.
//!
//! Every wrapper calls the underlying allocator first and only then, if
//! the call succeeded and this is the outermost frame, hands the result to
//! the attached profiler.

use crate::error::{Error, Result};
use crate::host::{Domain, DomainAllocator, Host};
use crate::profile::ActiveProfiler;
use crate::profile::guard::ReentryGuard;
use crate::profile::recording::Recorder;
use crate::profile::stats::StatsProfiler;
use crate::sampler::Sampler;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A static cell whose contents are guarded by the locking discipline
/// described in the module docs rather than by the type system.
struct SlotCell<T>(UnsafeCell<T>);

// SAFETY: every access goes through `profile_with` or the installer path,
// which serialize via the host coordination lock, RAW_LOCK, and INSTALLER.
unsafe impl<T> Sync for SlotCell<T> {}

impl<T> SlotCell<T> {
    const fn new(value: T) -> Self {
        SlotCell(UnsafeCell::new(value))
    }

    fn get(&self) -> *mut T {
        self.0.get()
    }
}

struct Installed {
    host: Arc<dyn Host>,
    profiler: ActiveProfiler,
}

struct BaseAllocators {
    raw: DomainAllocator,
    mem: DomainAllocator,
    obj: DomainAllocator,
}

/// Serializes attach and detach against each other.
static INSTALLER: Mutex<()> = Mutex::new(());
/// Serializes raw-domain profiler calls (see module docs).
static RAW_LOCK: Mutex<()> = Mutex::new(());
/// Fast-path answer for `is_profiling`.
static ATTACHED: AtomicBool = AtomicBool::new(false);
/// The attached profiler, if any.
static SLOT: SlotCell<Option<Installed>> = SlotCell::new(None);
/// The base allocators captured at attach time. Each wrapper receives a
/// pointer to its domain's entry as its context, which doubles as the
/// domain tag for the raw-lock decision.
static BASE: SlotCell<BaseAllocators> = SlotCell::new(BaseAllocators {
    raw: UNSET_ALLOCATOR,
    mem: UNSET_ALLOCATOR,
    obj: UNSET_ALLOCATOR,
});

const UNSET_ALLOCATOR: DomainAllocator = DomainAllocator {
    ctx: ptr::null_mut(),
    malloc: unset_malloc,
    calloc: unset_calloc,
    realloc: unset_realloc,
    free: unset_free,
};

unsafe fn unset_malloc(_ctx: *mut c_void, _size: usize) -> *mut c_void {
    ptr::null_mut()
}

unsafe fn unset_calloc(_ctx: *mut c_void, _nelem: usize, _elsize: usize) -> *mut c_void {
    ptr::null_mut()
}

unsafe fn unset_realloc(_ctx: *mut c_void, _ptr: *mut c_void, _size: usize) -> *mut c_void {
    ptr::null_mut()
}

unsafe fn unset_free(_ctx: *mut c_void, _ptr: *mut c_void) {}

fn base_entry(domain: Domain) -> *mut DomainAllocator {
    let base = BASE.get();
    unsafe {
        match domain {
            Domain::Raw => &raw mut (*base).raw,
            Domain::Memory => &raw mut (*base).mem,
            Domain::Object => &raw mut (*base).obj,
        }
    }
}

fn wrapper_allocator(domain: Domain) -> DomainAllocator {
    DomainAllocator {
        ctx: base_entry(domain) as *mut c_void,
        malloc: wrapped_malloc,
        calloc: wrapped_calloc,
        realloc: wrapped_realloc,
        free: wrapped_free,
    }
}

fn lock<'a>(mutex: &'a Mutex<()>) -> MutexGuard<'a, ()> {
    // A panic can never propagate out of an allocator hook, so a poisoned
    // lock is taken as-is.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `op` against the attached profiler under the serialization the
/// calling domain requires. `ctx` is the wrapper context and identifies
/// the domain.
fn profile_with(ctx: *mut c_void, op: impl FnOnce(&mut ActiveProfiler)) {
    let is_raw = ctx == base_entry(Domain::Raw) as *mut c_void;
    let _serial = is_raw.then(|| lock(&RAW_LOCK));

    // SAFETY: Memory/Object calls arrive under the host's coordination
    // lock; Raw calls hold RAW_LOCK, which attach/detach also take while
    // mutating the slot. Either way no other frame touches it right now.
    if let Some(installed) = unsafe { (*SLOT.get()).as_mut() } {
        op(&mut installed.profiler);
    }
}

unsafe fn wrapped_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
    let base = unsafe { &*(ctx as *const DomainAllocator) };
    let scope = ReentryGuard::enter();
    let ptr = unsafe { (base.malloc)(base.ctx, size) };
    if !ptr.is_null() && scope.is_top_level() {
        profile_with(ctx, |profiler| profiler.handle_malloc(ptr, size));
    }
    ptr
}

unsafe fn wrapped_calloc(ctx: *mut c_void, nelem: usize, elsize: usize) -> *mut c_void {
    let base = unsafe { &*(ctx as *const DomainAllocator) };
    let scope = ReentryGuard::enter();
    let ptr = unsafe { (base.calloc)(base.ctx, nelem, elsize) };
    if !ptr.is_null() && scope.is_top_level() {
        // The multiplication cannot overflow here: the base allocator just
        // satisfied a request for this many bytes.
        profile_with(ctx, |profiler| profiler.handle_malloc(ptr, nelem * elsize));
    }
    ptr
}

unsafe fn wrapped_realloc(ctx: *mut c_void, old: *mut c_void, new_size: usize) -> *mut c_void {
    let base = unsafe { &*(ctx as *const DomainAllocator) };
    let scope = ReentryGuard::enter();
    let ptr = unsafe { (base.realloc)(base.ctx, old, new_size) };
    if !ptr.is_null() && scope.is_top_level() {
        profile_with(ctx, |profiler| profiler.handle_realloc(old, ptr, new_size));
    }
    ptr
}

unsafe fn wrapped_free(ctx: *mut c_void, ptr: *mut c_void) {
    let base = unsafe { &*(ctx as *const DomainAllocator) };
    let scope = ReentryGuard::enter();
    unsafe { (base.free)(base.ctx, ptr) };
    if scope.is_top_level() {
        profile_with(ctx, |profiler| profiler.handle_free(ptr));
    }
}

/// Capture the host's base allocators, install the wrappers, and publish
/// the profiler in the process-wide slot.
fn attach(host: Arc<dyn Host>, profiler: ActiveProfiler) -> Result<()> {
    let _installer = lock(&INSTALLER);
    if ATTACHED.load(Ordering::SeqCst) {
        return Err(Error::AlreadyAttached);
    }

    unsafe {
        let base = BASE.get();
        (*base).raw = host.get_allocator(Domain::Raw);
        (*base).mem = host.get_allocator(Domain::Memory);
        (*base).obj = host.get_allocator(Domain::Object);
    }

    {
        let _serial = lock(&RAW_LOCK);
        unsafe {
            *SLOT.get() = Some(Installed {
                host: Arc::clone(&host),
                profiler,
            });
        }
    }
    ATTACHED.store(true, Ordering::SeqCst);

    for domain in Domain::ALL {
        host.set_allocator(domain, wrapper_allocator(domain));
    }
    Ok(())
}

/// Restore the base allocators and drop the profiler. Idempotent.
fn detach() {
    let _installer = lock(&INSTALLER);
    if !ATTACHED.load(Ordering::SeqCst) {
        return;
    }

    let host = {
        let _serial = lock(&RAW_LOCK);
        unsafe { (*SLOT.get()).as_ref().map(|i| Arc::clone(&i.host)) }
    };
    if let Some(host) = &host {
        for domain in Domain::ALL {
            host.set_allocator(domain, unsafe { *base_entry(domain) });
        }
    }

    let installed = {
        let _serial = lock(&RAW_LOCK);
        ATTACHED.store(false, Ordering::SeqCst);
        unsafe { (*SLOT.get()).take() }
    };
    // Dropped outside the locks: the stats histogram prints here and the
    // recorder reports any dropped writes.
    drop(installed);
}

/// Start recording a heap profile to `{filebase}.hpm` / `{filebase}.hpd`.
///
/// `sampling_rates` maps allocation-size thresholds to probabilities: an
/// allocation of `n` bytes is sampled with the probability of the smallest
/// entry whose size exceeds `n`, or always when `n` is beyond the table.
pub fn start_profiler(
    host: Arc<dyn Host>,
    filebase: &Path,
    sampling_rates: &[(u64, f64)],
) -> Result<()> {
    if is_profiling() {
        return Err(Error::AlreadyAttached);
    }
    let sampler = Sampler::new(sampling_rates)?;
    let recorder = Recorder::create(Arc::clone(&host), filebase, sampler)?;
    attach(host, ActiveProfiler::Recording(recorder))
}

/// Start profiling in stats mode: no files are written, and a histogram of
/// allocation sizes is printed to stderr when profiling stops.
pub fn start_stats(host: Arc<dyn Host>) -> Result<()> {
    attach(host, ActiveProfiler::Stats(StatsProfiler::new()))
}

/// Stop profiling and restore the host's allocators. Safe to call when not
/// profiling.
pub fn stop() {
    detach();
}

pub fn is_profiling() -> bool {
    ATTACHED.load(Ordering::SeqCst)
}
