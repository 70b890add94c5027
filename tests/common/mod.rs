//! A simulated host runtime: three allocation domains backed by the libc
//! allocator, pluggable allocators per domain, and a scriptable call
//! stack.

use heaptrail::host::{Domain, DomainAllocator, Frame, Host};
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

unsafe fn base_malloc(_ctx: *mut c_void, size: usize) -> *mut c_void {
    unsafe { libc::malloc(size) as *mut c_void }
}

unsafe fn base_calloc(_ctx: *mut c_void, nelem: usize, elsize: usize) -> *mut c_void {
    unsafe { libc::calloc(nelem, elsize) as *mut c_void }
}

unsafe fn base_realloc(_ctx: *mut c_void, ptr: *mut c_void, new_size: usize) -> *mut c_void {
    unsafe { libc::realloc(ptr as *mut libc::c_void, new_size) as *mut c_void }
}

unsafe fn base_free(_ctx: *mut c_void, ptr: *mut c_void) {
    unsafe { libc::free(ptr as *mut libc::c_void) }
}

const LIBC_ALLOCATOR: DomainAllocator = DomainAllocator {
    ctx: std::ptr::null_mut(),
    malloc: base_malloc,
    calloc: base_calloc,
    realloc: base_realloc,
    free: base_free,
};

// An object-domain allocator that delegates to whatever allocator the
// Memory domain currently has, the way the host's object allocator falls
// back to its memory allocator. While a profiler is attached that target
// is the profiler's own wrapper, which is exactly what the reentrancy
// tests need.
unsafe fn chain_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
    let host = unsafe { &*(ctx as *const SimHost) };
    host.malloc(Domain::Memory, size)
}

unsafe fn chain_calloc(ctx: *mut c_void, nelem: usize, elsize: usize) -> *mut c_void {
    let host = unsafe { &*(ctx as *const SimHost) };
    host.calloc(Domain::Memory, nelem, elsize)
}

unsafe fn chain_realloc(ctx: *mut c_void, ptr: *mut c_void, new_size: usize) -> *mut c_void {
    let host = unsafe { &*(ctx as *const SimHost) };
    host.realloc(Domain::Memory, ptr, new_size)
}

unsafe fn chain_free(ctx: *mut c_void, ptr: *mut c_void) {
    let host = unsafe { &*(ctx as *const SimHost) };
    host.free(Domain::Memory, ptr)
}

pub struct SimHost {
    allocators: Mutex<[DomainAllocator; 3]>,
    stack: Mutex<Vec<(String, u32, u64)>>,
}

fn slot(domain: Domain) -> usize {
    match domain {
        Domain::Raw => 0,
        Domain::Memory => 1,
        Domain::Object => 2,
    }
}

impl SimHost {
    pub fn new() -> Arc<SimHost> {
        Arc::new(SimHost {
            allocators: Mutex::new([LIBC_ALLOCATOR; 3]),
            stack: Mutex::new(vec![("app.lua".into(), 12, 0x1)]),
        })
    }

    /// A host whose Object domain delegates to the Memory domain, so one
    /// object allocation reaches the profiler's wrappers twice.
    pub fn new_chaining() -> Arc<SimHost> {
        let host = SimHost::new();
        let chaining = DomainAllocator {
            ctx: Arc::as_ptr(&host) as *mut c_void,
            malloc: chain_malloc,
            calloc: chain_calloc,
            realloc: chain_realloc,
            free: chain_free,
        };
        host.set_allocator(Domain::Object, chaining);
        host
    }

    pub fn set_stack(&self, frames: &[(&str, u32, u64)]) {
        *self.stack.lock().unwrap() = frames
            .iter()
            .map(|(file, line, code)| (file.to_string(), *line, *code))
            .collect();
    }

    fn allocator(&self, domain: Domain) -> DomainAllocator {
        self.allocators.lock().unwrap()[slot(domain)]
    }

    pub fn malloc(&self, domain: Domain, size: usize) -> *mut c_void {
        let a = self.allocator(domain);
        unsafe { (a.malloc)(a.ctx, size) }
    }

    pub fn calloc(&self, domain: Domain, nelem: usize, elsize: usize) -> *mut c_void {
        let a = self.allocator(domain);
        unsafe { (a.calloc)(a.ctx, nelem, elsize) }
    }

    pub fn realloc(&self, domain: Domain, ptr: *mut c_void, new_size: usize) -> *mut c_void {
        let a = self.allocator(domain);
        unsafe { (a.realloc)(a.ctx, ptr, new_size) }
    }

    pub fn free(&self, domain: Domain, ptr: *mut c_void) {
        let a = self.allocator(domain);
        unsafe { (a.free)(a.ctx, ptr) }
    }
}

impl Host for SimHost {
    fn get_allocator(&self, domain: Domain) -> DomainAllocator {
        self.allocator(domain)
    }

    fn set_allocator(&self, domain: Domain, allocator: DomainAllocator) {
        self.allocators.lock().unwrap()[slot(domain)] = allocator;
    }

    fn walk_stack(&self, visit: &mut dyn FnMut(Frame<'_>)) -> bool {
        for (filename, line, code_id) in self.stack.lock().unwrap().iter() {
            visit(Frame {
                filename,
                line: *line,
                code_id: *code_id,
            });
        }
        true
    }
}
