use core::{
    alloc::{GlobalAlloc, Layout},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Wraps a [`GlobalAlloc`] with an optional byte counter, so operators can see
/// live memory use on the `/metrics` endpoint without a separate profiler.
pub struct Allocator<A> {
    inner: A,
    metering: AtomicBool,
    allocated: AtomicUsize,
}

pub struct StdAlloc;

#[cfg(feature = "mimalloc")]
pub type MiMalloc = mimalloc::MiMalloc;

unsafe impl GlobalAlloc for StdAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        std::alloc::System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        std::alloc::System.dealloc(ptr, layout);
    }
}

impl<A> Allocator<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            metering: AtomicBool::new(false),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn start_metering(&self) {
        self.metering.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if self.metering.load(Ordering::Relaxed) {
            self.allocated.fetch_add(layout.size(), Ordering::Relaxed);
        }
        self.inner.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if self.metering.load(Ordering::Relaxed) {
            self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
        }
        self.inner.dealloc(ptr, layout);
    }
}

#[must_use]
pub const fn new_std() -> Allocator<StdAlloc> {
    Allocator::new(StdAlloc)
}

#[cfg(feature = "mimalloc")]
#[must_use]
pub const fn new_mimalloc() -> Allocator<MiMalloc> {
    Allocator::new(mimalloc::MiMalloc)
}
