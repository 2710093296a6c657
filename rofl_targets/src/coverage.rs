//! The coverage map instrumentation writes into, reached through the process-wide
//! [`RUNTIME`] context.
//!
//! Before bootstrap binds the real channel, the context hands out a static,
//! zeroed pre-init channel. Edge hooks firing in earlier constructors therefore
//! always write into valid memory.

use core::{
    cell::{Cell, UnsafeCell},
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};
use std::sync::OnceLock;

use libc::c_int;
use rofl_bolts::Error;

use crate::{feedback::FeedbackChannel, MAP_SIZE};

thread_local! {
    /// The previous location, shifted, for AFL-style edge hashing
    static PREV_LOC: Cell<u32> = const { Cell::new(0) };
}

/// What kind of memory the runtime context is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Zeroed memory private to this process. No controller sees it.
    Private,
    /// A mapping shared with the controller
    Shared,
}

/// Holds the feedback channel the runtime currently reports into.
pub struct RuntimeContext {
    pre_init: UnsafeCell<FeedbackChannel>,
    channel: AtomicPtr<FeedbackChannel>,
    binding: OnceLock<Binding>,
}

// # Safety
// The channel pointer is published once through an atomic. The memory behind
// it is plain bytes that edge hooks update in place, as instrumented C code does.
unsafe impl Sync for RuntimeContext {}

/// The runtime context of this process
pub static RUNTIME: RuntimeContext = RuntimeContext::new();

impl RuntimeContext {
    /// A context that points at its own zeroed pre-init channel
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pre_init: UnsafeCell::new(FeedbackChannel::new()),
            channel: AtomicPtr::new(ptr::null_mut()),
            binding: OnceLock::new(),
        }
    }

    /// Point this context at `channel`. Can only happen once.
    ///
    /// # Safety
    /// `channel` must be valid, aligned and writable for the remaining lifetime
    /// of the process.
    pub unsafe fn bind(&self, channel: *mut FeedbackChannel, binding: Binding) -> Result<(), Error> {
        if channel.is_null() || !channel.is_aligned() {
            return Err(Error::illegal_argument(
                "Feedback channel must be non-null and aligned",
            ));
        }
        if self.binding.set(binding).is_err() {
            return Err(Error::illegal_state(
                "runtime context has been bound before",
            ));
        }
        self.channel.store(channel, Ordering::Release);
        log::debug!("Bound {binding:?} feedback channel at {channel:p}");
        Ok(())
    }

    /// How the context is bound, `None` before bootstrap
    #[must_use]
    pub fn binding(&self) -> Option<Binding> {
        self.binding.get().copied()
    }

    /// Whether the controller can see what we write
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.binding() == Some(Binding::Shared)
    }

    /// The channel currently reported into. Never null.
    #[must_use]
    pub fn channel_ptr(&self) -> *mut FeedbackChannel {
        let channel = self.channel.load(Ordering::Acquire);
        if channel.is_null() {
            self.pre_init.get()
        } else {
            channel
        }
    }

    /// The start of the current coverage map, [`MAP_SIZE`] bytes long
    #[must_use]
    pub fn coverage_map_ptr(&self) -> *mut u8 {
        unsafe { (&raw mut (*self.channel_ptr()).coverage_map).cast() }
    }

    /// Count the edge from the previous location to `cur_loc`.
    #[inline]
    pub fn record_edge(&self, cur_loc: u32) {
        let prev_loc = PREV_LOC.try_with(Cell::get).unwrap_or(0);
        let idx = (cur_loc ^ prev_loc) as usize % MAP_SIZE;
        unsafe {
            let hits = self.coverage_map_ptr().add(idx);
            *hits = (*hits).saturating_add(1);
        }
        let _ = PREV_LOC.try_with(|prev| prev.set(cur_loc >> 1));
    }

    /// The hit counter of a single map entry
    #[must_use]
    pub fn hits(&self, idx: usize) -> u8 {
        assert!(idx < MAP_SIZE, "map index {idx} out of bounds");
        unsafe { *self.coverage_map_ptr().add(idx) }
    }

    /// Zero the coverage map and restart edge hashing. Idempotent.
    pub fn init_bitmap(&self) {
        unsafe { ptr::write_bytes(self.coverage_map_ptr(), 0, MAP_SIZE) };
        let _ = PREV_LOC.try_with(|prev| prev.set(0));
    }

    /// Zero the whole channel: map, magic and status.
    pub fn reset_channel(&self) {
        unsafe { (*self.channel_ptr()).reset() };
    }

    /// Publish the raw wait status of a completed child.
    pub fn record_child_status(&self, status: c_int) {
        unsafe { (*self.channel_ptr()).record_status(status) };
    }

    /// The current magic value
    #[must_use]
    pub fn magic(&self) -> u64 {
        unsafe { ptr::read_volatile(&raw const (*self.channel_ptr()).magic) }
    }

    /// The last recorded child status
    #[must_use]
    pub fn status(&self) -> c_int {
        unsafe { ptr::read_volatile(&raw const (*self.channel_ptr()).status) }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("channel", &self.channel_ptr())
            .field("binding", &self.binding())
            .finish_non_exhaustive()
    }
}

/// Instrumentation hook: count the edge into `cur_loc`.
#[no_mangle]
pub extern "C" fn __rofl_trace_edge(cur_loc: u32) {
    RUNTIME.record_edge(cur_loc);
}

/// Zero the coverage map and reset edge hashing.
#[no_mangle]
pub extern "C" fn __rofl_init() {
    RUNTIME.init_bitmap();
}

/// The coverage map instrumentation should write into
#[no_mangle]
pub extern "C" fn __rofl_coverage_map() -> *mut u8 {
    RUNTIME.coverage_map_ptr()
}

#[cfg(test)]
mod tests {
    use core::mem::size_of;

    use rofl_bolts::shmem::{shmem_into_raw, PrivateShMem};
    use serial_test::serial;

    use super::{
        Binding, RuntimeContext, __rofl_coverage_map, __rofl_init, __rofl_trace_edge, RUNTIME,
    };
    use crate::{feedback::FeedbackChannel, FEEDBACK_MAGIC, MAP_SIZE};

    fn leaked_channel() -> *mut FeedbackChannel {
        shmem_into_raw(PrivateShMem::new(size_of::<FeedbackChannel>())).unwrap()
    }

    #[test]
    fn test_pre_init_map_is_usable() {
        let ctx = RuntimeContext::new();
        assert_eq!(ctx.binding(), None);
        assert!(!ctx.coverage_map_ptr().is_null());
        ctx.init_bitmap();
        ctx.record_edge(1234);
        assert_eq!(ctx.hits(1234 % MAP_SIZE), 1);
    }

    #[test]
    fn test_edge_hashing() {
        let ctx = RuntimeContext::new();
        ctx.init_bitmap();

        // prev_loc starts at 0, so the first edge lands at cur_loc itself
        ctx.record_edge(0x100);
        assert_eq!(ctx.hits(0x100), 1);
        // then (0x300 ^ (0x100 >> 1)) == 0x380
        ctx.record_edge(0x300);
        assert_eq!(ctx.hits(0x380), 1);
    }

    #[test]
    fn test_hits_saturate() {
        let ctx = RuntimeContext::new();
        for _ in 0..300 {
            ctx.init_bitmap();
            ctx.record_edge(42);
        }
        assert_eq!(ctx.hits(42), 1);

        for _ in 0..300 {
            ctx.record_edge(0);
        }
        assert_eq!(ctx.hits(0), u8::MAX);
    }

    #[test]
    fn test_init_bitmap_is_idempotent() {
        let ctx = RuntimeContext::new();
        ctx.record_edge(7);
        ctx.record_edge(9);
        ctx.init_bitmap();
        ctx.init_bitmap();
        assert!((0..MAP_SIZE).all(|idx| ctx.hits(idx) == 0));
        // prev_loc is back to zero as well
        ctx.record_edge(5);
        assert_eq!(ctx.hits(5), 1);
    }

    #[test]
    fn test_bind_once() {
        let ctx = RuntimeContext::new();
        let channel = leaked_channel();
        unsafe { ctx.bind(channel, Binding::Shared) }.unwrap();
        assert!(ctx.is_shared());
        assert_eq!(ctx.channel_ptr(), channel);
        assert!(unsafe { ctx.bind(leaked_channel(), Binding::Private) }.is_err());
        assert_eq!(ctx.channel_ptr(), channel);
    }

    #[test]
    fn test_bind_rejects_null() {
        let ctx = RuntimeContext::new();
        assert!(unsafe { ctx.bind(core::ptr::null_mut(), Binding::Private) }.is_err());
        assert_eq!(ctx.binding(), None);
    }

    #[test]
    fn test_status_and_reset() {
        let ctx = RuntimeContext::new();
        unsafe { ctx.bind(leaked_channel(), Binding::Private) }.unwrap();
        assert_eq!(ctx.magic(), 0);

        ctx.record_edge(3);
        ctx.record_child_status(9);
        assert_eq!(ctx.magic(), FEEDBACK_MAGIC);
        assert_eq!(ctx.status(), 9);

        ctx.reset_channel();
        assert_eq!(ctx.magic(), 0);
        assert_eq!(ctx.status(), 0);
        assert_eq!(ctx.hits(3), 0);
    }

    #[test]
    #[serial]
    fn test_c_entry_points() {
        let map = __rofl_coverage_map();
        assert_eq!(map, RUNTIME.coverage_map_ptr());

        unsafe {
            *map.add(17) = 3;
            *map.add(MAP_SIZE - 1) = 0xff;
        }
        assert_eq!(RUNTIME.hits(17), 3);
        assert_eq!(RUNTIME.hits(MAP_SIZE - 1), 0xff);

        __rofl_init();
        assert!((0..MAP_SIZE).all(|idx| unsafe { *map.add(idx) } == 0));

        // right after init, prev_loc is zero
        __rofl_trace_edge(0x40);
        __rofl_trace_edge(0x40);
        assert_eq!(RUNTIME.hits(0x40), 1);
        assert_eq!(RUNTIME.hits(0x40 ^ 0x20), 1);
        __rofl_init();
    }
}
