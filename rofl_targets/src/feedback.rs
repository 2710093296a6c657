//! The feedback channel: the coverage map plus the result of the last execution,
//! laid out exactly as the controller expects it in shared memory.

use core::{
    fmt::{self, Debug},
    mem::{align_of, offset_of, size_of},
    ptr,
};

use libc::c_int;

use crate::MAP_SIZE;

/// Written into [`FeedbackChannel::magic`] once a child has completed. "ROFLFUZZ", little-endian.
pub const FEEDBACK_MAGIC: u64 = 0x5a5a55464c464f52;

/// Coverage plus the outcome of the most recently completed child.
///
/// | Offset       | Field          | Size           |
/// |--------------|----------------|----------------|
/// | 0            | `coverage_map` | [`MAP_SIZE`]   |
/// | `MAP_SIZE`   | `magic`        | 8              |
/// | `MAP_SIZE+8` | `status`       | 4, padded to 8 |
#[repr(C)]
pub struct FeedbackChannel {
    /// One saturating hit counter per edge
    pub coverage_map: [u8; MAP_SIZE],
    /// [`FEEDBACK_MAGIC`] once a child finished, else zero
    pub magic: u64,
    /// The raw `waitpid` status of the last child
    pub status: c_int,
}

const _: () = {
    assert!(offset_of!(FeedbackChannel, coverage_map) == 0);
    assert!(offset_of!(FeedbackChannel, magic) == MAP_SIZE);
    assert!(offset_of!(FeedbackChannel, status) == MAP_SIZE + 8);
    assert!(size_of::<FeedbackChannel>() == MAP_SIZE + 16);
    assert!(align_of::<FeedbackChannel>() == 8);
};

impl FeedbackChannel {
    /// An all-zero channel
    #[must_use]
    pub const fn new() -> Self {
        Self {
            coverage_map: [0; MAP_SIZE],
            magic: 0,
            status: 0,
        }
    }

    /// Zero everything: map, magic and status.
    pub fn reset(&mut self) {
        self.coverage_map.fill(0);
        self.magic = 0;
        self.status = 0;
    }

    /// Publish the status of a completed child. The status lands before the magic.
    pub fn record_status(&mut self, status: c_int) {
        unsafe {
            ptr::write_volatile(&raw mut self.status, status);
            ptr::write_volatile(&raw mut self.magic, FEEDBACK_MAGIC);
        }
    }

    /// Whether a child has completed since the last reset
    #[must_use]
    pub fn has_result(&self) -> bool {
        unsafe { ptr::read_volatile(&raw const self.magic) == FEEDBACK_MAGIC }
    }

    /// The number of edges hit at least once
    #[must_use]
    pub fn edges_hit(&self) -> usize {
        self.coverage_map.iter().filter(|&&hits| hits != 0).count()
    }
}

impl Default for FeedbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for FeedbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackChannel")
            .field("edges_hit", &self.edges_hit())
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
