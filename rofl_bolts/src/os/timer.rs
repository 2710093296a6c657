//! Virtual-time interval timers.
//!
//! `ITIMER_VIRTUAL` only counts CPU time spent by the process itself, so an
//! execution blocked on I/O does not burn its budget. Expiry delivers
//! `SIGVTALRM`, whose default action terminates the process.
use core::{ptr::null_mut, time::Duration};

use libc::{itimerval, setitimer, suseconds_t, time_t, timeval, ITIMER_VIRTUAL};

use crate::Error;

fn duration_to_timeval(duration: Duration) -> timeval {
    timeval {
        tv_sec: duration.as_secs() as time_t,
        tv_usec: suseconds_t::from(duration.subsec_micros() as i32),
    }
}

fn set_virtual_timer(mut value: itimerval) -> Result<(), Error> {
    if unsafe { setitimer(ITIMER_VIRTUAL, &raw mut value, null_mut()) } != 0 {
        return Err(Error::last_os_error("setitimer(ITIMER_VIRTUAL) failed"));
    }
    Ok(())
}

/// Arms a one-shot virtual-time timer that fires after `timeout` of CPU time.
///
/// A zero `timeout` disarms the timer instead.
pub fn arm_virtual_timer(timeout: Duration) -> Result<(), Error> {
    set_virtual_timer(itimerval {
        it_interval: duration_to_timeval(Duration::ZERO),
        it_value: duration_to_timeval(timeout),
    })
}

/// Disarms a pending virtual-time timer.
pub fn disarm_virtual_timer() -> Result<(), Error> {
    arm_virtual_timer(Duration::ZERO)
}

/// The remaining CPU time until the virtual-time timer fires, if it is armed.
pub fn virtual_timer_remaining() -> Result<Option<Duration>, Error> {
    let mut current: itimerval = unsafe { core::mem::zeroed() };
    if unsafe { libc::getitimer(ITIMER_VIRTUAL, &raw mut current) } != 0 {
        return Err(Error::last_os_error("getitimer(ITIMER_VIRTUAL) failed"));
    }
    let value = current.it_value;
    if value.tv_sec == 0 && value.tv_usec == 0 {
        return Ok(None);
    }
    #[expect(clippy::cast_sign_loss)]
    let remaining =
        Duration::from_secs(value.tv_sec as u64) + Duration::from_micros(value.tv_usec as u64);
    Ok(Some(remaining))
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use serial_test::serial;

    use super::{
        arm_virtual_timer, disarm_virtual_timer, duration_to_timeval, virtual_timer_remaining,
    };

    #[test]
    fn test_duration_to_timeval() {
        let tv = duration_to_timeval(Duration::from_millis(70));
        assert_eq!(tv.tv_sec, 0);
        assert_eq!(tv.tv_usec, 70_000);

        let tv = duration_to_timeval(Duration::from_millis(2_500));
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec, 500_000);
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_arm_and_disarm() {
        // Far in the future, so it never fires in the test process.
        arm_virtual_timer(Duration::from_secs(3600)).unwrap();
        let remaining = virtual_timer_remaining().unwrap().unwrap();
        assert!(remaining > Duration::from_secs(3500));

        disarm_virtual_timer().unwrap();
        assert_eq!(virtual_timer_remaining().unwrap(), None);
    }
}
