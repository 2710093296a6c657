//! Process-startup sequencing: bind the feedback channel, clear the map, and hand
//! off to the forkserver.

use core::mem::size_of;

use rofl_bolts::{
    os,
    shmem::{shmem_into_raw, PrivateShMem},
    Error, SimpleStderrLogger,
};

use crate::{
    binder::map_shared_region,
    config::RuntimeConfig,
    coverage::{Binding, RuntimeContext, RUNTIME},
    feedback::FeedbackChannel,
    forkserver::{start_forkserver, ForkserverParent, ForkserverState, StdForkserverParent},
};

/// Bootstrap the process-wide [`RUNTIME`] from the environment.
///
/// In fork-server mode this only returns in a child.
pub fn bootstrap() -> Result<ForkserverState, Error> {
    // Only take over the log level if nobody else registered a logger.
    let own_logger = SimpleStderrLogger::set_logger().is_ok();
    if own_logger {
        log::set_max_level(log::LevelFilter::Warn);
    }
    let config = RuntimeConfig::from_env_lossy();
    if own_logger {
        log::set_max_level(config.log_level());
    }

    bootstrap_with(&RUNTIME, &config, &mut StdForkserverParent::new())
}

/// Bind `ctx` to a shared channel (or private memory, if there is none),
/// initialize the map, and start the forkserver on a shared channel.
pub fn bootstrap_with<P: ForkserverParent>(
    ctx: &RuntimeContext,
    config: &RuntimeConfig,
    forkserver_parent: &mut P,
) -> Result<ForkserverState, Error> {
    let size = size_of::<FeedbackChannel>();
    let (channel, binding) = match map_shared_region(config.shm_fd(), size) {
        Some(shmem) => (shmem_into_raw::<FeedbackChannel, _>(shmem)?, Binding::Shared),
        None => (
            shmem_into_raw::<FeedbackChannel, _>(PrivateShMem::new(size))?,
            Binding::Private,
        ),
    };
    // # Safety
    // Both maps were leaked above and live until the process exits.
    unsafe { ctx.bind(channel, binding) }?;
    ctx.init_bitmap();

    start_forkserver(ctx, config, forkserver_parent)
}

/// Run [`bootstrap`], and exit if it fails.
///
/// An error in the resident parent must not fall through into target code,
/// so this never returns on failure.
pub fn autorun() {
    match bootstrap() {
        Ok(ForkserverState::Standalone) => log::debug!("No feedback segment, running standalone"),
        Ok(ForkserverState::Child) => {}
        Err(err) => {
            log::error!("rofl runtime failed: {err}");
            os::exit(1);
        }
    }
}

#[cfg(feature = "autorun")]
#[ctor::ctor]
fn rofl_autorun() {
    autorun();
}
