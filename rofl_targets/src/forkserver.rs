//! Forkserver logic into targets
//!
//! The resident parent stops itself with `SIGSTOP`. Each `SIGCONT` from the
//! controller buys exactly one execution: the parent forks, the child returns
//! into target code, and the parent reaps it and publishes the raw status in
//! the feedback channel before stopping again.

use std::sync::OnceLock;

use libc::c_int;
use nix::sys::signal::{self, SigHandler, Signal};
use rofl_bolts::{
    os::{self, timer::arm_virtual_timer, ChildHandle, ForkResult},
    Error,
};

use crate::{config::RuntimeConfig, coverage::RuntimeContext, reset::reset_run};

/// Parent to handle all logics with forkserver children
pub trait ForkserverParent {
    /// Conduct initializing routine before the loop.
    fn pre_fuzzing(&mut self) -> Result<(), Error>;

    /// Block until the controller requests the next execution.
    fn await_controller(&mut self) -> Result<(), Error>;

    /// Spawn the child for one execution.
    fn spawn_child(&mut self) -> Result<ForkResult, Error>;

    /// Get a freshly forked child ready to run target code.
    fn prepare_child(&mut self, ctx: &RuntimeContext, config: &RuntimeConfig)
        -> Result<(), Error>;

    /// Wait until the child has done its part, and return its raw wait status.
    fn handle_child_requests(&mut self, child: &ChildHandle) -> Result<c_int, Error>;
}

/// The forkserver parent driven by `SIGSTOP`/`SIGCONT`, forking once per execution.
#[derive(Debug, Default)]
pub struct StdForkserverParent {
    old_sigchld_handler: Option<SigHandler>,
}

impl StdForkserverParent {
    /// Create a new forkserver parent.
    #[must_use]
    pub fn new() -> Self {
        StdForkserverParent::default()
    }
}

impl ForkserverParent for StdForkserverParent {
    fn pre_fuzzing(&mut self) -> Result<(), Error> {
        // An ignored SIGCHLD would make the kernel reap children behind our back.
        let old_sigchld_handler = (unsafe { signal::signal(Signal::SIGCHLD, SigHandler::SigDfl) })
            .inspect_err(|_| {
                log::error!("Fail to swap signal handler for SIGCHLD.");
            })?;
        self.old_sigchld_handler = Some(old_sigchld_handler);
        Ok(())
    }

    fn await_controller(&mut self) -> Result<(), Error> {
        os::stop_self()
    }

    fn spawn_child(&mut self) -> Result<ForkResult, Error> {
        os::flush_std_streams();
        let fork_result = unsafe { os::fork() }?;
        if let ForkResult::Child = fork_result {
            if let Some(handler) = self.old_sigchld_handler.take() {
                unsafe { signal::signal(Signal::SIGCHLD, handler) }.inspect_err(|_| {
                    log::error!("Fail to restore signal handler for SIGCHLD.");
                })?;
            }
        }
        Ok(fork_result)
    }

    fn prepare_child(
        &mut self,
        ctx: &RuntimeContext,
        config: &RuntimeConfig,
    ) -> Result<(), Error> {
        arm_virtual_timer(config.timeout())?;
        reset_run(ctx, config);
        Ok(())
    }

    fn handle_child_requests(&mut self, child: &ChildHandle) -> Result<c_int, Error> {
        child.wait_status()
    }
}

/// Success state when [`start_forkserver`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkserverState {
    /// No shared feedback channel is bound. The target runs once, in this process.
    Standalone,
    /// Current process is a spawned child.
    Child,
}

/// Guard [`start_forkserver`] is invoked only once
static FORKSERVER_GUARD: OnceLock<()> = OnceLock::new();

/// Start a forkserver, using `forkserver_parent` to interact with forked children.
///
/// Without a shared channel bound to `ctx`, this returns
/// [`ForkserverState::Standalone`] right away. Otherwise it only ever returns
/// in a child, or with an error in the parent.
pub fn start_forkserver<P: ForkserverParent>(
    ctx: &RuntimeContext,
    config: &RuntimeConfig,
    forkserver_parent: &mut P,
) -> Result<ForkserverState, Error> {
    if !ctx.is_shared() {
        return Ok(ForkserverState::Standalone);
    }
    if FORKSERVER_GUARD.set(()).is_err() {
        return Err(Error::illegal_state("forkserver has been started before"));
    }
    start_forkserver_internal(ctx, config, forkserver_parent)
}

fn start_forkserver_internal<P: ForkserverParent>(
    ctx: &RuntimeContext,
    config: &RuntimeConfig,
    forkserver_parent: &mut P,
) -> Result<ForkserverState, Error> {
    if !ctx.is_shared() {
        return Ok(ForkserverState::Standalone);
    }
    log::info!(
        "Running forkserver, timeout {} ms",
        config.timeout().as_millis()
    );

    forkserver_parent.pre_fuzzing()?;

    loop {
        forkserver_parent.await_controller()?;

        let fork_result = match forkserver_parent.spawn_child() {
            Ok(fork_result) => fork_result,
            Err(err) => {
                log::error!("Could not fork: {err}");
                continue;
            }
        };

        match fork_result {
            ForkResult::Child => {
                forkserver_parent.prepare_child(ctx, config)?;
                return Ok(ForkserverState::Child);
            }
            ForkResult::Parent(child) => {
                let status = forkserver_parent.handle_child_requests(&child)?;
                log::debug!("Child {} finished with status {status:#x}", child.pid);
                ctx.record_child_status(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::mem::size_of;
    use std::collections::VecDeque;

    use libc::c_int;
    use rofl_bolts::{
        os::{ChildHandle, ForkResult},
        shmem::{shmem_into_raw, PrivateShMem},
        Error,
    };
    use serial_test::serial;

    use super::{start_forkserver, start_forkserver_internal, ForkserverParent, ForkserverState};
    use crate::{
        config::RuntimeConfig,
        coverage::{Binding, RuntimeContext},
        feedback::FeedbackChannel,
        reset::reset_run,
        FEEDBACK_MAGIC,
    };

    /// One scripted step of a fake fork.
    enum Step {
        Exit(c_int),
        ForkFails,
        Child,
    }

    /// Plays back fork outcomes instead of forking, and runs out of controller
    /// requests when the script ends.
    struct ScriptedParent {
        script: VecDeque<Step>,
        status: c_int,
        /// magic seen by the controller at every request
        observed_magic: Vec<u64>,
        ctx: &'static RuntimeContext,
        prepared: bool,
    }

    impl ScriptedParent {
        fn new(ctx: &'static RuntimeContext, script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                status: 0,
                observed_magic: vec![],
                ctx,
                prepared: false,
            }
        }
    }

    impl ForkserverParent for ScriptedParent {
        fn pre_fuzzing(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn await_controller(&mut self) -> Result<(), Error> {
            self.observed_magic.push(self.ctx.magic());
            if self.script.is_empty() {
                return Err(Error::unknown("controller went away"));
            }
            Ok(())
        }

        fn spawn_child(&mut self) -> Result<ForkResult, Error> {
            match self.script.pop_front() {
                Some(Step::Exit(status)) => {
                    self.status = status;
                    Ok(ForkResult::Parent(ChildHandle { pid: 4242 }))
                }
                Some(Step::Child) => Ok(ForkResult::Child),
                Some(Step::ForkFails) | None => Err(Error::unknown("fork")),
            }
        }

        fn prepare_child(
            &mut self,
            ctx: &RuntimeContext,
            config: &RuntimeConfig,
        ) -> Result<(), Error> {
            // no timer, we are not really a child
            reset_run(ctx, config);
            self.prepared = true;
            Ok(())
        }

        fn handle_child_requests(&mut self, child: &ChildHandle) -> Result<c_int, Error> {
            assert_eq!(child.pid, 4242);
            // the "child" ran target code and hit an edge
            self.ctx.record_edge(77);
            Ok(self.status)
        }
    }

    fn shared_context() -> &'static RuntimeContext {
        let ctx: &'static RuntimeContext = Box::leak(Box::<RuntimeContext>::default());
        let channel = shmem_into_raw(PrivateShMem::new(size_of::<FeedbackChannel>())).unwrap();
        unsafe { ctx.bind(channel, Binding::Shared) }.unwrap();
        ctx
    }

    #[test]
    fn test_standalone_without_shared_channel() {
        let ctx: &'static RuntimeContext = Box::leak(Box::<RuntimeContext>::default());
        let mut parent = ScriptedParent::new(ctx, vec![Step::Exit(0)]);
        let state = start_forkserver_internal(ctx, &RuntimeConfig::new(), &mut parent).unwrap();
        assert_eq!(state, ForkserverState::Standalone);
        // never stopped, never forked
        assert!(parent.observed_magic.is_empty());
        assert_eq!(parent.script.len(), 1);
    }

    #[test]
    fn test_parent_records_each_status() {
        let ctx = shared_context();
        let mut parent =
            ScriptedParent::new(ctx, vec![Step::Exit(7 << 8), Step::ForkFails, Step::Exit(9)]);

        let res = start_forkserver_internal(ctx, &RuntimeConfig::new(), &mut parent);
        assert!(matches!(res, Err(Error::Unknown(_))));

        // magic is only there once a child completed, and a failed fork records nothing
        assert_eq!(parent.observed_magic, [0, FEEDBACK_MAGIC, FEEDBACK_MAGIC, FEEDBACK_MAGIC]);
        assert_eq!(ctx.status(), 9);
        assert!(!parent.prepared);
    }

    #[test]
    fn test_child_returns_with_clean_channel() {
        let ctx = shared_context();
        let mut parent = ScriptedParent::new(ctx, vec![Step::Exit(0), Step::Child]);

        let state = start_forkserver_internal(ctx, &RuntimeConfig::new(), &mut parent).unwrap();
        assert_eq!(state, ForkserverState::Child);
        assert!(parent.prepared);
        // the first child's edge and status are gone
        assert_eq!(ctx.magic(), 0);
        assert_eq!(ctx.status(), 0);
        assert_eq!(ctx.hits(77), 0);
    }

    #[test]
    #[serial]
    fn test_forkserver_starts_once() {
        let ctx = shared_context();
        let mut parent = ScriptedParent::new(ctx, vec![]);
        let config = RuntimeConfig::new();

        let first = start_forkserver(ctx, &config, &mut parent);
        assert!(matches!(first, Err(Error::Unknown(_))));
        let second = start_forkserver(ctx, &config, &mut parent);
        assert!(matches!(second, Err(Error::IllegalState(_))));
    }
}
