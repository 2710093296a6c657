//! `rofl_targets` contains the runtime linked into the target itself: the coverage map
//! written by instrumentation, the feedback channel shared with the controller, and
//! the fork-server loop that serves one fresh child per execution.
//!
//! The runtime is started by [`autorun`], which must run as early as possible in
//! process startup. Binaries linking this crate install it with the `ctor` crate:
//!
//! ```ignore
//! #[ctor::ctor]
//! fn init() {
//!     rofl_targets::autorun();
//! }
//! ```
//!
//! With the `autorun` feature, the library installs that constructor itself.
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::ptr_as_ptr,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]
#![cfg_attr(
    test,
    deny(
        bad_style,
        dead_code,
        improper_ctypes,
        non_shorthand_field_patterns,
        no_mangle_generic_items,
        overflowing_literals,
        path_statements,
        patterns_in_fns_without_body,
        unconditional_recursion,
        unused,
        unused_allocation,
        unused_comparisons,
        unused_parens,
        while_true
    )
)]

include!(concat!(env!("OUT_DIR"), "/constants.rs"));

pub mod binder;
pub mod bootstrap;
pub mod config;
pub mod coverage;
pub mod feedback;
pub mod forkserver;
pub mod reset;

pub use bootstrap::{autorun, bootstrap, bootstrap_with};
pub use config::RuntimeConfig;
pub use coverage::{Binding, RuntimeContext, RUNTIME};
pub use feedback::{FeedbackChannel, FEEDBACK_MAGIC};
pub use forkserver::{start_forkserver, ForkserverParent, ForkserverState, StdForkserverParent};
