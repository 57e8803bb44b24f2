//! Descriptor plumbing
//!
//! This module maps the streams of a stage onto concrete descriptors:
//! - `fd` - raw syscalls (`pipe_cloexec`, `dup`, `read`/`write`, `close`)
//! - `Redirect` - one stream mapped onto a descriptor, path or pending pipe
//! - `RedirectSet` - the whole stream table with merge and pipe resolution
//! - `ChildPlumbing` - the post-fork descriptor shuffle before `exec`
//!
//! On platforms without an atomic pipe+cloexec call, `pipe_cloexec` sets the
//! flag right after creation; a fork from another thread in between may
//! inherit the pipe.

pub mod child;
pub mod fd;
pub mod redirect;
pub mod redirects;

pub use child::ChildPlumbing;
pub use redirect::PipeHandle;
pub use redirect::Redirect;
pub use redirect::Source;
pub use redirect::Stream;
pub use redirects::RedirectSet;
