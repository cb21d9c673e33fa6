//! Server console plumbing: the pseudo-terminal the server runs on, raw fd I/O, and the
//! escape filter that turns the console stream into clean log output plus title updates.

mod filter;
mod io;
mod pty;


pub use filter::{OutputFilter, CHUNK_SIZE, TITLE_MAX};
pub use io::{read_chunk, write_all, ReadOutcome};
pub use pty::{
    errno_error, path_cstring, pipe_cloexec, read_exec_error, set_nonblocking, spawn_in_pty,
    ChildCommand, Pty, SpawnedChild, EXEC_FAILED_STATUS, PTY_COLUMNS, PTY_ROWS,
};
