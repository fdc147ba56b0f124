use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::errno::Errno),

    #[error("process error: {0}")]
    Process(String),

    #[error("symbol not found: {0}")]
    Symbol(String),

    #[error("breakpoint error: {0}")]
    Breakpoint(String),

    #[error("register error: {0}")]
    Register(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("ELF error: {0}")]
    Elf(String),

    #[error("thread {0} is gone")]
    ThreadGone(Pid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
