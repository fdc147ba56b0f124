#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("rleax requires Linux (ptrace). This binary was built for a non-Linux target.");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    linux::run()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::Context;
    use clap::Parser;
    use colored::Colorize;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use nix::unistd::Pid;

    use rleax::config::{TraceConfig, DEFAULT_BACKTRACE_DEPTH};
    use rleax::elf;
    use rleax::ledger::MemoryLedger;
    use rleax::process::PtraceBackend;
    use rleax::procfs;
    use rleax::session::{RunOutcome, Session};
    use rleax::symbols::ProcessSymbols;

    static STOP: AtomicBool = AtomicBool::new(false);

    #[derive(Parser)]
    #[command(
        name = "rleax",
        about = "Track the allocations of a running process through breakpoints"
    )]
    struct Cli {
        /// Process to attach to
        #[arg(short = 'p', long = "pid")]
        pid: i32,

        /// Frames to log when an allocation fails (0 disables)
        #[arg(long, default_value_t = DEFAULT_BACKTRACE_DEPTH)]
        backtrace_depth: usize,

        /// Do not print unfreed allocations on exit
        #[arg(long)]
        no_report: bool,

        /// More log output (-v info, -vv debug); RUST_LOG overrides
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    }

    impl Cli {
        fn config(&self) -> TraceConfig {
            TraceConfig {
                pid: Pid::from_raw(self.pid),
                backtrace_depth: self.backtrace_depth,
                report: !self.no_report,
            }
        }
    }

    extern "C" fn request_stop(_: libc::c_int) {
        STOP.store(true, Ordering::SeqCst);
    }

    // No SA_RESTART: the blocking waitpid must return EINTR so the event
    // loop sees the flag.
    fn install_stop_handler() -> anyhow::Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(request_stop),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            unsafe { sigaction(signal, &action) }
                .with_context(|| format!("installing {} handler", signal))?;
        }
        Ok(())
    }

    fn init_logging(verbose: u8) {
        let level = match verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        };
        env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format_timestamp(None)
            .init();
    }

    pub fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        init_logging(cli.verbose);
        let config = cli.config();
        let pid = config.pid;

        let arch = elf::detect_arch(&procfs::exe_path(pid))
            .with_context(|| format!("detecting architecture of process {}", pid))?;
        let symbols = ProcessSymbols::load(pid)
            .with_context(|| format!("loading symbols of process {}", pid))?;
        install_stop_handler()?;

        let backend = PtraceBackend::attach(pid)
            .with_context(|| format!("attaching to process {}", pid))?;
        println!(
            "{} attached to process {} ({}, {} threads)",
            "rleax".bold().cyan(),
            pid,
            arch,
            backend.thread_list().len()
        );

        let report = config.report;
        let mut session = Session::new(backend, MemoryLedger::new(), arch, Box::new(symbols), config);
        session.init().context("installing allocator breakpoints")?;

        let outcome = session.run(&STOP);
        session.cleanup().context("restoring the target")?;

        match outcome? {
            RunOutcome::Exited(code) => {
                println!("{} process {} exited with status {}", "rleax".bold().cyan(), pid, code)
            }
            RunOutcome::Killed(signal) => {
                println!("{} process {} killed by {}", "rleax".bold().cyan(), pid, signal)
            }
            RunOutcome::Interrupted => {
                println!("{} detached from process {}", "rleax".bold().cyan(), pid)
            }
        }

        if report {
            print!("{}", session.ledger().report());
        }
        Ok(())
    }
}
