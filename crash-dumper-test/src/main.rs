use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use crash_dumper::{CrashDumper, DUMP_DIRECTORY_NAME, DumpKind, DumperConfig, retention};
use std::path::{Path, PathBuf};

#[derive(ValueEnum, Clone, Copy)]
enum Kind {
    Minimal,
    Full,
}

impl From<Kind> for DumpKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Minimal => Self::Minimal,
            Kind::Full => Self::Full,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum Fault {
    Abort,
    Illegal,
    Segv,
    Trap,
}

#[derive(Subcommand)]
enum Action {
    /// Writes one or more dumps of the current thread
    Trigger {
        #[arg(long, value_enum, default_value_t = Kind::Minimal)]
        kind: Kind,
        /// The number of dumps to write, dumps written within the same second
        /// replace each other
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Raises a real fault, which is caught and dumped before the process
    /// dies
    Crash {
        #[arg(long, value_enum)]
        fault: Fault,
        #[arg(long, value_enum, default_value_t = Kind::Minimal)]
        kind: Kind,
        /// Raises the fault on a spawned thread instead of the main one
        #[arg(long)]
        threaded: bool,
    },
    /// Lists the dumps in the dump directory, newest first
    List,
    /// Applies the retention policy to the dump directory without starting
    /// the dumper
    Prune,
}

#[derive(Parser)]
struct Command {
    /// The root directory, dumps are stored in a `CrashDumps` directory
    /// inside it
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Single letter identifying the product in dump file names
    #[arg(long, default_value_t = 'Z')]
    product: char,
    /// The build identifier in dump file names, defaults to the crate version
    #[arg(long)]
    build_id: Option<String>,
    /// The number of full dumps that are kept
    #[arg(long, default_value_t = 2)]
    keep_full: usize,
    /// The number of minimal dumps that are kept
    #[arg(long, default_value_t = 10)]
    keep_minimal: usize,
    #[command(subcommand)]
    action: Action,
}

impl Command {
    fn config(&self) -> DumperConfig {
        let mut config = DumperConfig::default()
            .product(self.product)
            .keep(DumpKind::Full, self.keep_full)
            .keep(DumpKind::Minimal, self.keep_minimal);

        if let Some(build_id) = &self.build_id {
            config = config.build_id(build_id.clone());
        }

        config
    }
}

fn start(cmd: &Command, config: DumperConfig) -> anyhow::Result<CrashDumper> {
    let mut dumper = CrashDumper::new(config);
    dumper.init(&cmd.root);

    anyhow::ensure!(
        dumper.is_initialized(),
        "the crash dumper failed to initialize, see the log for details"
    );

    Ok(dumper)
}

fn list(dir: &Path) -> anyhow::Result<()> {
    for kind in [DumpKind::Full, DumpKind::Minimal] {
        let dumps = match retention::list_dumps(dir, kind) {
            Ok(dumps) => dumps,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("unable to list '{}'", dir.display()));
            }
        };

        println!("{kind}: {}", dumps.len());
        for dump in dumps {
            let size = std::fs::metadata(&dump.path).map_or(0, |md| md.len());
            println!("  {} ({size} bytes)", dump.path.display());
        }
    }

    Ok(())
}

fn raise(fault: Fault) {
    // SAFETY: we're about to intentionally crash ourselves, none of this is
    // safe
    #[allow(unsafe_code)]
    unsafe {
        match fault {
            Fault::Abort => sadness_generator::raise_abort(),
            Fault::Illegal => sadness_generator::raise_illegal_instruction(),
            Fault::Segv => sadness_generator::raise_segfault(),
            Fault::Trap => sadness_generator::raise_trap(),
        }
    }
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let dump_dir = cmd.root.join(DUMP_DIRECTORY_NAME);

    match cmd.action {
        Action::Trigger { kind, count } => {
            let mut dumper = start(&cmd, cmd.config().install_fault_filter(false))?;

            for _ in 0..count {
                dumper.trigger_dump(kind.into());
            }

            dumper.shutdown();
            list(&dump_dir)?;
        }
        Action::Crash {
            fault,
            kind,
            threaded,
        } => {
            let _dumper = start(&cmd, cmd.config().fault_kind(kind.into()))?;

            println!("pid: {}", std::process::id());

            if threaded {
                std::thread::Builder::new()
                    .name("crasher".to_owned())
                    .spawn(move || raise(fault))
                    .context("unable to spawn crashing thread")?
                    .join()
                    .map_err(|_e| anyhow::anyhow!("crashing thread panicked"))?;
            } else {
                raise(fault);
            }
        }
        Action::List => list(&dump_dir)?,
        Action::Prune => {
            for (kind, report) in retention::apply_policy(&dump_dir, &cmd.config()) {
                for path in &report.deleted {
                    println!("deleted {kind} dump {}", path.display());
                }
                for path in &report.failed {
                    println!("failed to delete {kind} dump {}", path.display());
                }
            }
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(err) = real_main() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
