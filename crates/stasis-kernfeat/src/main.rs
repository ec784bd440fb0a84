//! stasis-kernfeat — run kernel feature detection and inspect the
//! snapshot cache.
//!
//! A diagnostics front-end for the library: `probe` prints the registry
//! (human or JSON), `cache status` explains what a saved snapshot would
//! do on the next run, `cache clear` removes it.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use stasis_common::ExitCode;
use stasis_kernfeat::{cache, CacheVerdict, DetectConfig, KernelFeatures};

/// Kernel feature detection for stasis checkpoint/restore
#[derive(Parser)]
#[command(name = "stasis-kernfeat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Snapshot cache path (defaults to the system cache dir)
    #[arg(long, global = true, env = "STASIS_KERNFEAT_CACHE")]
    cache_path: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection and print the feature registry
    Probe(ProbeArgs),

    /// Inspect or remove the snapshot cache
    Cache(CacheArgs),
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Machine-readable JSON output
    #[arg(long)]
    json: bool,

    /// Neither load nor write the snapshot cache
    #[arg(long)]
    no_cache: bool,

    /// Ignore an existing snapshot but write a fresh one
    #[arg(long)]
    refresh: bool,
}

#[derive(Args, Debug)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommands,
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Report whether a saved snapshot exists and would validate
    Status,

    /// Remove the saved snapshot
    Clear,
}

fn main() {
    // Route argument failures through the exit-code contract; help and
    // version requests stay a success.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                ExitCode::ArgsError
            } else {
                ExitCode::Ok
            };
            let _ = err.print();
            std::process::exit(code.as_i32());
        }
    };
    init_logging(&cli.global);

    let code = match cli.command {
        Commands::Probe(args) => run_probe(&cli.global, &args),
        Commands::Cache(args) => match args.command {
            CacheCommands::Status => run_cache_status(&cli.global),
            CacheCommands::Clear => run_cache_clear(&cli.global),
        },
    };
    std::process::exit(code.as_i32());
}

fn init_logging(global: &GlobalOpts) {
    let default_level = if global.quiet {
        "warn"
    } else {
        match global.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stasis_kernfeat={default_level},stasis_common={default_level}")));
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .without_time();
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

fn cache_path(global: &GlobalOpts) -> PathBuf {
    global
        .cache_path
        .clone()
        .unwrap_or_else(cache::default_cache_path)
}

fn run_probe(global: &GlobalOpts, args: &ProbeArgs) -> ExitCode {
    let config = DetectConfig {
        cache_path: global.cache_path.clone(),
        use_cache: !args.no_cache,
        refresh: args.refresh,
    };
    let registry = match KernelFeatures::detect(&config) {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("error: kernel feature detection failed: {err}");
            return if err.is_permission_denied() {
                ExitCode::PermissionError
            } else {
                ExitCode::ProbeError
            };
        }
    };
    let features = registry.features();

    if args.json {
        match serde_json::to_string_pretty(features) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("error: could not serialize registry: {err}");
                return ExitCode::InternalError;
            }
        }
        return ExitCode::Ok;
    }

    println!("probed at: {}", format_probed_at(&features.probed_at));
    println!("{}", features.summary());
    println!();
    println!("pagemap:               {:?}", features.pagemap);
    println!("dirty tracking:        {}", features.has_dirty_track);
    println!("zero page pfn:         {:?}", features.zero_page_pfn);
    println!("shmem device:          {:#x}", features.shmem_dev);
    println!("task size:             {:#x}", features.task_size);
    println!("mmap floor:            {:#x}", features.mmap_min_addr);
    println!("stack guard hidden:    {}", features.stack_guard_gap_hidden);
    println!("thp disable:           {}", features.has_thp_disable);
    println!("memfd:                 {}", features.has_memfd);
    match registry.userfaultfd() {
        Some(bits) => println!("userfaultfd:           yes (features {:#x})", bits.bits()),
        None => println!("userfaultfd:           no"),
    }
    println!(
        "vdso:                  {} symbols in {:#x} bytes",
        features.vdso.symbols.len(),
        features.vdso.len
    );
    println!("vdso hint reliable:    {}", features.vdso_hint_reliable);
    println!("can map compat vdso:   {}", features.can_map_vdso);
    println!("fdinfo locks:          {}", features.has_fdinfo_lock);
    println!("nr_open / file-max:    {} / {}", features.sysctl_nr_open, features.max_files);
    println!("ipv6:                  {}", features.ipv6);
    println!("socket netns attr:     {}", features.sock_netns);
    println!("tcp half-closed:       {}", features.has_tcp_half_closed);
    println!("netlink nsid:          {}", features.has_nsid);
    println!("link nsid:             {}", features.has_link_nsid);
    println!("lsm:                   {}", features.lsm.as_str());
    println!("last capability:       {}", features.last_cap);
    println!("loginuid:              {:?}", features.loginuid);
    println!("xtables locks:         {:#b}", features.xtables_locks.bits());
    println!("compat c/r:            {}", features.compat_cr);
    println!("xsave erratum:         {}", features.x86_ptrace_fpu_xsave_bug);
    ExitCode::Ok
}

fn format_probed_at(stamp: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(stamp) {
        Ok(parsed) => parsed.format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        Err(_) => stamp.to_string(),
    }
}

fn run_cache_status(global: &GlobalOpts) -> ExitCode {
    let path = cache_path(global);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("no snapshot at {}", path.display());
            return ExitCode::NoCache;
        }
        Err(err) => {
            eprintln!("error: cannot read {}: {err}", path.display());
            return ExitCode::IoError;
        }
    };
    match cache::decode(&bytes) {
        CacheVerdict::Valid(features) => {
            println!(
                "valid snapshot at {} ({} bytes, probed at {})",
                path.display(),
                bytes.len(),
                format_probed_at(&features.probed_at)
            );
            ExitCode::Ok
        }
        CacheVerdict::Mismatch { reason } => {
            println!(
                "stale snapshot at {} ({reason} mismatch); next run will re-probe",
                path.display()
            );
            ExitCode::NoCache
        }
        CacheVerdict::Corrupt => {
            println!(
                "corrupt snapshot at {}; next run will re-probe",
                path.display()
            );
            ExitCode::NoCache
        }
    }
}

fn run_cache_clear(global: &GlobalOpts) -> ExitCode {
    let path = cache_path(global);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            println!("removed {}", path.display());
            ExitCode::Ok
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("no snapshot at {}", path.display());
            ExitCode::NoCache
        }
        Err(err) => {
            eprintln!("error: cannot remove {}: {err}", path.display());
            ExitCode::IoError
        }
    }
}
