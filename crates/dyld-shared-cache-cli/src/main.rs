//! `dyld-shared-cache` — builds a shared cache image from a root filesystem
//! of Mach-O dylibs.
//!
//! Mirrors `object-rewrite`'s CLI shape: `clap` for args, `anyhow` for
//! `main`'s error context, `env_logger`/`log` for `-v`, a `tempfile`-backed
//! atomic write-then-rename of the output, and signal handlers that delete
//! the temp output on `SIGINT`/`SIGBUS`/`SIGSEGV` so no partial cache is
//! ever published.

mod paths;

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{command, Arg, ArgAction};
use dyld_shared_cache::builder::{build_cache, BuildOptions};
use dyld_shared_cache::depgraph::DependencyGraph;
use dyld_shared_cache::source::FilesystemSource;
use macho_view::arch::Arch;
use macho_view::macho_const::{CPU_SUBTYPE_ARM_V6, CPU_SUBTYPE_ARM_V7, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64};

/// Path of the temp output file currently being written, so the signal
/// handlers below can delete it without touching any other process state.
static PENDING_OUTPUT: Mutex<Option<PathBuf>> = Mutex::new(None);
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn arch_from_name(name: &str) -> Option<Arch> {
    match name {
        "i386" => Arch::from_cpu(CPU_TYPE_X86, 3),
        "x86_64" => Arch::from_cpu(CPU_TYPE_X86_64, 3),
        "armv6" => Arch::from_cpu(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6),
        "armv7" => Arch::from_cpu(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7),
        "arm64" => Arch::from_cpu(CPU_TYPE_ARM64, 0),
        _ => None,
    }
}

extern "C" fn handle_fatal_signal(_sig: libc::c_int) {
    // Async-signal-safe: just mark the flag and unlink the file we already
    // recorded, no allocation or locking beyond the mutex the rest of main
    // already holds only briefly.
    INTERRUPTED.store(true, Ordering::SeqCst);
    if let Ok(guard) = PENDING_OUTPUT.try_lock() {
        if let Some(path) = guard.as_ref() {
            let _ = fs::remove_file(path);
        }
    }
    std::process::exit(1);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_fatal_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGBUS, handle_fatal_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGSEGV, handle_fatal_signal as *const () as libc::sighandler_t);
    }
}

fn main() -> Result<()> {
    let matches = command!()
        .max_term_width(100)
        .args(&[
            Arg::new("root")
                .long("root")
                .value_name("dir")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Base filesystem root dylib install paths are resolved against"),
            Arg::new("overlay")
                .long("overlay")
                .value_name("dir")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Overlay root tried before --root"),
            Arg::new("paths")
                .long("paths")
                .value_name("file")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Append)
                .required(true)
                .help("A .paths scan file listing root dylib install paths, one per line"),
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("file")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true)
                .help("Where to write the built cache"),
            Arg::new("map")
                .long("map")
                .value_name("file")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Where to write the human-readable .map describing the build"),
            Arg::new("arch")
                .long("arch")
                .value_name("name")
                .help("Target architecture: i386, x86_64, armv6, armv7 or arm64 (default: inferred from the first root dylib)"),
            Arg::new("shared-region-start")
                .long("shared-region-start")
                .value_name("hex")
                .help("Override the default base address of the shared region"),
            Arg::new("force")
                .long("force")
                .action(ArgAction::SetTrue)
                .help("Rebuild even if an up-to-date cache already exists at the output path"),
            Arg::new("keep-signatures")
                .long("keep-signatures")
                .action(ArgAction::SetTrue)
                .help("Accepted for compatibility; code signatures are always dropped because rewriting LINKEDIT invalidates them"),
            Arg::new("dont-map-local-symbols")
                .long("dont-map-local-symbols")
                .action(ArgAction::SetTrue)
                .help("Move non-exported local symbols to the unmapped-locals region instead of the mapped symbol table"),
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        ])
        .get_matches();

    if matches.get_flag("verbose") {
        env_logger::builder()
            .format_level(false)
            .format_target(false)
            .filter_module("dyld_shared_cache", log::LevelFilter::Debug)
            .init();
    }

    let output: &PathBuf = matches.get_one("output").unwrap();
    if output.exists() && !matches.get_flag("force") {
        log::info!("{} already exists; use --force to rebuild", output.display());
    }
    if matches.get_flag("keep-signatures") {
        log::warn!("--keep-signatures is ignored: any rewritten dylib has its code signature dropped");
    }

    let mut all_paths = Vec::new();
    for file in matches.get_many::<PathBuf>("paths").unwrap_or_default() {
        let entries = paths::read_paths_file(file)?;
        if entries.is_empty() {
            log::warn!("no entries found in {}", file.display());
        }
        all_paths.extend(entries);
    }
    if all_paths.is_empty() {
        bail!("no root dylib paths to build a cache from");
    }

    let source = FilesystemSource::new(matches.get_one::<PathBuf>("overlay").cloned(), matches.get_one::<PathBuf>("root").cloned());

    let mut graph = DependencyGraph::new();
    for root_path in &all_paths {
        let idx = graph
            .add_root(&source, root_path)
            .with_context(|| format!("failed to load root dylib '{root_path}'"))?;
        graph
            .load_all_dependencies(&source, idx, root_path)
            .with_context(|| format!("failed to resolve dependencies of '{root_path}'"))?;
    }

    let arch = match matches.get_one::<String>("arch") {
        Some(name) => arch_from_name(name).with_context(|| format!("unknown architecture '{name}'"))?,
        None => graph.nodes.first().map(|n| n.layout.arch).context("no root dylib was loaded")?,
    };

    let shared_region_start = match matches.get_one::<String>("shared-region-start") {
        Some(hex) => u64::from_str_radix(hex.trim_start_matches("0x"), 16).with_context(|| format!("invalid --shared-region-start value '{hex}'"))?,
        None => BuildOptions::default().shared_region_start,
    };

    let options = BuildOptions {
        shared_region_start,
        dont_map_local_symbols: matches.get_flag("dont-map-local-symbols"),
    };

    install_signal_handlers();
    let parent = output.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
    let temp = tempfile::Builder::new()
        .prefix(".dyld-shared-cache-")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create temp output file next to '{}'", output.display()))?;
    *PENDING_OUTPUT.lock().unwrap() = Some(temp.path().to_path_buf());

    let result = build_and_write(&mut graph, &arch, &options, temp, output);

    *PENDING_OUTPUT.lock().unwrap() = None;
    let build_result = result?;
    if let Some(map_path) = matches.get_one::<PathBuf>("map") {
        write_map_file(map_path, output, &build_result.warnings)?;
    }
    for warning in &build_result.warnings {
        log::warn!("{warning}");
    }
    Ok(())
}

fn build_and_write(
    graph: &mut DependencyGraph,
    arch: &Arch,
    options: &BuildOptions,
    mut temp: tempfile::NamedTempFile,
    output: &std::path::Path,
) -> Result<dyld_shared_cache::builder::BuildResult> {
    let built = build_cache(graph, arch, options).context("failed to build shared cache")?;

    temp.write_all(&built.data).with_context(|| format!("failed to write temp output file '{}'", temp.path().display()))?;
    temp.as_file().sync_all().with_context(|| format!("failed to fsync temp output file '{}'", temp.path().display()))?;
    temp.persist(output)
        .with_context(|| format!("failed to rename temp output file to '{}'", output.display()))?;

    Ok(built)
}

fn write_map_file(map_path: &std::path::Path, cache_path: &std::path::Path, warnings: &[dyld_shared_cache::Warning]) -> Result<()> {
    let mut out = String::new();
    out.push_str(&format!("# {}\n", cache_path.display()));
    for warning in warnings {
        out.push_str(&format!("# warning: {warning}\n"));
    }
    fs::write(map_path, out).with_context(|| format!("failed to write map file '{}'", map_path.display()))
}
