//! Driver glue: options, logging, signal handling, compile, run,
//! teardown.

mod args;

use args::Args;
use clap::Parser;
use sluice_core::compiler::{self, graphviz};
use sluice_core::module::ModuleRegistry;
use sluice_core::{request_exit, Runtime, RuntimeOptions};
use sluice_types::ast::Stmt;
use sluice_types::log::{error, info};
use std::fs::File;
use std::io::{BufWriter, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_SIGNALS: [i32; 4] = [
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGTERM,
    signal_hook::consts::SIGQUIT,
    signal_hook::consts::SIGABRT,
];

fn install_exit_handlers() -> std::io::Result<()> {
    for sig in EXIT_SIGNALS {
        // Only async-signal-safe work here: bump the counter, and on
        // the third delivery leave immediately.
        unsafe {
            signal_hook::low_level::register(sig, || {
                if request_exit() >= 3 {
                    libc::_exit(0);
                }
            })?;
        }
    }
    Ok(())
}

fn redirect_stderr(path: &Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let rc = unsafe { libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // The duplicated descriptor keeps the file open.
    std::mem::forget(file);
    Ok(())
}

fn env_or(flag: Option<PathBuf>, var: &str) -> Option<PathBuf> {
    flag.or_else(|| std::env::var_os(var).map(PathBuf::from))
}

fn load_ast(path: &Path) -> std::io::Result<Vec<Stmt>> {
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    let parsed: Vec<Stmt> = sluice_types::serde_json::from_str(&text)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(parsed)
}

fn load_aliases(registry: &mut ModuleRegistry, path: &Path) -> std::io::Result<()> {
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((alias, target)) = line.split_once('=') {
            registry.add_alias(alias.trim(), target.trim());
        }
    }
    Ok(())
}

fn run(args: Args) -> Result<(), String> {
    if let Some(path) = &args.stderr_file {
        redirect_stderr(path).map_err(|e| format!("cannot redirect stderr: {e}"))?;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let mut config = args
        .graph_file
        .clone()
        .ok_or_else(|| "no graph file given (-F)".to_string())?;
    if !config.exists() {
        // Fall back to the config search path.
        if let Some(dir) = env_or(args.config_path.clone(), "SLUICE_CONFIG_PATH") {
            let candidate = dir.join(&config);
            if candidate.exists() {
                config = candidate;
            }
        }
    }
    let alias_path = env_or(args.alias_path.clone(), "SLUICE_ALIAS_PATH");
    // The datatype and proc search paths only matter for dynamically
    // loaded components; the static registry ignores them.
    let _datatype_path = env_or(args.datatype_path.clone(), "SLUICE_DATATYPE_PATH");
    let proc_path = env_or(args.proc_path.clone(), "SLUICE_PROC_PATH");

    let mut modules = ModuleRegistry::with_builtins();
    if let Some(path) = &alias_path {
        load_aliases(&mut modules, path).map_err(|e| format!("cannot read alias table: {e}"))?;
    }
    #[cfg(feature = "dynamic-modules")]
    if let Some(dir) = &proc_path {
        for entry in std::fs::read_dir(dir).map_err(|e| e.to_string())? {
            let path = entry.map_err(|e| e.to_string())?.path();
            if path.extension().is_some_and(|e| e == "so") {
                modules.load_dynamic(&path).map_err(|e| e.to_string())?;
                if args.keep_objects {
                    info!("keeping {} loaded for debuggers", path.display());
                }
            }
        }
    }
    #[cfg(not(feature = "dynamic-modules"))]
    let _ = (proc_path, args.keep_objects);

    let opts = RuntimeOptions {
        input_validate: args.input_validate,
        verbose: args.verbose,
        no_exit_flush: args.no_exit_flush,
        seed: args.seed.unwrap_or(0),
        loop_count: args.loop_count,
        cpu_offset: args.thread_offset,
        pin_cpus: !args.no_cpu_binding,
        table_stats: args.table_stats,
        ..RuntimeOptions::default()
    };

    let ast = load_ast(&config).map_err(|e| format!("cannot load graph: {e}"))?;
    let mut runtime = Runtime::new(modules, opts);

    let pg = compiler::parse_stage(&ast, &runtime.opts).map_err(|e| e.to_string())?;
    if let Some(path) = &args.graphviz_pre {
        let mut w = BufWriter::new(File::create(path).map_err(|e| e.to_string())?);
        graphviz::parse_graph_dot(&pg, &mut w).map_err(|e| e.to_string())?;
        info!("wrote parse graph to {}; exiting before execution", path.display());
        return Ok(());
    }

    let graph = compiler::compile_parsed(pg, &runtime.modules, &mut runtime.env, &runtime.opts)
        .map_err(|e| e.to_string())?;
    if let Some(path) = &args.graphviz_post {
        let mut w = BufWriter::new(File::create(path).map_err(|e| e.to_string())?);
        graphviz::compiled_dot(&graph, &runtime.env, &mut w).map_err(|e| e.to_string())?;
    }

    if let Some(path) = &args.pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| format!("cannot write pid file: {e}"))?;
    }

    install_exit_handlers().map_err(|e| format!("cannot install signal handlers: {e}"))?;

    let report = runtime.run(graph).map_err(|e| e.to_string())?;
    info!(
        "run complete: {} worker(s), {} cycle(s), {} recovery diversion(s)",
        report.work_size, report.detected_cycles, report.recovery_entries
    );

    if let Some(path) = &args.pid_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            eprintln!("sluice: {message}");
            ExitCode::FAILURE
        }
    }
}
