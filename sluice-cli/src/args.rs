use clap::Parser;
use std::path::PathBuf;

/// Streaming dataflow runtime.
#[derive(Parser, Debug)]
#[command(name = "sluice", disable_version_flag = true)]
pub struct Args {
    /// Graph description to load (the parser's serialized AST).
    #[arg(short = 'F', value_name = "file")]
    pub graph_file: Option<PathBuf>,

    /// Re-arm the source set this many times before exiting.
    #[arg(short = 'l', value_name = "n", default_value_t = 1)]
    pub loop_count: u32,

    /// Redirect stderr to a file.
    #[arg(short = 'L', value_name = "file")]
    pub stderr_file: Option<PathBuf>,

    /// Skip the exit flush.
    #[arg(short = 'X')]
    pub no_exit_flush: bool,

    /// Seed for table hashing and deterministic compiles.
    #[arg(short = 's', value_name = "seed")]
    pub seed: Option<u32>,

    /// Dump the parse graph as graphviz and exit.
    #[arg(short = 'G', value_name = "file")]
    pub graphviz_pre: Option<PathBuf>,

    /// Dump the bound graph as graphviz after compile.
    #[arg(short = 'Z', value_name = "file")]
    pub graphviz_post: Option<PathBuf>,

    /// Graph config search path (also SLUICE_CONFIG_PATH).
    #[arg(short = 'C', value_name = "path")]
    pub config_path: Option<PathBuf>,

    /// Data-type library search path (also SLUICE_DATATYPE_PATH).
    #[arg(short = 'D', value_name = "path")]
    pub datatype_path: Option<PathBuf>,

    /// Module search path (also SLUICE_PROC_PATH).
    #[arg(short = 'P', value_name = "path")]
    pub proc_path: Option<PathBuf>,

    /// Alias table file (also SLUICE_ALIAS_PATH).
    #[arg(short = 'A', value_name = "file")]
    pub alias_path: Option<PathBuf>,

    /// Write a PID file for the run.
    #[arg(short = 'p', value_name = "file")]
    pub pid_file: Option<PathBuf>,

    /// Fail compile when a non-source node has no valid input.
    #[arg(short = 'r')]
    pub input_validate: bool,

    /// Verbose logging.
    #[arg(short = 'V')]
    pub verbose: bool,

    /// Keep loaded shared objects around for debuggers.
    #[arg(short = 'v')]
    pub keep_objects: bool,

    /// State-table statistics verbosity at teardown.
    #[arg(short = 't', value_name = "level", default_value_t = 0)]
    pub table_stats: u8,

    /// Pin worker n to core n + offset instead of automatic placement.
    #[arg(short = 'T', value_name = "n")]
    pub thread_offset: Option<usize>,

    /// Disable CPU pinning entirely.
    #[arg(short = 'W')]
    pub no_cpu_binding: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_flag_surface() {
        let args = Args::parse_from([
            "sluice", "-F", "graph.json", "-l", "3", "-X", "-s", "7", "-r", "-V", "-t", "2",
            "-T", "1", "-W",
        ]);
        assert_eq!(args.graph_file, Some(PathBuf::from("graph.json")));
        assert_eq!(args.loop_count, 3);
        assert!(args.no_exit_flush);
        assert_eq!(args.seed, Some(7));
        assert!(args.input_validate);
        assert!(args.verbose);
        assert_eq!(args.table_stats, 2);
        assert_eq!(args.thread_offset, Some(1));
        assert!(args.no_cpu_binding);
    }
}
