//! jsonnet-host: command-line front end
//!
//! Evaluates a file or snippet through the native engine, with external
//! variables, top-level arguments, library paths and output modes taken
//! from the command line.

use anyhow::{bail, Context, Result};
use clap::Parser;
use jsonnet_host::{Configuration, Error, FileImporter, Vm};
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "jsonnet-host", about = "Evaluate Jsonnet through the native engine")]
struct Args {
    /// Input file, or source text with --exec
    input: String,

    /// Treat INPUT as source text instead of a path
    #[arg(short = 'e', long)]
    exec: bool,

    /// External variable as a string: NAME=VALUE, or NAME to read the environment
    #[arg(short = 'V', long = "ext-str", value_name = "NAME[=VALUE]")]
    ext_str: Vec<String>,

    /// External variable as code: NAME=CODE
    #[arg(long = "ext-code", value_name = "NAME=CODE")]
    ext_code: Vec<String>,

    /// Top-level argument as a string: NAME=VALUE, or NAME to read the environment
    #[arg(short = 'A', long = "tla-str", value_name = "NAME[=VALUE]")]
    tla_str: Vec<String>,

    /// Top-level argument as code: NAME=CODE
    #[arg(long = "tla-code", value_name = "NAME=CODE")]
    tla_code: Vec<String>,

    /// Library search directory, searched after the importing file's directory
    #[arg(short = 'J', long = "jpath", value_name = "DIR")]
    jpath: Vec<PathBuf>,

    /// Maximum stack depth
    #[arg(short = 's', long)]
    max_stack: Option<u32>,

    /// Maximum number of stack frames in error traces (0 = unlimited)
    #[arg(short = 't', long)]
    max_trace: Option<u32>,

    /// Number of objects below which the GC never runs
    #[arg(long)]
    gc_min_objects: Option<u32>,

    /// Heap growth factor that triggers a GC
    #[arg(long)]
    gc_growth_trigger: Option<f64>,

    /// Expect a string result and print it raw
    #[arg(short = 'S', long)]
    string: bool,

    /// Write one file per field of the result object into DIR
    #[arg(short = 'm', long, value_name = "DIR", conflicts_with = "yaml_stream")]
    multi: Option<PathBuf>,

    /// Print the result array as a YAML stream of JSON documents
    #[arg(short = 'y', long)]
    yaml_stream: bool,

    /// Write output to FILE instead of stdout
    #[arg(short = 'o', long, value_name = "FILE")]
    output_file: Option<PathBuf>,

    /// Verbose logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("jsonnet-host starting (engine {})", jsonnet_host::version());

    let config = build_config(&args)?;
    match run(&args, &config) {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<Error>().and_then(Error::evaluation_message) {
            Some(message) => {
                // Engine diagnostics are printed verbatim, trace included.
                eprint!("{message}");
                std::process::exit(1);
            }
            None => Err(err),
        },
    }
}

fn build_config(args: &Args) -> Result<Configuration> {
    let mut config = Configuration::new()
        .import_callback(FileImporter::with_search_paths(args.jpath.iter().cloned()));

    config.max_stack = args.max_stack;
    config.max_trace = args.max_trace;
    config.gc_min_objects = args.gc_min_objects;
    config.gc_growth_trigger = args.gc_growth_trigger;
    if args.string {
        config.string_output = Some(true);
    }

    for binding in &args.ext_str {
        let (name, value) = parse_binding(binding, true)?;
        config = config.ext_var(name, value);
    }
    for binding in &args.ext_code {
        let (name, code) = parse_binding(binding, false)?;
        config = config.ext_code(name, code);
    }
    for binding in &args.tla_str {
        let (name, value) = parse_binding(binding, true)?;
        config = config.tla_var(name, value);
    }
    for binding in &args.tla_code {
        let (name, code) = parse_binding(binding, false)?;
        config = config.tla_code(name, code);
    }

    config.validate()?;
    debug!(?config, "Configuration built");
    Ok(config)
}

/// Split `NAME=VALUE`; a bare `NAME` reads the environment when allowed
fn parse_binding(binding: &str, from_env: bool) -> Result<(String, String)> {
    if let Some((name, value)) = binding.split_once('=') {
        return Ok((name.to_string(), value.to_string()));
    }
    if !from_env {
        bail!("expected NAME=VALUE, got '{binding}'");
    }
    let value = std::env::var(binding)
        .with_context(|| format!("environment variable {binding} is not set"))?;
    Ok((binding.to_string(), value))
}

fn run(args: &Args, config: &Configuration) -> Result<()> {
    let mut vm = Vm::new();
    config.apply(&mut vm)?;

    let label = if args.exec { "<cmdline>" } else { args.input.as_str() };
    let path = Path::new(&args.input);

    if let Some(dir) = &args.multi {
        let files = if args.exec {
            vm.evaluate_snippet_multi(label, &args.input)?
        } else {
            vm.evaluate_file_multi(path)?
        };
        let mut listing = String::new();
        for (name, doc) in &files {
            let target = dir.join(name);
            std::fs::write(&target, doc)
                .with_context(|| format!("writing {}", target.display()))?;
            listing.push_str(&target.display().to_string());
            listing.push('\n');
        }
        return emit(args, &listing);
    }

    if args.yaml_stream {
        let docs = if args.exec {
            vm.evaluate_snippet_stream(label, &args.input)?
        } else {
            vm.evaluate_file_stream(path)?
        };
        let mut out = String::new();
        for doc in &docs {
            out.push_str("---\n");
            out.push_str(doc);
        }
        if !docs.is_empty() {
            out.push_str("...\n");
        }
        return emit(args, &out);
    }

    let out = if args.exec {
        vm.evaluate_snippet(label, &args.input)?
    } else {
        vm.evaluate_file(path)?
    };
    emit(args, &out)
}

fn emit(args: &Args, text: &str) -> Result<()> {
    match &args.output_file {
        Some(file) => std::fs::write(file, text)
            .with_context(|| format!("writing {}", file.display())),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding() {
        assert_eq!(
            parse_binding("env=prod", true).unwrap(),
            ("env".to_string(), "prod".to_string())
        );
        assert_eq!(
            parse_binding("expr=1 + 2 == 3", false).unwrap(),
            ("expr".to_string(), "1 + 2 == 3".to_string())
        );
        assert!(parse_binding("bare", false).is_err());
    }

    #[test]
    fn test_build_config_from_args() {
        let args = Args::parse_from([
            "jsonnet-host",
            "-e",
            "std.extVar('a')",
            "-V",
            "a=1",
            "--tla-code",
            "n=2",
            "--max-stack",
            "100",
            "-S",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.ext_vars["a"], "1");
        assert_eq!(config.tla_codes["n"], "2");
        assert_eq!(config.max_stack, Some(100));
        assert_eq!(config.string_output, Some(true));
        assert!(config.import_callback.is_some());
    }

    #[test]
    fn test_run_multi_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let listing = dir.path().join("listing.txt");

        let args = Args::parse_from([
            "jsonnet-host",
            "-e",
            "{ 'a.json': { x: 1 } }",
            "-m",
            out_dir.to_str().unwrap(),
            "-o",
            listing.to_str().unwrap(),
        ]);
        let config = build_config(&args).unwrap();
        run(&args, &config).unwrap();

        let written = std::fs::read_to_string(out_dir.join("a.json")).unwrap();
        assert!(written.contains("\"x\": 1"));
        assert!(std::fs::read_to_string(listing).unwrap().contains("a.json"));
    }
}
