use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use tagdoc_core::{Document, Format, FormatDescriptor, JsonOpts, formats, json};

mod verify;

#[derive(Parser, Debug)]
#[command(
    name = "tagdoc",
    about = "Dump, verify and edit tagged binary asset files",
    version
)]
struct Cli {
    /// Built-in format name or path to a JSON format descriptor
    #[arg(long, global = true, default_value = "avfx")]
    format: String,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Dump a file as JSON
    Dump(DumpArgs),
    /// Check that files re-serialize to identical bytes
    Verify(VerifyArgs),
    /// Print a field addressed by name path, e.g. Emit[0]/ItEm[1]/PrNo
    Get(GetArgs),
    /// Set a field (raw JSON value) and write the result
    Set(SetArgs),
    /// List the entities of every group
    Groups(FileArgs),
    /// List built-in formats
    Formats,
}

#[derive(ClapArgs, Debug)]
struct DumpArgs {
    path: PathBuf,
    /// Max array elements to include per array
    #[arg(long, default_value_t = 128)]
    max_array: usize,
    /// Emit full bytes instead of summaries
    #[arg(long, default_value_t = false)]
    bytes_full: bool,
    /// Show unassigned blocks as null
    #[arg(long, default_value_t = false)]
    unassigned: bool,
}

#[derive(ClapArgs, Debug)]
struct VerifyArgs {
    /// File or directory (walked recursively)
    path: PathBuf,
    /// Only check files with this extension when walking a directory
    #[arg(long)]
    ext: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct GetArgs {
    path: PathBuf,
    /// Name path of the field
    #[arg(long)]
    name: String,
}

#[derive(ClapArgs, Debug)]
struct SetArgs {
    path: PathBuf,
    /// Name path of the field
    #[arg(long)]
    name: String,
    /// New value as raw JSON (e.g. 3, 1.5, true, "Hello", [0, 1])
    #[arg(long)]
    value: String,
    /// Output path; defaults to overwriting the input
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct FileArgs {
    path: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    if let Cmd::Formats = cli.cmd {
        for name in formats::BUILTIN {
            println!("{name}");
        }
        return;
    }
    let format = load_format(&cli.format).unwrap_or_else(|e| {
        eprintln!("error: {}", e);
        std::process::exit(2);
    });
    match cli.cmd {
        Cmd::Dump(a) => cmd_dump(&format, a),
        Cmd::Verify(a) => cmd_verify(&format, a),
        Cmd::Get(a) => cmd_get(&format, a),
        Cmd::Set(a) => cmd_set(&format, a),
        Cmd::Groups(a) => cmd_groups(&format, a),
        Cmd::Formats => {}
    }
}

fn load_format(spec: &str) -> Result<Arc<Format>, String> {
    if formats::BUILTIN.contains(&spec) {
        return formats::by_name(spec).map(Arc::new).map_err(|e| e.to_string());
    }
    let text = std::fs::read_to_string(spec).map_err(|e| format!("cannot read format '{spec}': {e}"))?;
    let desc = FormatDescriptor::from_json(&text).map_err(|e| e.to_string())?;
    Format::new(desc).map(Arc::new).map_err(|e| e.to_string())
}

fn open(format: &Arc<Format>, path: &Path) -> Document {
    let bytes = std::fs::read(path).unwrap_or_else(|e| {
        eprintln!("error reading {}: {}", path.display(), e);
        std::process::exit(2);
    });
    Document::parse(Arc::clone(format), &bytes).unwrap_or_else(|e| {
        eprintln!("error: {}: {}", path.display(), e);
        std::process::exit(2);
    })
}

fn cmd_dump(format: &Arc<Format>, args: DumpArgs) {
    let doc = open(format, &args.path);
    let opts = JsonOpts {
        max_array_elems: args.max_array,
        bytes_summary: !args.bytes_full,
        include_unassigned: args.unassigned,
    };
    match json::dump_json(doc.tree(), opts) {
        Ok(s) => println!("{}", s),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    }
}

fn cmd_verify(format: &Arc<Format>, args: VerifyArgs) {
    let reports = verify::verify_path(format, &args.path, args.ext.as_deref());
    let mut failed = 0;
    for r in &reports {
        match &r.outcome {
            Ok(v) => println!("{}\t{}", r.path.display(), v.message),
            Err(e) => println!("{}\terror: {}", r.path.display(), e),
        }
        if !r.is_verified() {
            failed += 1;
        }
    }
    info!("{} file(s) checked, {} failed", reports.len(), failed);
    if failed > 0 {
        std::process::exit(1);
    }
}

fn cmd_get(format: &Arc<Format>, args: GetArgs) {
    let doc = open(format, &args.path);
    let tree = doc.tree();
    match tree.resolve(&args.name).and_then(|p| tree.field(&p)) {
        Ok(f) => {
            let v = json::field_to_json(f, tree.groups(), &JsonOpts::default());
            println!("{}", serde_json::to_string_pretty(&v).unwrap_or_default());
        }
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(3);
        }
    }
}

fn cmd_set(format: &Arc<Format>, args: SetArgs) {
    let mut doc = open(format, &args.path);
    let raw: serde_json::Value = serde_json::from_str(&args.value).unwrap_or_else(|e| {
        eprintln!("invalid --value JSON: {}", e);
        std::process::exit(3);
    });
    let edit = doc.tree().resolve(&args.name).and_then(|path| {
        let value = json::json_to_value(doc.tree().field(&path)?.kind(), &raw)?;
        Ok((path, value))
    });
    if let Err(e) = edit.and_then(|(path, value)| doc.set_field(path, value)) {
        eprintln!("error: {}", e);
        std::process::exit(4);
    }
    let out = args.out.unwrap_or(args.path);
    std::fs::write(&out, doc.serialize()).unwrap_or_else(|e| {
        eprintln!("error writing {}: {}", out.display(), e);
        std::process::exit(5);
    });
    info!("wrote {}", out.display());
}

fn cmd_groups(format: &Arc<Format>, args: FileArgs) {
    let doc = open(format, &args.path);
    for group in doc.tree().groups() {
        println!("{} ({})", group.name(), group.len());
        for (i, entity) in group.iter().enumerate() {
            let text = group.display_text(entity.id()).unwrap_or_default();
            println!("  {}\t{}\t{}", i, entity.id(), text);
        }
    }
}
