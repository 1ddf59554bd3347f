use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use magus::{Magic, Options, Severity, Verdict};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "magus")]
#[command(
    about = "File type identification using magic(5) rule databases",
    long_about = "magus - file type identification engine\n\n\
    Identify files by content against a database of magic rules, compile\n\
    textual rule sources into the binary .mgc form, and inspect databases.\n\n\
    Examples:\n\
      magus identify -m magic.mgc photo.bin archive.bin\n\
      magus identify -m magic --mime --json data.bin\n\
      magus compile -m magic -o magic.mgc\n\
      magus list -m magic.mgc\n\
      magus check -m magic"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify files against a magic database
    Identify {
        /// Magic database: textual source or compiled .mgc
        #[arg(short = 'm', long = "magic", value_name = "DATABASE")]
        magic: PathBuf,

        /// Files to identify
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Print the MIME type instead of the description
        #[arg(long)]
        mime: bool,

        /// Keep evaluating after the first hit and concatenate the results
        #[arg(short = 'k', long)]
        keep_going: bool,

        /// Emit one JSON object per file
        #[arg(long)]
        json: bool,
    },

    /// Compile magic source files into a .mgc database
    Compile {
        /// Magic source files, concatenated in order
        #[arg(short = 'm', long = "magic", value_name = "SOURCE", required = true)]
        sources: Vec<PathBuf>,

        /// Output path for the compiled database
        #[arg(short = 'o', long = "output", value_name = "OUTPUT")]
        output: PathBuf,
    },

    /// List the rules of a database in strength order
    List {
        /// Magic database: textual source or compiled .mgc
        #[arg(short = 'm', long = "magic", value_name = "DATABASE")]
        magic: PathBuf,
    },

    /// Parse a database and report its diagnostics
    Check {
        /// Magic database: textual source or compiled .mgc
        #[arg(short = 'm', long = "magic", value_name = "DATABASE")]
        magic: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Identify {
            magic,
            files,
            mime,
            keep_going,
            json,
        } => cmd_identify(&magic, &files, mime, keep_going, json),
        Commands::Compile { sources, output } => cmd_compile(&sources, &output),
        Commands::List { magic } => cmd_list(&magic),
        Commands::Check { magic } => cmd_check(&magic),
    }
}

fn load_database(path: &PathBuf) -> Result<Magic> {
    Magic::load(path).with_context(|| format!("failed to load database {}", path.display()))
}

fn cmd_identify(
    magic_path: &PathBuf,
    files: &[PathBuf],
    mime: bool,
    keep_going: bool,
    json: bool,
) -> Result<()> {
    let magic = load_database(magic_path)?;
    let opts = Options {
        keep_going,
        ..Default::default()
    };

    for file in files {
        let data = std::fs::read(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let verdict = magic.identify(&data, &opts);

        if json {
            let record = serde_json::json!({
                "file": file.display().to_string(),
                "result": verdict,
            });
            println!("{}", record);
            continue;
        }

        let shown = match &verdict {
            Verdict::Match(m) if mime => m
                .mime
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            Verdict::Match(m) => m.description.clone(),
            Verdict::None => "data".to_string(),
        };
        println!("{}: {}", file.display(), shown);
    }
    Ok(())
}

fn cmd_compile(sources: &[PathBuf], output: &PathBuf) -> Result<()> {
    let magic = Magic::load_sources(sources).context("failed to load magic sources")?;

    let errors = magic
        .check()
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();
    for diag in magic.check() {
        eprintln!("{}", diag);
    }

    let warnings = magic
        .compile(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    for diag in &warnings {
        eprintln!("{}", diag);
    }

    println!(
        "compiled {} rules to {} ({} dropped)",
        magic.rule_count(),
        output.display(),
        errors
    );
    Ok(())
}

fn cmd_list(magic_path: &PathBuf) -> Result<()> {
    let magic = load_database(magic_path)?;
    for line in magic.list() {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_check(magic_path: &PathBuf) -> Result<()> {
    let magic = load_database(magic_path)?;
    if magic.check().is_empty() {
        println!("{}: clean, {} rules", magic_path.display(), magic.rule_count());
        return Ok(());
    }
    for diag in magic.check() {
        println!("{}", diag);
    }
    let errors = magic
        .check()
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("{} rules dropped", errors);
    }
    Ok(())
}
