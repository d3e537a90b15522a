use std::{path::PathBuf, process::exit};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crossterm::style::Stylize;
use inquire::Confirm;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use simforge::{ConversionRequest, Converter, Operation, OutputMode, PatchStatus, Summary};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Tag binaries for the iOS Simulator
    Simulator,
    /// Tag binaries for iOS devices
    Device,
    /// Turn executables into dylibs
    Dylib,
    /// Turn dylibs back into executables
    Executable,
}

impl From<Mode> for Operation {
    fn from(mode: Mode) -> Operation {
        match mode {
            Mode::Simulator => Operation::SimulatorTag,
            Mode::Device => Operation::DeviceTag,
            Mode::Dylib => Operation::ToDylib,
            Mode::Executable => Operation::ToExecutable,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Patch Mach-O binaries between device and simulator")]
struct Args {
    /// What to do to each binary
    #[arg(value_enum)]
    mode: Mode,
    /// A binary, or a bundle/directory to search for binaries
    input: PathBuf,
    /// Modify the binaries in place
    #[arg(long, short)]
    inplace: bool,
    /// Suffix for the patched copies when not modifying in place
    #[arg(long, default_value = "_patched", conflicts_with = "inplace")]
    suffix: String,
    /// Run without asking for confirmation
    #[arg(long, short('y'))]
    all_yes: bool,
    /// Install name for `dylib` mode (default: @rpath/<file name>)
    #[arg(long)]
    install_name: Option<String>,
    /// Remove LC_ID_DYLIB in `executable` mode
    #[arg(long)]
    reversible: bool,
    /// Drop LC_CODE_SIGNATURE from patched binaries
    #[arg(long)]
    strip_codesign: bool,
    /// Number of files to patch at once (0 = one per CPU)
    #[arg(long, short, default_value_t = 0)]
    jobs: usize,
    /// More logging; repeat for more
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn ask_for_confirmation(&self, msg: &str) -> anyhow::Result<bool> {
        if self.all_yes {
            return Ok(true);
        }

        Ok(Confirm::new(msg).with_default(true).prompt()?)
    }

    fn request(&self) -> ConversionRequest {
        let output = if self.inplace {
            OutputMode::InPlace
        } else {
            OutputMode::Sibling {
                suffix: self.suffix.clone(),
            }
        };
        let mut request = ConversionRequest::new(&self.input, self.mode.into())
            .output(output)
            .reversible(self.reversible)
            .strip_code_signature(self.strip_codesign)
            .jobs(self.jobs);
        if let Some(name) = &self.install_name {
            request = request.install_name(name.clone());
        }
        request
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("initializing logger")?;

    if !args.input.exists() {
        eprintln!("Input `{}` does not exist", args.input.display());
        exit(1);
    }

    if args.inplace
        && !args.ask_for_confirmation(&format!(
            "Binaries under `{}` will be modified in place, continue?",
            args.input.display()
        ))?
    {
        exit(0);
    }

    let request = args.request();
    let results = Converter::new()
        .apply(&request)
        .with_context(|| format!("cannot convert {}", args.input.display()))?;

    for result in &results {
        match &result.outcome {
            Ok(PatchStatus::Patched) => {
                println!("{} {}", "patched".green(), result.output.display())
            }
            Ok(PatchStatus::AlreadyApplied) => {
                println!("{} {}", "unchanged".dark_grey(), result.output.display())
            }
            Err(e) => eprintln!("{} {}: {e}", "failed".red(), result.path.display()),
        }
    }

    let summary = Summary::of(&results);
    if results.is_empty() {
        println!("No Mach-O binaries found under `{}`", args.input.display());
    } else if summary.is_success() {
        println!(
            "{} {} patched, {} already {}",
            "Done!".green().bold(),
            summary.patched,
            summary.already_applied,
            request.operation()
        );
    } else {
        eprintln!(
            "{} {} of {} binaries failed",
            "Failed:".red().bold(),
            summary.failed,
            results.len()
        );
        exit(1);
    }

    Ok(())
}
