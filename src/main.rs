use std::{error::Error, path::PathBuf, process::ExitCode, time::Duration};

use clap::{parser::ValueSource, value_parser, Arg, ArgAction, ArgMatches, Command};
use sincetail::{ExitClass, HeaderTarget, Options, Shutdown, Terminal, WatchMode};
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn command() -> Command {
    Command::new("sincetail")
        .version(env!("CARGO_PKG_VERSION"))
        .about("display data appended to files since the last run")
        .arg(
            Arg::new("atomic")
                .short('a')
                .action(ArgAction::SetTrue)
                .help("always replace the state file instead of updating it in place"),
        )
        .arg(
            Arg::new("delay")
                .short('d')
                .value_name("SECONDS")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true)
                .help("poll interval in follow mode"),
        )
        .arg(
            Arg::new("stderr")
                .short('e')
                .action(ArgAction::SetTrue)
                .help("write headers to standard error"),
        )
        .arg(
            Arg::new("follow")
                .short('f')
                .action(ArgAction::SetTrue)
                .help("keep displaying data as it is appended"),
        )
        .arg(
            Arg::new("lax")
                .short('l')
                .action(ArgAction::SetTrue)
                .help("skip files that can not be opened"),
        )
        .arg(
            Arg::new("no-mmap")
                .short('m')
                .action(ArgAction::SetTrue)
                .help("do not memory map files"),
        )
        .arg(
            Arg::new("readonly")
                .short('n')
                .action(ArgAction::SetTrue)
                .help("do not update the state file"),
        )
        .arg(
            Arg::new("poll")
                .short('p')
                .action(ArgAction::SetTrue)
                .help("poll in follow mode even if change notification is available"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .action(ArgAction::SetTrue)
                .help("never print headers, a later -v raises verbosity again"),
        )
        .arg(
            Arg::new("state")
                .short('s')
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("state file to use instead of the default locations"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("print more headers and messages, repeat for more"),
        )
        .arg(
            Arg::new("skip-compressed")
                .short('x')
                .action(ArgAction::SetTrue)
                .help("skip files with compressed extensions"),
        )
        .arg(
            Arg::new("discard")
                .short('z')
                .action(ArgAction::SetTrue)
                .help("mark current content as seen without displaying it"),
        )
        .arg(
            Arg::new("FILE")
                .required(true)
                .num_args(1..)
                .value_parser(value_parser!(PathBuf))
                .help("files to display"),
        )
}

/// Positions of the occurrences of a flag on the command line
fn given(args: &ArgMatches, id: &str) -> Vec<usize> {
    if args.value_source(id) != Some(ValueSource::CommandLine) {
        return vec![];
    }
    args.indices_of(id)
        .map(|indices| indices.collect())
        .unwrap_or_default()
}

fn options(args: &ArgMatches) -> Options {
    let defaults = Options::default();
    let delay = match args.get_one::<i64>("delay") {
        Some(&seconds) if seconds >= 0 => Duration::from_secs(seconds.unsigned_abs()),
        Some(_) => Duration::from_secs(1),
        None => defaults.delay,
    };
    // -q resets verbosity, every -v after it counts again
    let quiet = given(args, "quiet").last().copied();
    let raised = given(args, "verbose")
        .into_iter()
        .filter(|&at| quiet.map_or(true, |q| at > q))
        .count();
    let raised = u8::try_from(raised).unwrap_or(u8::MAX);
    let verbosity = match quiet {
        Some(_) => raised,
        None => defaults.verbosity.saturating_add(raised),
    };

    Options {
        atomic: args.get_flag("atomic"),
        delay,
        headers: if args.get_flag("stderr") {
            HeaderTarget::Stderr
        } else {
            HeaderTarget::Stdout
        },
        follow: args.get_flag("follow"),
        lax: args.get_flag("lax"),
        use_mmap: !args.get_flag("no-mmap"),
        readonly: args.get_flag("readonly"),
        verbosity,
        state_file: args.get_one::<PathBuf>("state").cloned(),
        skip_compressed: args.get_flag("skip-compressed"),
        discard: args.get_flag("discard"),
        watch_mode: if args.get_flag("poll") {
            WatchMode::Poll
        } else {
            WatchMode::Auto
        },
    }
}

/// Quiet only silences headers, warnings such as truncation notices are always shown
fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 | 1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbosity: u8) {
    let level = log_level(verbosity);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn report(err: &dyn Error) {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    error!("{message}");
}

fn main() -> ExitCode {
    let args = match command().try_get_matches() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(ExitClass::Usage.code())
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let options = options(&args);
    init_tracing(options.verbosity);
    let targets: Vec<PathBuf> = args
        .get_many::<PathBuf>("FILE")
        .map(|files| files.cloned().collect())
        .unwrap_or_default();

    let shutdown = match Shutdown::install() {
        Ok(shutdown) => shutdown,
        Err(err) => {
            report(&err);
            return ExitCode::from(ExitClass::Os.code());
        }
    };
    let mut output = Terminal::new(options.headers);

    match sincetail::run(&options, &targets, &mut output, &shutdown) {
        Ok(summary) => {
            debug!(interrupted = summary.interrupted, "done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            report(&err);
            ExitCode::from(err.exit_class().code())
        }
    }
}
