use std::env;
use std::process::ExitCode;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Arg, ArgAction, Command, crate_version, value_parser};
use console::style;
use tracing::{debug, info};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use parmake::config::Document;
use parmake::executor::{self, RunOptions};
use parmake::params::ParameterSpace;

fn main() -> ExitCode {
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("{} {error:#}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<bool> {
    // The per-parameter options depend on the document, so it has to be
    // loaded before clap builds the full command line. The document path
    // is therefore expected as the first argument.
    let document = env::args()
        .nth(1)
        .filter(|arg| !arg.starts_with('-'))
        .map(|path| Document::load(Utf8Path::new(&path)))
        .transpose()?;

    let matches = cli(document.as_ref()).get_matches();
    let document = document.context("the build document must be the first argument")?;

    let root = Utf8PathBuf::from(matches.get_one::<String>("root-path").unwrap().clone());
    let target = matches.get_one::<String>("target").unwrap();
    let parallelism = *matches.get_one::<usize>("parallelism").unwrap();
    let redo_if_modified = matches.get_flag("redo-if-modified");
    let fail_fast = matches.get_flag("fail-fast");

    let make = document.compile(root)?;

    let mut space = ParameterSpace::new();
    for name in document.parameters.keys() {
        let values: Vec<String> = matches
            .get_many::<String>(name)
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
        space.insert(name.clone(), values);
    }

    let mut graph = make.expand_product(target, &space, redo_if_modified)?;
    debug!("expanded {} tasks\n{graph}", graph.len());

    let report = executor::run(
        &mut graph,
        &RunOptions {
            parallelism,
            fail_fast,
        },
    )?;
    info!("{}", report.summary());

    Ok(report.success())
}

fn cli(document: Option<&Document>) -> Command {
    let mut command = Command::new("parmake")
        .version(crate_version!())
        .about("Parameterized parallel build orchestrator")
        .arg(
            Arg::new("document")
                .value_name("DOCUMENT")
                .required(true)
                .help("YAML document describing parameters, resources, files and tasks"),
        )
        .arg(
            Arg::new("root-path")
                .long("root-path")
                .value_name("DIR")
                .required(true)
                .help("Root directory prepended to every file path"),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .value_name("NAME")
                .required(true)
                .help("Logical name of the file to build"),
        )
        .arg(
            Arg::new("parallelism")
                .long("parallelism")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .default_value("1")
                .help("How many commands may run at the same time"),
        )
        .arg(
            Arg::new("redo-if-modified")
                .long("redo-if-modified")
                .action(ArgAction::SetTrue)
                .help("Also rebuild files that are older than their dependencies"),
        )
        .arg(
            Arg::new("fail-fast")
                .long("fail-fast")
                .action(ArgAction::SetTrue)
                .help("Stop admitting new tasks after the first failure"),
        );

    if let Some(document) = document {
        for (name, help) in &document.parameters {
            command = command.arg(
                Arg::new(name.clone())
                    .long(name.clone())
                    .value_name("VALUE")
                    .num_args(0..)
                    .action(ArgAction::Append)
                    .help(help.clone()),
            );
        }
    }

    command
}
