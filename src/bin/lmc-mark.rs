use std::process::exit;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lmc_galvo::{Command, GalvoController, Settings, command_stream_job};

#[derive(Parser, Debug)]
#[command(name = "lmc-mark")]
#[command(about = "Drive an LMC galvo marking controller")]
struct Cli {
    /// JSON settings file merged over the defaults
    #[arg(short = 's', long = "settings")]
    settings: Option<std::path::PathBuf>,

    /// Use the in-memory mock transport instead of USB
    #[arg(long)]
    mock: bool,

    /// Machine index when several boards are attached
    #[arg(short = 'm', long = "machine", default_value_t = 0)]
    machine: usize,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Mark a centered square
    Square {
        /// Half edge length in galvo units
        #[arg(default_value_t = 0x2000)]
        size: u16,
    },
    /// Trace a centered square with the guide beam
    Outline {
        /// Half edge length in galvo units
        #[arg(default_value_t = 0x2000)]
        size: u16,
        /// How many times to trace the outline
        #[arg(short = 'p', long = "passes", default_value_t = 10)]
        passes: usize,
    },
    /// Print the input port state
    Port,
}

fn square_commands(size: i32) -> Vec<Command> {
    let center = 0x8000i32;
    vec![
        Command::MarkingConfiguration,
        Command::Goto(center - size, center - size),
        Command::Mark(center - size, center + size),
        Command::Mark(center + size, center + size),
        Command::Mark(center + size, center - size),
        Command::Mark(center - size, center - size),
        Command::InitialConfiguration,
    ]
}

fn outline_commands(size: i32, passes: usize) -> Vec<Command> {
    let center = 0x8000i32;
    let mut commands = vec![
        Command::LightingConfiguration,
        Command::Dark(center - size, center - size),
    ];
    for _ in 0..passes {
        commands.push(Command::Light(center - size, center + size));
        commands.push(Command::Light(center + size, center + size));
        commands.push(Command::Light(center + size, center - size));
        commands.push(Command::Light(center - size, center - size));
    }
    commands.push(Command::InitialConfiguration);
    commands
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if cli.mock {
        settings.mock = true;
    }
    settings.machine_index = cli.machine;

    let controller = GalvoController::new(settings);

    let interrupted = Arc::clone(&controller);
    ctrlc::set_handler(move || {
        eprintln!("interrupted, shutting down");
        interrupted.shutdown();
        exit(130);
    })
    .context("installing ctrl-c handler")?;

    match cli.action {
        Action::Square { size } => {
            controller.submit(command_stream_job(square_commands(size as i32)));
            controller.wait_for_machine_idle();
        }
        Action::Outline { size, passes } => {
            controller.submit(command_stream_job(outline_commands(size as i32, passes)));
            controller.wait_for_machine_idle();
        }
        Action::Port => {
            let reply = controller.read_port().context("reading input port")?;
            println!("input port: {:#06x}", reply[1]);
        }
    }

    controller.shutdown();
    Ok(())
}
