use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use heybro::actions::ActionContext;
use heybro::backends::assets::AssetModels;
use heybro::backends::cpal_audio::CpalBackend;
use heybro::config_loader::{Settings, SETTINGS};
use heybro::cortex::Cortex;
use heybro::custom_actions::CustomActionMap;
use heybro::device::AudioDevice;
use heybro::dispatcher::{
    Collaborators, Dispatcher, PipelineHandle, PipelineOptions, PipelineState, PipelineStatus,
    SEPARATOR,
};
use heybro::platform::{DesktopPlatform, PickRequest};
use heybro::profiles::Language;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// HeyBro - wake word voice assistant
#[derive(Parser)]
#[command(name = "heybro", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive voice pipeline (default)
    Run {
        /// Start without listening for the wake word
        #[arg(long)]
        no_wake: bool,
        /// Language to start in: en or hi
        #[arg(short, long, env = "HEYBRO_LANGUAGE")]
        language: Option<String>,
    },

    /// Send one typed command through the pipeline and speak the reply
    Ask {
        /// Text to send
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Clear the conversation history on the NLU server
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,heybro=info",
        1 => "info,heybro=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = SETTINGS
        .read()
        .map_err(|_| anyhow!("settings lock poisoned"))?
        .clone();

    match cli.command.unwrap_or(Commands::Run {
        no_wake: false,
        language: None,
    }) {
        Commands::Run { no_wake, language } => interactive(&settings, !no_wake, language).await,
        Commands::Ask { text } => ask(&settings, &text.join(" ")).await,
        Commands::Reset => {
            Cortex::from_settings(&settings)
                .reset_now()
                .await
                .context("reset failed")?;
            println!("Chat history reset.");
            Ok(())
        }
    }
}

fn build_pipeline(
    settings: &Settings,
    options: PipelineOptions,
    platform: DesktopPlatform,
) -> (PipelineHandle, tokio::task::JoinHandle<()>) {
    let collaborators = Collaborators {
        device: AudioDevice::new(Arc::new(CpalBackend::new())),
        models: Arc::new(AssetModels::from_settings(settings)),
        cortex: Cortex::from_settings(settings),
        actions: ActionContext {
            platform: Some(Arc::new(platform)),
            custom_actions: CustomActionMap::load(&settings.custom_actions_path),
            vpn_package: settings.vpn_package.clone(),
        },
    };
    Dispatcher::spawn(options, collaborators)
}

/// Print log lines added since `seen` lines had been logged
fn print_new_lines(status: &PipelineStatus, seen: &mut u64) {
    let fresh = (status.logged - *seen).min(status.log.len() as u64) as usize;
    let now = chrono::Local::now().format("%H:%M:%S");
    for line in &status.log[status.log.len() - fresh..] {
        println!("[{}] {}", now, line);
    }
    *seen = status.logged;
}

/// Keyboard input, read on its own thread so a pending read never holds up
/// shutdown
fn stdin_lines() -> std::io::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    heybro::worker::spawn("stdin", move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    })?;
    Ok(rx)
}

async fn interactive(
    settings: &Settings,
    wake: bool,
    language: Option<String>,
) -> anyhow::Result<()> {
    let mut options = PipelineOptions::from_settings(settings);
    if let Some(language) = language {
        options.language = language.parse::<Language>()?;
    }
    // App choices are answered from the same line reader as the commands
    let (platform, mut picks) = DesktopPlatform::new().with_line_picker();
    let (handle, task) = build_pipeline(settings, options, platform);

    // Echo state changes and log lines as they happen
    let mut status_rx = handle.subscribe();
    let printer = tokio::spawn(async move {
        let mut seen = 0u64;
        let mut last_state = None;
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if last_state != Some(status.state) {
                println!("Status: {} [{}]", status.state, status.language);
                last_state = Some(status.state);
            }
            print_new_lines(&status, &mut seen);
        }
    });

    if wake {
        handle.start_wake_listening()?;
    }
    println!("Keys: w = wake word on/off, l = switch language, r = reset chat, s = stop, q = quit");
    println!("Anything else is sent as a typed command.");

    let mut lines = stdin_lines()?;
    let mut pending: Option<PickRequest> = None;
    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            Some(request) = picks.recv() => {
                print_choices(&request);
                pending = Some(request);
                continue;
            }
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        if let Some(request) = pending.take() {
            request.answer(&line);
            continue;
        }

        let status = handle.status();
        match line.trim() {
            "" => {}
            "q" => break,
            "w" if status.wake_enabled => handle.stop_wake_listening()?,
            "w" => handle.start_wake_listening()?,
            "l" => handle.switch_language(status.language.toggle())?,
            "r" => handle.reset_chat()?,
            "s" => handle.cancel()?,
            text => handle.submit_text(text)?,
        }
    }

    // An unanswered choice counts as skipped
    drop(pending);
    handle.shutdown()?;
    task.await?;
    printer.abort();
    Ok(())
}

fn print_choices(request: &PickRequest) {
    println!("{}", request.prompt);
    for (i, app) in request.apps.iter().enumerate() {
        println!("  {:>2}. {} ({})", i + 1, app.name, app.package);
    }
    println!("Type a number or name, or press Enter to skip.");
}

async fn ask(settings: &Settings, text: &str) -> anyhow::Result<()> {
    let (handle, task) = build_pipeline(
        settings,
        PipelineOptions::from_settings(settings),
        DesktopPlatform::new(),
    );

    let status = handle.wait_for(|s| s.started).await?;
    if status.state == PipelineState::Error {
        handle.shutdown()?;
        task.await?;
        bail!("speech models unavailable: {}", status.log.join("; "));
    }

    handle.submit_text(text)?;
    let status = handle
        .wait_for(|s| s.log.iter().any(|l| l == SEPARATOR))
        .await?;
    for line in status.log.iter().filter(|l| l.as_str() != SEPARATOR) {
        println!("{}", line);
    }

    handle.shutdown()?;
    task.await?;
    Ok(())
}
