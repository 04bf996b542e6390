// src/main.rs
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use bode_sweep::config::{ConnectionProfile, DataDir};
use bode_sweep::drivers::{ChannelSetup, Coupling, Endpoint, MeasurementKind};
use bode_sweep::engine::{spawn_sweep, SweepJob, SweepOutcome};
use bode_sweep::manual::{run_generator, run_scope, GeneratorCommand, ScopeCommand};
use bode_sweep::plan::{FrequencyPlan, Spacing};
use bode_sweep::procedure::{measure_point, Bench, PointOutcome};
use bode_sweep::sim::{LowPass, SimBench};
use bode_sweep::state::{RunStatus, SweepControl};
use bode_sweep::types::{Channel, Feed, SignalConfig, SweepEvent, Timing, Waveform};

#[derive(Parser)]
#[clap(author, version, about = "Frequency response sweeps over SCPI")]
struct Cli {
    /// Directory holding the plan, results, profiles and status files.
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the frequency plan.
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
    /// Manage connection profiles.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Connect to both instruments and print their identification.
    Identify {
        #[arg(long)]
        simulate: bool,
    },
    /// Measure a single frequency.
    Measure {
        #[arg(short, long)]
        frequency: f64,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run the full sweep over the stored plan.
    Sweep {
        #[command(flatten)]
        run: RunArgs,
        /// Start even if the status files say a sweep is running.
        #[arg(long)]
        force: bool,
    },
    /// Send one command to the oscilloscope.
    Scope {
        #[arg(long)]
        simulate: bool,
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
        #[command(subcommand)]
        action: ScopeAction,
    },
    /// Send one command to the function generator.
    Generator {
        #[arg(long)]
        simulate: bool,
        #[command(subcommand)]
        action: GeneratorAction,
    },
    /// Ask a running sweep to stop.
    Stop,
    /// Show the state of the current or last sweep.
    Status {
        /// How many feed log lines to print.
        #[arg(long, default_value_t = 20)]
        lines: usize,
    },
    /// Inspect stored measurements.
    Results {
        #[command(subcommand)]
        action: ResultsAction,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    Generate {
        #[arg(long, default_value_t = 10.0)]
        min: f64,
        #[arg(long, default_value_t = 1_000_000.0)]
        max: f64,
        #[arg(short, long, default_value_t = 30)]
        points: usize,
        #[arg(long)]
        linear: bool,
    },
    Show,
    Import { csv: PathBuf },
    Export { csv: PathBuf },
}

#[derive(Subcommand)]
enum ProfileAction {
    List,
    /// Add or replace a profile.
    Add {
        name: String,
        /// Oscilloscope address, host:port
        #[arg(long)]
        scope: Endpoint,
        /// Function generator address, host:port
        #[arg(long)]
        generator: Endpoint,
        #[arg(long)]
        select: bool,
    },
    Select { name: String },
    Remove { name: String },
}

#[derive(Subcommand)]
enum ScopeAction {
    Identify,
    Autoset,
    Run,
    Stop,
    /// Set coupling, display and vertical position of a channel.
    Channel {
        channel: Channel,
        #[arg(long, default_value = "ac")]
        coupling: Coupling,
        #[arg(long)]
        hide: bool,
        /// Divisions.
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        position: f64,
    },
    /// Take one automatic measurement: pk2pk, amplitude, frequency or rms.
    Measure {
        kind: MeasurementKind,
        #[arg(long, default_value = "1")]
        channel: Channel,
    },
    /// Raw SCPI command, no reply expected.
    Send { command: String },
    /// Raw SCPI query, prints the reply.
    Query { command: String },
}

#[derive(Subcommand)]
enum GeneratorAction {
    Identify,
    Reset,
    On {
        #[arg(default_value = "1")]
        channel: Channel,
    },
    Off {
        #[arg(default_value = "1")]
        channel: Channel,
    },
    State {
        #[arg(default_value = "1")]
        channel: Channel,
    },
    /// Configure the signal without switching the output on.
    Apply {
        #[arg(short, long)]
        frequency: f64,
        #[arg(long, default_value = "sine")]
        waveform: Waveform,
        #[arg(long, default_value_t = 0.05)]
        amplitude: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        offset: f64,
        #[arg(long, default_value = "1")]
        channel: Channel,
    },
    Send { command: String },
    Query { command: String },
}

#[derive(Subcommand)]
enum ResultsAction {
    Show,
    Export { csv: PathBuf },
    Clear,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "sine")]
    waveform: Waveform,
    /// Peak-to-peak volts.
    #[arg(long, default_value_t = 0.05)]
    amplitude: f64,
    #[arg(long, default_value_t = 0.0)]
    offset: f64,
    #[arg(long, default_value = "1")]
    channel: Channel,
    #[arg(long, default_value_t = 500)]
    stabilization_ms: u64,
    #[arg(long, default_value_t = 500)]
    inter_point_ms: u64,
    #[arg(long, default_value_t = 200)]
    settle_ms: u64,
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    /// Use the built-in simulated bench instead of the network.
    #[arg(long)]
    simulate: bool,
}

impl RunArgs {
    fn signal(&self) -> SignalConfig {
        SignalConfig {
            waveform: self.waveform,
            amplitude: self.amplitude,
            offset: self.offset,
            channel: self.channel,
        }
    }

    fn timing(&self) -> Timing {
        Timing {
            stabilization: Duration::from_millis(self.stabilization_ms),
            inter_point: Duration::from_millis(self.inter_point_ms),
            settle: Duration::from_millis(self.settle_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn bench(profile: &ConnectionProfile, simulate: bool) -> Bench {
    if simulate {
        SimBench::low_pass(
            profile.generator.clone(),
            profile.oscilloscope.clone(),
            LowPass { seed: 1, noise: 0.01, ..LowPass::default() },
        )
        .bench()
    } else {
        Bench::tcp(profile.generator.clone(), profile.oscilloscope.clone())
    }
}

fn print_event(event: &SweepEvent) {
    match event {
        SweepEvent::Log(line) => println!("{line}"),
        SweepEvent::Progress { step, total } => println!("[{step}/{total}]"),
        SweepEvent::Measured(_) | SweepEvent::Finished { .. } => {}
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let dir = DataDir::new(&cli.data_dir);

    match cli.command {
        Command::Plan { action } => plan_command(&dir, action),
        Command::Profile { action } => profile_command(&dir, action),
        Command::Identify { simulate } => {
            let book = dir.load_profiles()?;
            let profile = book.current();
            let bench = bench(profile, simulate);
            let timing = Timing::default();
            println!("Profile `{}`", profile.name);
            let mut generator = bench.function_generator(&timing);
            generator.connect()?;
            println!("Generator    {}: {}", bench.generator, generator.identify()?);
            generator.disconnect()?;
            let mut scope = bench.oscilloscope(&timing);
            scope.connect()?;
            println!("Oscilloscope {}: {}", bench.scope, scope.identify()?);
            scope.disconnect()?;
            Ok(())
        }
        Command::Measure { frequency, run } => {
            if !(frequency.is_finite() && frequency > 0.0) {
                bail!("frequency must be a positive number of Hz, got {frequency}");
            }
            let book = dir.load_profiles()?;
            let bench = bench(book.current(), run.simulate);
            let store = dir.result_store();
            let (tx, rx) = channel();
            let outcome = measure_point(
                &bench,
                frequency,
                &run.signal(),
                &run.timing(),
                &store,
                Feed::new(Some(&tx)),
                &|| false,
            );
            drop(tx);
            rx.iter().for_each(|e| print_event(&e));
            match outcome? {
                PointOutcome::Measured(p) => println!(
                    "{} Hz: gain {:.4} ({:.2} dB), amplitude gain {:.4}, mean {:.4}",
                    p.frequency, p.gain_pk2pk, p.gain_pk2pk_db, p.gain_amplitude, p.gain_real
                ),
                PointOutcome::Stopped => println!("Stopped."),
            }
            Ok(())
        }
        Command::Sweep { run, force } => {
            let files = dir.status_files();
            if files.read_control()?.running && !force {
                bail!(
                    "another sweep is marked as running in {} (use --force if it died)",
                    dir.root().display()
                );
            }
            let book = dir.load_profiles()?;
            let plan = dir.load_plan()?;
            let job = SweepJob {
                bench: bench(book.current(), run.simulate),
                signal: run.signal(),
                timing: run.timing(),
                plan,
            };
            files.clear_log()?;
            let control = Arc::new(SweepControl::mirrored(files));
            control.reset();
            let store = Arc::new(dir.result_store());
            let (tx, rx) = channel();
            let handle = spawn_sweep(job, store, control.clone(), tx)?;
            for event in rx.iter() {
                print_event(&event);
            }
            let outcome = handle
                .join()
                .map_err(|_| anyhow::anyhow!("sweep thread panicked"))??;
            let summary = outcome.summary();
            match outcome {
                SweepOutcome::Completed(_) => println!(
                    "Done: {} measured, {} failed, {} total.",
                    summary.measured, summary.failed, summary.total
                ),
                SweepOutcome::Stopped(_) => println!(
                    "Stopped by user after {} of {} points.",
                    summary.measured, summary.total
                ),
            }
            Ok(())
        }
        Command::Stop => {
            let files = dir.status_files();
            if !files.read_control()?.running {
                println!("No sweep is running.");
                return Ok(());
            }
            files.request_stop()?;
            println!("Stop requested, the sweep ends at its next checkpoint.");
            Ok(())
        }
        Command::Scope { simulate, settle_ms, action } => {
            let book = dir.load_profiles()?;
            let timing = Timing {
                settle: Duration::from_millis(settle_ms),
                ..Timing::default()
            };
            let mut scope = bench(book.current(), simulate).oscilloscope(&timing);
            println!("{}", run_scope(&mut scope, &scope_command(action))?);
            Ok(())
        }
        Command::Generator { simulate, action } => {
            let book = dir.load_profiles()?;
            let cmd = generator_command(action)?;
            let mut generator = bench(book.current(), simulate).function_generator(&Timing::default());
            println!("{}", run_generator(&mut generator, &cmd)?);
            Ok(())
        }
        Command::Status { lines } => {
            let files = dir.status_files();
            let state = files.read_progress()?;
            let control = files.read_control()?;
            println!(
                "{:?}  step {}/{}  (updated {})",
                state.status,
                state.current_step,
                state.total_steps,
                state.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
            if control.stop_requested && state.status != RunStatus::Idle {
                println!("stop requested");
            }
            for line in files.read_log(lines)? {
                println!("{line}");
            }
            Ok(())
        }
        Command::Results { action } => results_command(&dir, action),
    }
}

fn scope_command(action: ScopeAction) -> ScopeCommand {
    match action {
        ScopeAction::Identify => ScopeCommand::Identify,
        ScopeAction::Autoset => ScopeCommand::AutoSetup,
        ScopeAction::Run => ScopeCommand::Run,
        ScopeAction::Stop => ScopeCommand::Stop,
        ScopeAction::Channel { channel, coupling, hide, position } => ScopeCommand::Channel {
            channel,
            setup: ChannelSetup { coupling, display: !hide, position },
        },
        ScopeAction::Measure { kind, channel } => ScopeCommand::Measure { channel, kind },
        ScopeAction::Send { command } => ScopeCommand::Send(command),
        ScopeAction::Query { command } => ScopeCommand::Query(command),
    }
}

fn generator_command(action: GeneratorAction) -> anyhow::Result<GeneratorCommand> {
    Ok(match action {
        GeneratorAction::Identify => GeneratorCommand::Identify,
        GeneratorAction::Reset => GeneratorCommand::Reset,
        GeneratorAction::On { channel } => GeneratorCommand::OutputOn(channel),
        GeneratorAction::Off { channel } => GeneratorCommand::OutputOff(channel),
        GeneratorAction::State { channel } => GeneratorCommand::OutputState(channel),
        GeneratorAction::Apply { frequency, waveform, amplitude, offset, channel } => {
            if !(frequency.is_finite() && frequency > 0.0) {
                bail!("frequency must be a positive number of Hz, got {frequency}");
            }
            let signal = SignalConfig { waveform, amplitude, offset, channel };
            signal.validate()?;
            GeneratorCommand::Apply { signal, frequency }
        }
        GeneratorAction::Send { command } => GeneratorCommand::Send(command),
        GeneratorAction::Query { command } => GeneratorCommand::Query(command),
    })
}

fn plan_command(dir: &DataDir, action: PlanAction) -> anyhow::Result<()> {
    let path = dir.plan_file();
    match action {
        PlanAction::Generate { min, max, points, linear } => {
            let spacing = if linear { Spacing::Linear } else { Spacing::Logarithmic };
            let plan = FrequencyPlan::generate(min, max, points, spacing)?;
            plan.save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Saved {} frequencies to {}", plan.len(), path.display());
        }
        PlanAction::Show => {
            let plan = FrequencyPlan::load(&path)?;
            for (i, f) in plan.frequencies().iter().enumerate() {
                println!("{:>3}  {f} Hz", i + 1);
            }
        }
        PlanAction::Import { csv } => {
            let plan = FrequencyPlan::import_csv(&csv)
                .with_context(|| format!("importing {}", csv.display()))?;
            plan.save(&path)?;
            println!("Imported {} frequencies", plan.len());
        }
        PlanAction::Export { csv } => {
            FrequencyPlan::load(&path)?
                .export_csv(&csv)
                .with_context(|| format!("writing {}", csv.display()))?;
            println!("Exported to {}", csv.display());
        }
    }
    Ok(())
}

fn profile_command(dir: &DataDir, action: ProfileAction) -> anyhow::Result<()> {
    let path = dir.profiles_file();
    let mut book = dir.load_profiles()?;
    match action {
        ProfileAction::List => {
            for p in book.profiles() {
                let mark = if p.name == book.current_name() { "*" } else { " " };
                println!(
                    "{mark} {:<16} scope {:<22} generator {}",
                    p.name,
                    p.oscilloscope.to_string(),
                    p.generator
                );
            }
            return Ok(());
        }
        ProfileAction::Add { name, scope, generator, select } => {
            book.upsert(ConnectionProfile { name: name.clone(), oscilloscope: scope, generator });
            if select {
                book.select(&name)?;
            }
        }
        ProfileAction::Select { name } => book.select(&name)?,
        ProfileAction::Remove { name } => {
            book.remove(&name)?;
        }
    }
    book.save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Current profile: {}", book.current_name());
    Ok(())
}

fn results_command(dir: &DataDir, action: ResultsAction) -> anyhow::Result<()> {
    let store = dir.result_store();
    match action {
        ResultsAction::Show => {
            let data = store.load()?;
            println!("{:>12}  {:>10}  {:>10}  {:>9}  {:>9}", "Hz", "CH1 Vpp", "CH2 Vpp", "gain", "dB");
            for p in data.sorted() {
                println!(
                    "{:>12}  {:>10.5}  {:>10.5}  {:>9.4}  {:>9.2}",
                    p.frequency, p.ch1_pk2pk, p.ch2_pk2pk, p.gain_pk2pk, p.gain_pk2pk_db
                );
            }
            println!(
                "{} points, last modified {}",
                data.measurements.len(),
                data.last_modified.format("%Y-%m-%d %H:%M:%S")
            );
        }
        ResultsAction::Export { csv } => {
            let rows = store
                .export_csv(&csv)
                .with_context(|| format!("writing {}", csv.display()))?;
            println!("Exported {rows} points to {}", csv.display());
        }
        ResultsAction::Clear => {
            store.clear()?;
            println!("Results cleared.");
        }
    }
    Ok(())
}
