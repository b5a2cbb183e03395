use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use stservo_bus::sim::SimulatedBus;
use stservo_bus::{BusHandle, BusSettings};
use stservo_proto::frame::MAX_SERVO_ID;
use stservo_servo::{command, CommandResponse, HostConfig, ServoConfig, ServoHost, StatusReport};

#[derive(Debug, Parser)]
#[command(name = "stservo", version, about = "Feetech ST3215 serial bus servo host")]
struct Cli {
    #[arg(long)]
    config: String,

    /// Serve every configured port from an in-memory servo simulator.
    #[arg(long)]
    simulate: bool,

    /// Print status records as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config and ping every configured servo.
    Doctor,
    /// Ping a range of ids on every configured port.
    Scan {
        #[arg(long, default_value_t = 0)]
        first: u8,
        #[arg(long, default_value_t = MAX_SERVO_ID)]
        last: u8,
    },
    /// Poll every servo once and print its status.
    Status,
    /// Read commands from stdin until EOF or Ctrl-C.
    Console,
    /// Run the given command lines, e.g. "STSERVO_MOVE SERVO=gripper POSITION=3000 WAIT=2".
    Exec {
        #[arg(required = true)]
        lines: Vec<String>,
    },
}

fn load_config(path: &str) -> Result<HostConfig> {
    HostConfig::load(path).with_context(|| format!("load config {}", path))
}

/// One simulator per port, each seeded with that port's configured ids.
fn simulated_buses(servos: &[ServoConfig]) -> BTreeMap<String, SimulatedBus> {
    let mut sims: BTreeMap<String, SimulatedBus> = BTreeMap::new();
    for s in servos {
        let sim = sims.entry(s.serial.clone()).or_default();
        sim.add_servo(s.servo_id, s.initial_position.unwrap_or(2048) as i32);
    }
    sims
}

fn build_host(cfg: &HostConfig, simulate: bool) -> Result<ServoHost> {
    let host = if simulate {
        let sims = simulated_buses(&cfg.servos()?);
        info!("simulating {} bus(es)", sims.len());
        ServoHost::from_config_with(cfg, |port, baud, settings| match sims.get(port) {
            Some(sim) => sim.spawn_bus(port, baud, settings.clone()),
            None => BusHandle::open_serial(port, baud, settings.clone()),
        })
    } else {
        ServoHost::from_config(cfg)
    };
    host.context("build servo host")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg, cli.simulate).await?,
        Command::Scan { first, last } => scan(&cfg, cli.simulate, first, last).await?,
        Command::Status => status(&cfg, cli.simulate, cli.json).await?,
        Command::Console => console(&cfg, cli.simulate, cli.json).await?,
        Command::Exec { lines } => exec(&cfg, cli.simulate, cli.json, &lines).await?,
    }
    Ok(())
}

async fn doctor(cfg: &HostConfig, simulate: bool) -> Result<()> {
    info!("doctor: starting");

    let servos = cfg.servos()?;
    anyhow::ensure!(cfg.bus.attempts >= 1, "bus.attempts must be at least 1");
    anyhow::ensure!(
        cfg.bus.transaction_timeout_ms > 0,
        "bus.transaction_timeout_ms must be positive"
    );
    if cfg.bus != BusSettings::default() {
        info!("doctor: bus policy {:?}", cfg.bus);
    }

    let host = build_host(cfg, simulate)?;
    for (port, bus) in host.buses().iter() {
        info!("doctor: port {} @ {} baud", port, bus.baud());
    }
    for sc in &servos {
        let servo = host.servo(&sc.name).context("servo missing from host")?;
        servo
            .connect()
            .await
            .with_context(|| format!("servo {} (id {} on {})", sc.name, sc.servo_id, sc.serial))?;
        let pos = servo.status().position;
        println!("{}: id {} on {} OK (position {:?})", sc.name, sc.servo_id, sc.serial, pos);
    }

    info!("doctor: OK");
    Ok(())
}

async fn scan(cfg: &HostConfig, simulate: bool, first: u8, last: u8) -> Result<()> {
    anyhow::ensure!(first <= last, "--first must not exceed --last");
    anyhow::ensure!(last <= MAX_SERVO_ID, "--last must be at most {}", MAX_SERVO_ID);

    let host = build_host(cfg, simulate)?;
    for (port, bus) in host.buses().iter() {
        let found = bus
            .scan_ids(first..=last)
            .await
            .with_context(|| format!("scan {}", port))?;
        if found.is_empty() {
            println!("{}: no servos in {}..={}", port, first, last);
        }
        for id in found {
            println!("{}: id {}", port, id);
        }
    }
    Ok(())
}

async fn status(cfg: &HostConfig, simulate: bool, json: bool) -> Result<()> {
    let host = build_host(cfg, simulate)?;
    host.connect().await?;
    for servo in host.servos() {
        if let Err(e) = servo.poll_once().await {
            warn!("status: {}", e);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&host.status_all())?);
    } else {
        for (name, st) in host.status_all() {
            println!("{}", StatusReport { name: &name, status: &st });
        }
    }
    Ok(())
}

fn print_response(resp: &CommandResponse, json: bool) -> Result<()> {
    for line in &resp.lines {
        println!("{}", line);
    }
    if json {
        if let Some(st) = &resp.status {
            println!("{}", serde_json::to_string(st)?);
        }
    }
    Ok(())
}

async fn run_line(host: &ServoHost, line: &str, json: bool) -> Result<()> {
    match host.dispatch(line).await {
        Ok(resp) => print_response(&resp, json),
        Err(e) => {
            println!("!! {}: {}", e.kind(), e);
            Ok(())
        }
    }
}

async fn console(cfg: &HostConfig, simulate: bool, json: bool) -> Result<()> {
    let host = build_host(cfg, simulate)?;
    host.connect().await?;
    host.ready().await;

    println!("commands:");
    for (name, help) in command::command_names().take(6) {
        println!("  {:<22} {}", name, help);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("read stdin")? {
                    Some(line) => run_line(&host, &line, json).await?,
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("console: interrupted");
                break;
            }
        }
    }

    host.shutdown().await;
    Ok(())
}

async fn exec(cfg: &HostConfig, simulate: bool, json: bool, lines: &[String]) -> Result<()> {
    let host = build_host(cfg, simulate)?;
    host.connect().await?;
    host.ready().await;
    for line in lines {
        let resp = host
            .dispatch(line)
            .await
            .with_context(|| format!("exec '{}'", line))?;
        print_response(&resp, json)?;
    }
    for servo in host.servos() {
        servo.stop_polling();
    }
    Ok(())
}
