mod description;
mod state;

use crate::description::MachineDescription;
use anyhow::Context;
use clap::Parser;
use crc::Crc;
use env_logger::Env;
use lockstep_config::OpenBusPolicy;
use lockstep_core::Machine;
use lockstep_core::trace::TraceDevice;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

const TRACE_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Parser)]
struct Args {
    /// Machine description file (TOML)
    #[arg(short = 'm', long)]
    machine: PathBuf,

    /// Number of master clock ticks to run
    #[arg(short = 'c', long, default_value_t = 1_000_000)]
    cycles: u64,

    /// Load a save state before running
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a save state after running
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Print every trace record instead of only a per-unit digest
    #[arg(long, default_value_t)]
    dump_trace: bool,

    /// Override the open bus policy (AllOnes / Zero / LastValue)
    #[arg(long)]
    open_bus: Option<OpenBusPolicy>,

    /// Override the scheduling quantum, in master clock ticks
    #[arg(long)]
    quantum: Option<NonZeroU64>,

    /// Log unmapped accesses at warn level
    #[arg(long, default_value_t)]
    log_unmapped: bool,
}

impl Args {
    fn apply_overrides(&self, description: &mut MachineDescription) {
        if let Some(open_bus) = self.open_bus {
            description.core.open_bus = open_bus;
        }
        if let Some(quantum) = self.quantum {
            description.core.quantum = Some(quantum);
        }
        description.core.log_unmapped |= self.log_unmapped;
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut description = MachineDescription::load(&args.machine)?;
    args.apply_overrides(&mut description);
    log::info!("Core configuration:\n{}", description.core);

    let base_dir = args.machine.parent().unwrap_or_else(|| Path::new("."));
    let mut machine = description
        .build(base_dir)
        .with_context(|| format!("Unable to build machine from '{}'", args.machine.display()))?;

    if let Some(path) = &args.load_state {
        let report = state::load(&mut machine, path)?;
        log::info!("Loaded state from '{}': {report}", path.display());
    }

    let start = machine.now();
    machine.run_for(args.cycles);
    log::info!("Ran from master time {start} to {}", machine.now());

    print_summary(&machine, &description, args.dump_trace);

    if let Some(path) = &args.save_state {
        state::save(&machine, path)?;
        log::info!("Saved state to '{}'", path.display());
    }

    Ok(())
}

fn print_summary(machine: &Machine, description: &MachineDescription, dump_trace: bool) {
    println!("master time: {}", machine.now());

    for unit in &description.units {
        let Some(id) = machine.unit_by_name(&unit.name) else { continue };
        let cycles = machine.unit_cycles(id).unwrap_or(0);
        let time = machine.unit_time(id).unwrap_or(0);
        let suspended = if machine.is_suspended(id) { " (suspended)" } else { "" };
        println!("{}: {cycles} cycles, master time {time}{suspended}", unit.name);

        let Some(device) = machine.device::<TraceDevice>(id) else { continue };
        let records = device.records();

        let mut digest = TRACE_CRC.digest();
        for record in records {
            digest.update(record.to_string().as_bytes());
            if dump_trace {
                println!("  {record}");
            }
        }
        println!(
            "  {} trace records ({} older dropped), CRC32 {:08X}",
            records.len(),
            device.dropped_records(),
            digest.finalize()
        );
    }
}
