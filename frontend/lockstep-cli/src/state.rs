//! Save state files: the machine's state blob, zstd-compressed

use anyhow::Context;
use lockstep_core::{LoadReport, Machine};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub fn save(machine: &Machine, path: &Path) -> anyhow::Result<()> {
    let bytes = machine.save_state()?;

    let file = File::create(path)
        .with_context(|| format!("Unable to create state file '{}'", path.display()))?;
    let mut encoder = zstd::stream::Encoder::new(BufWriter::new(file), 0)?;
    encoder.write_all(&bytes)?;
    encoder.finish()?.flush()?;

    Ok(())
}

pub fn load(machine: &mut Machine, path: &Path) -> anyhow::Result<LoadReport> {
    let file = File::open(path)
        .with_context(|| format!("Unable to open state file '{}'", path.display()))?;

    let mut decoder = zstd::stream::Decoder::new(BufReader::new(file))?;
    let mut bytes = Vec::new();
    decoder
        .read_to_end(&mut bytes)
        .with_context(|| format!("Unable to decompress state file '{}'", path.display()))?;

    let report = machine.load_state(&bytes)?;
    if !report.is_clean() {
        log::warn!("State file '{}' did not fully match this machine: {report}", path.display());
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::MachineDescription;
    use test_log::test;

    const BOARD: &str = r#"
        [[regions]]
        name = "ram"
        kind = "Ram"
        size = 0x100

        [[spaces]]
        name = "main"
        addr_bits = 8

        [[units]]
        name = "main"
        ops = [
            { op = "read", space = "main", address = 0x10, cycles = 3 },
            { op = "write", space = "main", address = 0x10, value = 0x77, cycles = 5 },
        ]

        [[ranges]]
        space = "main"
        start = 0x00
        end = 0xff
        target = "ram"
        region = "ram"
    "#;

    #[test]
    fn compressed_state_file_round_trip() {
        let description = MachineDescription::parse(BOARD).unwrap();
        let mut machine = description.build(Path::new(".")).unwrap();
        machine.run_until(1_000);

        let path = std::env::temp_dir().join(format!("lockstep-state-{}.zst", std::process::id()));
        save(&machine, &path).unwrap();
        machine.run_until(2_000);

        let mut fresh = description.build(Path::new(".")).unwrap();
        let report = load(&mut fresh, &path);
        std::fs::remove_file(&path).unwrap();
        assert!(report.unwrap().is_clean());

        assert_eq!(fresh.now(), 1_000);
        fresh.run_until(2_000);

        let main = machine.unit_by_name("main").unwrap();
        assert_eq!(fresh.unit_cycles(main), machine.unit_cycles(main));
    }

    #[test]
    fn missing_state_file_is_an_error() {
        let description = MachineDescription::parse(BOARD).unwrap();
        let mut machine = description.build(Path::new(".")).unwrap();
        let path = std::env::temp_dir().join("lockstep-state-does-not-exist.zst");
        assert!(load(&mut machine, &path).is_err());
    }
}
