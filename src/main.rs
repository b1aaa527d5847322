// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{io::Write, fs::File, path::PathBuf, time::{Instant, Duration}};
use clap::{Command, Arg, ArgAction, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use anyhow::{bail, Context};

use tapflash::config::Config;
use tapflash::ftdi::{AdapterInfo, FtdiBitbang, FTDI_VID};
use tapflash::jtag::Tap;
use tapflash::dap::{Dap, MemoryAccess};
use tapflash::device::DeviceCatalog;
use tapflash::flash::Flash;

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = Command::new("tapflash")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("config")
             .help("Config file to use instead of the per-user default")
             .long("config")
             .short('c')
             .action(ArgAction::Set)
             .value_parser(value_parser!(PathBuf))
             .global(true))
        .arg(Arg::new("adapter")
             .help("VID:PID[:SN] of FTDI adapter to use")
             .long("adapter")
             .short('a')
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("freq")
             .help("JTAG clock frequency in Hz (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("ir-length")
             .help("Length of the target's instruction register")
             .long("ir-length")
             .short('i')
             .action(ArgAction::Set)
             .value_parser(value_parser!(usize))
             .global(true))
        .arg(Arg::new("device")
             .help("Device name to use instead of identifying by IDCODE")
             .long("device")
             .short('d')
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("force")
             .help("Use the --device even if its IDCODE does not match the target")
             .long("force")
             .action(ArgAction::SetTrue)
             .global(true))
        .subcommand(Command::new("adapters")
            .about("List available FTDI adapters"))
        .subcommand(Command::new("scan")
            .about("Read the target's IDCODE and look it up"))
        .subcommand(Command::new("info")
            .about("Identify the target and print its details"))
        .subcommand(Command::new("reset")
            .about("Reset the target through AIRCR")
            .arg(Arg::new("srst")
                 .help("Pulse the nSRST line for 100ms instead")
                 .long("srst")
                 .action(ArgAction::SetTrue)))
        .subcommand(Command::new("halt")
            .about("Halt the target core"))
        .subcommand(Command::new("resume")
            .about("Resume the target core"))
        .subcommand(Command::new("flash")
            .about("Erase, program and verify flash with a binary file")
            .arg(Arg::new("file")
                 .help("Binary file to program")
                 .required(true))
            .arg(Arg::new("address")
                 .help("Start address, defaults to the start of flash (decimal, or hex with 0x prefix)")
                 .long("address")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<u32>))
            .arg(Arg::new("reset")
                 .help("Don't reset the target after programming")
                 .long("no-reset")
                 .action(ArgAction::SetFalse)))
        .subcommand(Command::new("erase")
            .about("Erase flash")
            .arg(Arg::new("address")
                 .help("Start address, defaults to the start of flash (decimal, or hex with 0x prefix)")
                 .long("address")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<u32>))
            .arg(Arg::new("length")
                 .help("Length in bytes, defaults to the rest of the flash region \
                       (decimal, or hex with 0x prefix)")
                 .long("length")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<usize>)))
        .subcommand(Command::new("dump")
            .about("Read target memory")
            .arg(Arg::new("address")
                 .help("Start address, a multiple of 4 (decimal, or hex with 0x prefix)")
                 .required(true)
                 .value_parser(maybe_hex::<u32>))
            .arg(Arg::new("length")
                 .help("Length in bytes, a multiple of 4 (decimal, or hex with 0x prefix)")
                 .required(true)
                 .value_parser(maybe_hex::<usize>))
            .arg(Arg::new("file")
                 .help("Write raw data to this file instead of printing a hexdump")
                 .long("file")
                 .action(ArgAction::Set)))
        .subcommand(Command::new("save-config")
            .about("Write the current settings to a config file")
            .arg(Arg::new("path")
                 .help("File to write, defaults to the per-user config file")
                 .value_parser(value_parser!(PathBuf))))
        .get_matches();

    let t0 = Instant::now();

    // Load the config file first, since it can raise the log level.
    let config_path = matches.get_one::<PathBuf>("config").cloned().or_else(Config::default_path);
    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let quiet = matches.get_flag("quiet");
    let mut verbose = matches.get_count("verbose");
    if config.verbose && !quiet && verbose == 0 {
        verbose = 1;
    }
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Command-line options override the config file.
    let adapter = matches.get_one::<String>("adapter")
                         .map(|spec| AdapterInfo::from_specifier(spec))
                         .transpose()?;
    if let Some(info) = &adapter {
        config.vid = info.vid;
        config.pid = info.pid;
        config.serial = info.sn.clone();
    }
    if let Some(&freq) = matches.get_one::<u32>("freq") {
        config.clock_khz = (freq / 1000).max(1);
    }
    if let Some(&ir_length) = matches.get_one::<usize>("ir-length") {
        config.ir_length = ir_length;
    }
    config.force |= matches.get_flag("force");

    // Commands which do not need an adapter.
    match matches.subcommand() {
        Some(("adapters", _)) => {
            print_adapter_list();
            return Ok(());
        },
        Some(("save-config", sub)) => {
            let path = match sub.get_one::<PathBuf>("path").cloned().or(config_path) {
                Some(path) => path,
                None => bail!("No default config location available; specify a path."),
            };
            config.save(&path)?;
            if !quiet { println!("Saved config to {}", path.display()) };
            return Ok(());
        },
        _ => (),
    }

    // All commands after this point need an open adapter.
    config.check_adapter()?;
    let mut ftdi = if adapter.is_some()
                      || config.serial.is_some()
                      || (config.vid, config.pid) != (FTDI_VID, 0x6010)
    {
        config.adapter_info().open()?
    } else {
        FtdiBitbang::new()?
    };
    ftdi.set_baudrate(config.clock_khz * 1000)?;
    let mut tap = Tap::new(ftdi)?;
    tap.set_clock(config.clock_khz);
    tap.set_ir_length(config.ir_length)?;

    if let Some(("reset", sub)) = matches.subcommand() {
        if sub.get_flag("srst") {
            if !quiet { println!("Pulsing nSRST line.") };
            tap.pulse_srst(Duration::from_millis(100))?;
            return Ok(());
        }
    }

    let idcode = tap.read_idcode()?;
    let catalog = config.catalog();

    if let Some(("scan", _)) = matches.subcommand() {
        print_scan(&catalog, idcode);
        return Ok(());
    }

    let name = matches.get_one::<String>("device").map(|name| name.as_str());
    let device = catalog.identify(idcode, name, config.force)?.clone();
    log::info!("Identified {} (IDCODE 0x{:08X})", device.name, idcode);

    let mut dap = Dap::new(tap);
    dap.power_up()?;

    match matches.subcommand() {
        Some(("info", _)) => {
            println!("IDCODE: 0x{:08X}", idcode);
            println!("{}", device);
            println!("  AP IDR: 0x{:08X}", dap.read_ap_idr()?);
            println!("  Core: {}", if dap.is_halted()? { "halted" } else { "running" });
        },
        Some(("reset", _)) => {
            if !quiet { println!("Resetting target.") };
            dap.reset()?;
        },
        Some(("halt", _)) => {
            dap.halt()?;
            if !quiet { println!("Core halted.") };
        },
        Some(("resume", _)) => {
            dap.resume()?;
            if !quiet { println!("Core resumed.") };
        },
        Some(("flash", sub)) => {
            let path = sub.get_one::<String>("file").unwrap();
            let data = std::fs::read(path).with_context(|| format!("Could not read {}", path))?;
            let address = match sub.get_one::<u32>("address").copied().or(device.flash_base()) {
                Some(address) => address,
                None => bail!("Device {} has no flash regions.", device.name),
            };
            let reset = sub.get_flag("reset");
            {
                let mut flash = Flash::attach(&mut dap, &device)?;
                if quiet {
                    flash.erase(address, data.len())?;
                    flash.program(address, &data)?;
                } else {
                    flash.erase_progress(address, data.len())?;
                    flash.program_progress(address, &data)?;
                }
                flash.finish()?;
            }
            if reset {
                dap.reset()?;
            }
        },
        Some(("erase", sub)) => {
            let address = match sub.get_one::<u32>("address").copied().or(device.flash_base()) {
                Some(address) => address,
                None => bail!("Device {} has no flash regions.", device.name),
            };
            let length = match sub.get_one::<usize>("length") {
                Some(&length) => length,
                None => match device.region_containing(address) {
                    Some(region) => (region.end() - address as u64) as usize,
                    None => bail!("Address 0x{:08X} is not in flash.", address),
                },
            };
            let mut flash = Flash::attach(&mut dap, &device)?;
            if quiet {
                flash.erase(address, length)?;
            } else {
                flash.erase_progress(address, length)?;
            }
            flash.finish()?;
        },
        Some(("dump", sub)) => {
            let address = *sub.get_one::<u32>("address").unwrap();
            let length = *sub.get_one::<usize>("length").unwrap();
            let data = dap.read_memory(address, length)?;
            match sub.get_one::<String>("file") {
                Some(path) => {
                    let mut file = File::create(path)?;
                    file.write_all(&data)?;
                },
                None => print_hexdump(address, &data),
            }
        },
        _ => panic!("Unhandled command."),
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

fn print_adapter_list() {
    let adapters = AdapterInfo::list();
    if adapters.is_empty() {
        println!("No FTDI adapters found.");
    } else {
        println!("Found {} FTDI adapter{}:", adapters.len(),
                 if adapters.len() == 1 { "" } else { "s" });
        for adapter in adapters {
            println!("  {}", adapter);
        }
    }
}

fn print_scan(catalog: &DeviceCatalog, idcode: u32) {
    let matches: Vec<&str> = catalog.devices().iter()
                                    .filter(|d| d.matches(idcode))
                                    .map(|d| d.name.as_str())
                                    .collect();
    if matches.is_empty() {
        println!("IDCODE 0x{:08X} [unknown device]", idcode);
    } else {
        println!("IDCODE 0x{:08X} [{}]", idcode, matches.join(", "));
    }
}

fn print_hexdump(address: u32, data: &[u8]) {
    for (idx, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
        let ascii: String = line.iter()
                                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                                .collect();
        println!("{:08X}: {:<47}  |{}|", address as usize + idx * 16, hex.join(" "), ascii);
    }
}
