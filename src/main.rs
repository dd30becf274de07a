use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jbdbms_lib::protocol::{Status, SwitchState};
use jbdbms_lib::serialport::SerialJbdBms;
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_status(status: &Status) {
    println!("Status: {status:?}");
    println!(
        "Voltage: {:.2}V Current: {:.2}A Capacity: {:.2}/{:.2}Ah ({}%)",
        f32::from(status.voltage) / 100.0,
        f32::from(status.current) / 100.0,
        f32::from(status.remaining_capacity) / 100.0,
        f32::from(status.nominal_capacity) / 100.0,
        status.current_capacity
    );
    println!("Production date: {}", status.production_date);
    println!("Balancing: {}", status.balance());
    println!(
        "Mosfets: charge={} discharge={}",
        status.mosfet_status.charge(),
        status.mosfet_status.discharge()
    );
    println!("Temperatures: {:?} °C", status.temperatures_celsius());
    for fault in status.faults() {
        println!("Fault: {fault}");
    }
}

macro_rules! print_status {
    ($bms:expr) => {
        print_status(&$bms.get_status().with_context(|| "Cannot get status")?)
    };
}
macro_rules! print_cells {
    ($bms:expr) => {
        println!(
            "Cell voltages (mV): {:?}",
            $bms.get_cells()
                .with_context(|| "Cannot get cell voltages")?
                .voltages
        )
    };
}
macro_rules! print_hardware {
    ($bms:expr) => {
        println!(
            "Hardware: {}",
            $bms.get_hardware()
                .with_context(|| "Cannot get hardware id")?
                .id
        )
    };
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut bms = SerialJbdBms::open(&args.device, args.baud)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout)?;
    bms.set_delay(args.delay);
    if args.rts_direction {
        bms.use_rts_direction(args.rts_inverted)
            .with_context(|| "Cannot use RTS for direction control")?;
    }
    if args.dump_frames {
        bms.set_frame_observer(|frame| info!("Frame: {frame:02X?}"));
    }

    match args.command {
        CliCommands::Status => print_status!(bms),
        CliCommands::Cells => print_cells!(bms),
        CliCommands::Hardware => print_hardware!(bms),
        CliCommands::All => {
            print_hardware!(bms);
            print_status!(bms);
            print_cells!(bms);
        }
        CliCommands::SetMosfet { charge, discharge } => bms
            .set_mosfet_status(SwitchState::new(charge, discharge))
            .with_context(|| "Cannot set mosfet status")?,
        CliCommands::Daemon {
            output,
            interval,
            metrics,
        } => daemon::run(bms, output, interval, metrics)?,
    }

    Ok(())
}
