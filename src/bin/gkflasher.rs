//! GKFlasher command line front-end

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn, LevelFilter};

use gkflasher::config::{FlasherConfig, Protocol};
use gkflasher::definitions::{BaudrateIndex, ECU_IDENTIFICATION_TABLE};
use gkflasher::ecu::Ecu;
use gkflasher::flasher::{
    correct_checksum_file, generate_bin, generate_sie, Flasher, FlashZones, ReadRegion,
};
use gkflasher::hardware::kline::KLineChannel;
use gkflasher::kwp2000::Kwp2000Protocol;
use gkflasher::memory::CancellationToken;
use gkflasher::smartra::{calculate_smartra_pin, last_6_digits};
use gkflasher::{immo, DiagError, DiagServerResult, ProgressSink};

#[derive(Parser, Debug)]
#[command(name = "gkflasher", version, about = "KWP2000 flasher for Siemens SIMK4x ECUs")]
struct Args {
    /// Protocol to use: canbus or kline
    #[arg(short, long)]
    protocol: Option<String>,
    /// Interface (serial device or CAN interface name)
    #[arg(short, long)]
    interface: Option<String>,
    /// Initial link baud rate
    #[arg(short, long)]
    baudrate: Option<u32>,
    /// Baud rate index to renegotiate to (0x01-0x05)
    #[arg(long, value_parser = parse_number)]
    desired_baudrate: Option<u64>,
    /// Filename to full flash
    #[arg(short, long)]
    flash: Option<PathBuf>,
    /// Filename to flash the calibration zone from
    #[arg(long)]
    flash_calibration: Option<PathBuf>,
    /// Filename to flash the program zone from
    #[arg(long)]
    flash_program: Option<PathBuf>,
    /// Read the whole eeprom
    #[arg(short, long)]
    read: bool,
    /// Read the calibration zone
    #[arg(long)]
    read_calibration: bool,
    /// Read the program zone
    #[arg(long)]
    read_program: bool,
    /// Print ECU identification and immobilizer info
    #[arg(long)]
    id: bool,
    /// Recalculate the checksums of an image file
    #[arg(long)]
    correct_checksum: Option<PathBuf>,
    /// Convert a BIN image to SIE
    #[arg(long)]
    bin_to_sie: Option<PathBuf>,
    /// Convert a SIE image to BIN
    #[arg(long)]
    sie_to_bin: Option<PathBuf>,
    /// Clear learned adaptive values
    #[arg(long)]
    clear_adaptive_values: bool,
    /// Live sensor logging (handled by the separate datalogger tool)
    #[arg(short, long)]
    logger: bool,
    /// Filename to save the eeprom dump to
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Offset to start reading/flashing from
    #[arg(short = 's', long, value_parser = parse_number)]
    address_start: Option<u64>,
    /// Offset to stop reading/flashing at
    #[arg(short = 'e', long, value_parser = parse_number)]
    address_stop: Option<u64>,
    /// Config filename
    #[arg(short, long, default_value = "gkflasher.yml")]
    config: PathBuf,
    /// Immobilizer menu
    #[arg(long)]
    immo: bool,
    /// Verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_number(s: &str) -> Result<u64, String> {
    let result = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    result.map_err(|e| e.to_string())
}

/// [ProgressSink] backed by an indicatif bar
#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl ProgressSink for BarProgress {
    fn begin(&mut self, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:24} [{bar:40}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        self.bar = Some(bar);
    }

    fn advance(&mut self, amount: usize) {
        if let Some(bar) = &self.bar {
            bar.inc(amount as u64);
        }
    }

    fn phase(&mut self, title: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(title.to_string());
        }
    }
}

impl Drop for BarProgress {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

fn prompt(message: &str) -> String {
    print!("{message}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    line.trim().to_string()
}

fn confirm(message: &str) -> bool {
    prompt(&format!("{message} [y/n]: ")) == "y"
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> DiagServerResult<()> {
    // Offline image operations need no bus at all
    if let Some(path) = &args.correct_checksum {
        for report in correct_checksum_file(path)? {
            println!(
                "[*] {} checksum: 0x{:04X} -> 0x{:04X}",
                report.region, report.previous, report.corrected
            );
        }
        return Ok(());
    }
    if let Some(path) = &args.bin_to_sie {
        let output = generate_sie(path)?;
        println!("[*] Done! Converted file saved as {}", output.display());
        return Ok(());
    }
    if let Some(path) = &args.sie_to_bin {
        let output = generate_bin(path)?;
        println!("[*] Done! Converted file saved as {}", output.display());
        return Ok(());
    }
    if args.logger {
        println!("[!] Live sensor logging is handled by the separate datalogger tool.");
        return Ok(());
    }

    let desired_baudrate = match args.desired_baudrate {
        None => None,
        Some(index) => match BaudrateIndex::from_repr(index as u8) {
            Some(baud) => Some(baud),
            None => {
                println!("[!] Selected baudrate is invalid! Available baudrates:");
                for baud in [
                    BaudrateIndex::Baud10400,
                    BaudrateIndex::Baud20000,
                    BaudrateIndex::Baud40000,
                    BaudrateIndex::Baud60000,
                    BaudrateIndex::Baud120000,
                ] {
                    println!("    0x{:02X} - {}", baud as u8, baud.bits_per_second());
                }
                return Err(DiagError::ParameterInvalid);
            }
        },
    };

    let mut config = FlasherConfig::load(&args.config)?;
    if let Some(protocol) = &args.protocol {
        config.protocol = match protocol.as_str() {
            "kline" => Protocol::Kline,
            "canbus" => Protocol::Canbus,
            other => {
                error!("unknown protocol {other}");
                return Err(DiagError::ParameterInvalid);
            }
        };
    }

    println!("[*] Selected protocol: {:?}. Initializing..", config.protocol);
    let kwp = build_protocol(&config, &args)?;
    let mut flasher = Flasher::new(kwp);

    let result = session(&mut flasher, &args, desired_baudrate);
    flasher.close();
    result
}

fn build_protocol(config: &FlasherConfig, args: &Args) -> DiagServerResult<Kwp2000Protocol> {
    match config.protocol {
        Protocol::Kline => {
            let mut kline = config
                .kline
                .clone()
                .ok_or(DiagError::ParameterInvalid)?;
            if let Some(interface) = &args.interface {
                kline.interface = interface.clone();
            }
            if let Some(baudrate) = args.baudrate {
                kline.baudrate = baudrate;
            }
            let interface = gkflasher::hardware::kline::resolve_port(&kline.interface)?;
            let channel =
                KLineChannel::new(&interface, kline.baudrate, kline.tx_id, kline.rx_id);
            Ok(Kwp2000Protocol::new(Box::new(channel)))
        }
        Protocol::Canbus => {
            #[cfg(all(target_os = "linux", feature = "socketcan"))]
            {
                let mut canbus = config
                    .canbus
                    .clone()
                    .ok_or(DiagError::ParameterInvalid)?;
                if let Some(interface) = &args.interface {
                    canbus.interface = interface.clone();
                }
                let channel = gkflasher::hardware::socketcan::CanIsoTpChannel::new(
                    &canbus.interface,
                    canbus.tx_id,
                    canbus.rx_id,
                );
                Ok(Kwp2000Protocol::new(Box::new(channel)))
            }
            #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
            {
                error!("canbus support requires a Linux build with the socketcan feature");
                Err(DiagError::ParameterInvalid)
            }
        }
    }
}

fn choose_ecu_manually() -> Option<Ecu> {
    println!("[!] Failed to identify your ECU!");
    println!("[*] If you know what you're doing (like trying to revive a soft bricked ECU),");
    println!("    you can choose your ECU from the list below:");
    for (index, variant) in ECU_IDENTIFICATION_TABLE.iter().enumerate() {
        println!("    [{index}] {}", variant.name);
    }
    let choice = prompt("ECU or any other char to abort: ");
    let index: usize = choice.parse().ok()?;
    let variant = ECU_IDENTIFICATION_TABLE.get(index)?;
    Some(Ecu::from_variant(variant))
}

fn session(
    flasher: &mut Flasher,
    args: &Args,
    desired_baudrate: Option<BaudrateIndex>,
) -> DiagServerResult<()> {
    println!("[*] Trying to start diagnostic session");
    flasher.connect(desired_baudrate)?;

    println!("[*] Trying to identify ECU automatically..");
    let ecu = match flasher.identify() {
        Ok(ecu) => ecu,
        Err(DiagError::IdentificationFailed) => match choose_ecu_manually() {
            Some(ecu) => {
                flasher.set_ecu(ecu);
                ecu
            }
            None => {
                println!("[!] Aborting..");
                return Err(DiagError::IdentificationFailed);
            }
        },
        Err(e) => return Err(e),
    };
    println!("[*] Found! {}", ecu.name());

    println!("[*] Trying to find calibration..");
    match ecu.get_calibration_description(flasher.kwp()) {
        Ok(description) => {
            let calibration = ecu.get_calibration(flasher.kwp()).unwrap_or_default();
            println!("[*] Found! Description: {description}, calibration: {calibration}");
        }
        Err(e) => {
            warn!("calibration probe failed: {e}");
            if !confirm("[!] Failed! Do you want to continue?") {
                return Err(e);
            }
        }
    }

    if args.immo {
        return immo_menu(flasher);
    }

    if args.id {
        print_identification(flasher)?;
    }

    let cancel = CancellationToken::new();

    if args.read || args.read_calibration || args.read_program {
        let region = if args.read {
            ReadRegion::Full
        } else if args.read_calibration {
            ReadRegion::Calibration
        } else {
            ReadRegion::Program
        };
        read_to_file(flasher, args, region, &cancel)?;
    }

    for (path, zones) in [
        (&args.flash, FlashZones::both()),
        (
            &args.flash_calibration,
            FlashZones {
                calibration: true,
                program: false,
            },
        ),
        (
            &args.flash_program,
            FlashZones {
                calibration: false,
                program: true,
            },
        ),
    ] {
        if let Some(path) = path {
            flash_from_file(flasher, path, zones, &cancel)?;
        }
    }

    if args.clear_adaptive_values {
        print!("[*] Clearing adaptive values.. ");
        flasher.clear_adaptive_values()?;
        println!("Done! Turn off ignition for 10 seconds to apply changes.");
    }

    Ok(())
}

fn print_identification(flasher: &mut Flasher) -> DiagServerResult<()> {
    println!("[*] Reading ECU Identification..");
    for (pid, value) in flasher.kwp().fetch_ecu_identification()? {
        let hex: Vec<String> = value.iter().map(|x| format!("{x:#04x}")).collect();
        let ascii: String = value
            .iter()
            .map(|x| {
                let c = *x as char;
                if c.is_ascii_graphic() {
                    c
                } else {
                    '.'
                }
            })
            .collect();
        println!();
        println!("    [*] [{:#04x}] {}:", pid as u8, pid.name());
        println!("            [HEX]: {}", hex.join(" "));
        println!("            [ASCII]: {ascii}");
    }

    match flasher.immo_query() {
        Ok(info) => {
            println!("[*] Immo keys learnt: {}", info.keys_learnt);
            println!("[*] Immo ECU status: {}", info.ecu_status);
            println!("[*] Immo key status: {}", info.key_status);
            if let Some(smartra) = info.smartra_status {
                println!("[*] Smartra status: {smartra}");
            }
        }
        Err(DiagError::NegativeResponse { .. }) => println!("[*] Immo seems to be disabled"),
        Err(e) => return Err(e),
    }
    Ok(())
}

fn read_to_file(
    flasher: &mut Flasher,
    args: &Args,
    region: ReadRegion,
    cancel: &CancellationToken,
) -> DiagServerResult<()> {
    let mut progress = BarProgress::default();
    let eeprom = match (args.address_start, args.address_stop, region) {
        (Some(start), stop, ReadRegion::Full) => {
            let ecu = *flasher.ecu().ok_or(DiagError::IdentificationFailed)?;
            let stop = stop.unwrap_or(
                start + ecu.variant().eeprom_size_bytes as u64,
            );
            flasher.read_range(start as u32, stop as u32, &mut progress, cancel)?
        }
        _ => flasher.read_region(region, &mut progress, cancel)?,
    };
    drop(progress);

    let output = match &args.output {
        Some(path) => path.clone(),
        None => PathBuf::from(
            flasher
                .default_output_filename()
                .unwrap_or_else(|_| "output.bin".to_string()),
        ),
    };
    std::fs::write(&output, &eeprom)?;
    println!("[*] saved to {}", output.display());
    println!("[*] Done!");
    Ok(())
}

fn flash_from_file(
    flasher: &mut Flasher,
    path: &PathBuf,
    zones: FlashZones,
    cancel: &CancellationToken,
) -> DiagServerResult<()> {
    println!("\n[*] Loading up {}", path.display());
    let image = std::fs::read(path)?;
    println!("[*] Loaded {} bytes", image.len());

    if !confirm("[?] Ready to flash! Do you wish to continue?") {
        println!("[!] Aborting!");
        return Ok(());
    }

    let mut progress = BarProgress::default();
    flasher.flash_image(&image, zones, &mut progress, cancel)?;
    drop(progress);
    println!("[*] ecu reset");
    println!("[*] done!");
    Ok(())
}

fn prompt_pin() -> DiagServerResult<u32> {
    prompt("Enter 6 digit immo pin: ")
        .parse()
        .map_err(|_| DiagError::ParameterInvalid)
}

fn immo_menu(flasher: &mut Flasher) -> DiagServerResult<()> {
    let entries = [
        "Information",
        "Limp home mode",
        "Immo reset",
        "Smartra neutralize",
        "Teach keys",
        "Limp home password teaching/changing",
        "Read VIN",
        "Write VIN",
        "Smartra VIN to PIN Calculator",
    ];
    for (index, entry) in entries.iter().enumerate() {
        println!("    [{index}] {entry}");
    }
    let choice: usize = prompt("Select immo menu: ")
        .parse()
        .map_err(|_| DiagError::ParameterInvalid)?;

    match choice {
        0 => match flasher.immo_query() {
            Ok(info) => {
                println!("[*] Immo keys learnt: {}", info.keys_learnt);
                println!("[*] Immo ECU status: {}", info.ecu_status);
                println!("[*] Immo key status: {}", info.key_status);
                if let Some(smartra) = info.smartra_status {
                    println!("[*] Smartra status: {smartra}");
                }
            }
            Err(DiagError::NegativeResponse { .. }) => {
                println!("[*] Immo seems to be disabled")
            }
            Err(e) => return Err(e),
        },
        1 => {
            let password = u16::from_str_radix(
                &prompt("Enter 4 digit password (default: 2345): "),
                16,
            )
            .map_err(|_| DiagError::ParameterInvalid)?;
            report_outcome(flasher.limp_home(password)?);
        }
        2 => {
            let pin = prompt_pin()?;
            if confirm("[?] Reset the immobilizer?") {
                report_outcome(flasher.immo_reset(pin)?);
                println!("[*] ECU reset! Turn ignition off for 10 seconds for changes to take effect.");
            }
        }
        3 => {
            let pin = prompt_pin()?;
            if confirm("[?] Neutralize the SMARTRA unit?") {
                report_outcome(flasher.smartra_neutralize(pin)?);
                println!("[*] SMARTRA neutralized! Turn ignition off for 5 seconds for changes to take effect.");
            }
        }
        4 => {
            let pin = prompt_pin()?;
            let count: u8 = prompt("How many keys to teach (1-4): ")
                .parse()
                .map_err(|_| DiagError::ParameterInvalid)?;
            report_outcome(flasher.teach_keys(pin, count)?);
            println!("[*] Done! Turn off ignition for 10 seconds for changes to take effect");
        }
        5 => {
            let current = prompt("Enter current 4 digit password (empty if none): ");
            let current = if current.is_empty() {
                None
            } else {
                Some(
                    u16::from_str_radix(&current, 16)
                        .map_err(|_| DiagError::ParameterInvalid)?,
                )
            };
            let new_password = u16::from_str_radix(
                &prompt("Enter new 4 digit password: "),
                16,
            )
            .map_err(|_| DiagError::ParameterInvalid)?;
            let baud = None;
            report_outcome(immo::limp_home_teach(
                flasher.kwp(),
                baud,
                current,
                new_password,
            )?);
        }
        6 => match immo::read_vin(flasher.kwp(), None) {
            Ok(vin) => println!("[*] VIN: {vin}"),
            Err(DiagError::NegativeResponse { .. }) => println!("[!] Not supported!"),
            Err(e) => return Err(e),
        },
        7 => {
            let algorithm = flasher
                .ecu()
                .map(|e| e.variant().security_algorithm)
                .ok_or(DiagError::IdentificationFailed)?;
            let vin = prompt("Enter VIN. WARNING! No validation!: ");
            immo::write_vin(flasher.kwp(), None, algorithm, &vin)?;
            println!("[*] VIN changed! Turn ignition off for 5 seconds for changes to take effect.");
        }
        8 => {
            println!("[*] SMARTRA VIN to PIN calculator");
            println!("[*] This calculator should apply for all Hyundai and KIA models equipped with SMARTRA2");
            println!("[*] From 2007 or so, some models started using SMARTRA3 and a different algorithm - beware.");
            let input = prompt("[*] Enter your VIN (or just the last 6 digits): ");
            match last_6_digits(&input) {
                Some(digits) => println!(
                    "[*] All good! Your immo pin should be: {}",
                    calculate_smartra_pin(digits)
                ),
                None => println!("[!] Something went wrong. Try again"),
            }
        }
        _ => {
            println!("[!] Invalid choice!");
            return Err(DiagError::ParameterInvalid);
        }
    }

    info!("immobilizer menu finished");
    Ok(())
}

fn report_outcome(outcome: immo::ImmoOutcome) {
    match outcome {
        immo::ImmoOutcome::Done => {}
        immo::ImmoOutcome::LockedByWrongData => {
            println!("[!] System is locked by wrong data! It'll probably be locked for an hour.")
        }
    }
}
