mod config;

use std::sync::mpsc::Receiver;
use std::thread::sleep;
use std::time::Duration;
use dotenv::{dotenv, var};
use log::{debug, info, warn};
use sysinfo::System;
use time::OffsetDateTime;
use mkpad_gpio::gpiod::GpiodDriver;
use mkpad_gpio::keypad::{
    ChannelSink, KeyCode, KeyEvent, KeypadKey, MembraneKeypad, ScanConfig, COLS, ROWS,
};
use mkpad_gpio::sim::SimMatrix;
use mkpad_gpio::{GpioDriver, LineSpec};
use crate::config::{Backend, Config};

const DEFAULT_SIM_PRESSES: &str = "0:0 1:1 2:2 3:3 3:0 3:2";

fn parse_presses(presses: &str) -> eyre::Result<Vec<(usize, usize)>> {
    presses
        .split([',', ' ', ';'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| -> eyre::Result<(usize, usize)> {
            let (row, col) = s
                .split_once(':')
                .ok_or_else(|| eyre::eyre!("Invalid press {:?}, expected row:col", s))?;
            Ok((row.trim().parse()?, col.trim().parse()?))
        })
        .collect()
}

fn print_batch(batch: &[KeyEvent]) {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    for event in batch {
        println!(
            "[{:02}:{:02}:{:02}.{:03}] {} {} ({:#06X})",
            now.hour(),
            now.minute(),
            now.second(),
            now.millisecond(),
            if event.pressed { "press  " } else { "release" },
            legend(event.code),
            event.code,
        );
    }
}

fn legend(code: KeyCode) -> char {
    KeypadKey::from_code(code).map(KeypadKey::to_char).unwrap_or('?')
}

fn print_banner() {
    const UNKNOWN_STR: &str = "???";

    info!(
        "Hello, {}!",
        System::name().as_deref().unwrap_or(UNKNOWN_STR)
    );
    info!(
        "System ver {} kernel ver {}",
        System::long_os_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::kernel_version().as_deref().unwrap_or(UNKNOWN_STR),
    );
    info!(
        "Hostname {}",
        System::host_name().as_deref().unwrap_or(UNKNOWN_STR)
    );
    info!("Architecture {}", System::cpu_arch());
}

fn bring_up(
    gpio: &dyn GpioDriver,
    config: &Config,
    scan: ScanConfig,
    rows: &[LineSpec],
    cols: &[LineSpec],
    keymap: &[u32],
) -> eyre::Result<(MembraneKeypad, Receiver<Vec<KeyEvent>>)> {
    debug!("Initializing keypad driver...");
    let (sink, rx) = ChannelSink::new();
    let keypad = MembraneKeypad::open(
        gpio,
        rows,
        cols,
        &config.line_options(),
        keymap,
        Box::new(sink),
        scan,
    )?;
    debug!("{:?} initialized.", keypad);
    let identity = keypad.identity();
    let keys = keypad.capabilities().iter().map(|&code| legend(code)).collect::<String>();
    info!(
        "{} at {} (bus {:#04x}), keys {}",
        identity.name, identity.phys, identity.bus, keys
    );
    Ok((keypad, rx))
}

fn run_gpiod(
    config: &Config,
    scan: ScanConfig,
    rows: &[LineSpec],
    cols: &[LineSpec],
    keymap: &[u32],
) -> eyre::Result<()> {
    debug!("Opening {}...", config.chip);
    let gpio = GpiodDriver::open(&config.chip)?;
    debug!("{:?} initialized.", gpio);

    let (keypad, rx) = bring_up(&gpio, config, scan, rows, cols, keymap)?;
    info!("Waiting for key presses.");
    for batch in rx {
        print_batch(&batch);
    }
    keypad.detach();
    Ok(())
}

fn run_sim(
    config: &Config,
    scan: ScanConfig,
    rows: &[LineSpec],
    cols: &[LineSpec],
    keymap: &[u32],
) -> eyre::Result<()> {
    let presses = var("MKPAD_SIM_PRESSES").unwrap_or_else(|_| DEFAULT_SIM_PRESSES.to_string());
    let presses = parse_presses(&presses)?;

    let matrix = SimMatrix::new(ROWS, COLS);
    debug!("{:?} initialized.", matrix);

    let (keypad, rx) = bring_up(&matrix, config, scan, rows, cols, keymap)?;
    let timeout = scan.debounce + Duration::from_secs(1);
    for (row, col) in presses {
        debug!("Pressing row {} col {}...", row, col);
        matrix.press(row, col);
        match rx.recv_timeout(timeout) {
            Ok(batch) => print_batch(&batch),
            Err(_) => warn!("No key events for row {} col {}.", row, col),
        }
        matrix.release(row, col);
        // Let the watcher see the release before the next press.
        sleep(scan.debounce + scan.poll_interval * 5);
    }

    keypad.detach();
    info!("Replay done.");
    Ok(())
}

fn main() -> eyre::Result<()> {
    // Initialize environment and logger
    dotenv().ok();
    pretty_env_logger::init();

    info!("Membrane keypad starting...");
    print_banner();

    debug!("Trying to load config...");
    let config = if let Some(config) = Config::try_load()? {
        info!("Config loaded.");
        config
    } else {
        info!("Config not found. Using default");
        let config = Config::default();
        config.save()?;
        info!("Default config saved.");
        config
    };
    let config = config.with_env()?;

    let rows = config.row_lines()?;
    let cols = config.col_lines()?;
    let keymap = config.keymap_entries()?;
    let scan = config.scan_config()?;
    info!("Keypad @ Rows: {:?}, Cols: {:?}, {} keymap entries", rows, cols, keymap.len());

    match config.backend {
        Backend::Gpiod => run_gpiod(&config, scan, &rows, &cols, &keymap),
        Backend::Sim => run_sim(&config, scan, &rows, &cols, &keymap),
    }
}
