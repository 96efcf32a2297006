use std::env::var_os;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use dotenv::var;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use mkpad_gpio::edge::Edge;
use mkpad_gpio::keypad::{decode_be_words, ConstructionError, KeypadKey, LineOptions, ScanConfig};
use mkpad_gpio::{GpioActiveLevel, GpioBias, GpioDriveMode, GpioError, LineSpec};

const DEFAULT_CONFIG_FILE: &str = "keypad.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad line list {list:?}: {source}")]
    Lines { list: String, source: GpioError },
    #[error("bad keymap file: {0}")]
    Keymap(#[from] ConstructionError),
    #[error("unknown backend {0:?}")]
    Backend(String),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Gpiod,
    Sim,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "gpiod" => Ok(Backend::Gpiod),
            "sim" => Ok(Backend::Sim),
            other => Err(ConfigError::Backend(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    #[default]
    High,
    Low,
}

impl From<Level> for GpioActiveLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::High => GpioActiveLevel::High,
            Level::Low => GpioActiveLevel::Low,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    None,
    PullUp,
    #[default]
    PullDown,
}

impl From<Bias> for GpioBias {
    fn from(bias: Bias) -> Self {
        match bias {
            Bias::None => GpioBias::None,
            Bias::PullUp => GpioBias::PullUp,
            Bias::PullDown => GpioBias::PullDown,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    PushPull,
    OpenDrain,
    OpenSource,
}

impl From<DriveMode> for GpioDriveMode {
    fn from(mode: DriveMode) -> Self {
        match mode {
            DriveMode::PushPull => GpioDriveMode::PushPull,
            DriveMode::OpenDrain => GpioDriveMode::OpenDrain,
            DriveMode::OpenSource => GpioDriveMode::OpenSource,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Rising,
    Falling,
    Both,
}

impl From<EdgeKind> for Edge {
    fn from(edge: EdgeKind) -> Self {
        match edge {
            EdgeKind::Rising => Edge::Rising,
            EdgeKind::Falling => Edge::Falling,
            EdgeKind::Both => Edge::Both,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub chip: String,
    /// Row lines, as offsets or line names.
    pub rows: String,
    /// Column lines, as offsets or line names.
    pub cols: String,
    pub row_active_level: Level,
    pub row_drive_mode: Option<DriveMode>,
    pub col_active_level: Level,
    pub col_bias: Bias,
    pub edge: EdgeKind,
    pub debounce_ms: u64,
    pub settle_us: u64,
    pub poll_us: u64,
    /// Raw `linux,keymap` words.
    pub keymap: Option<Vec<u32>>,
    /// Raw big-endian `linux,keymap` property, e.g. from `/proc/device-tree`. Wins over `keymap`.
    pub keymap_file: Option<PathBuf>,
}

fn config_path() -> PathBuf {
    let config_str = var_os("CONFIG_FILE");
    let config_str: &OsStr = config_str.as_deref().unwrap_or(OsStr::new(DEFAULT_CONFIG_FILE));
    PathBuf::from(config_str)
}

impl Config {
    /// Loads the config file, or gives `None` if there is none.
    pub fn try_load() -> Result<Option<Self>, ConfigError> {
        let config_path = config_path();
        if !config_path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&config_path)?;
        let reader = std::io::BufReader::new(file);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let file = std::fs::File::create(config_path())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Applies `MKPAD_*` overrides from the environment.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(backend) = var("MKPAD_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Ok(chip) = var("MKPAD_CHIP") {
            self.chip = chip;
        }
        if let Ok(rows) = var("MKPAD_ROWS") {
            self.rows = rows;
        }
        if let Ok(cols) = var("MKPAD_COLS") {
            self.cols = cols;
        }
        Ok(self)
    }

    pub fn row_lines(&self) -> Result<Vec<LineSpec>, ConfigError> {
        parse_line_list(&self.rows)
    }

    pub fn col_lines(&self) -> Result<Vec<LineSpec>, ConfigError> {
        parse_line_list(&self.cols)
    }

    pub fn line_options(&self) -> LineOptions {
        LineOptions {
            row_active_level: self.row_active_level.into(),
            row_drive_mode: self.row_drive_mode.map(Into::into),
            col_active_level: self.col_active_level.into(),
            col_bias: self.col_bias.into(),
        }
    }

    pub fn scan_config(&self) -> Result<ScanConfig, ConfigError> {
        if self.poll_us == 0 {
            return Err(ConfigError::Zero { field: "poll_us" });
        }
        Ok(ScanConfig::default()
            .with_debounce(Duration::from_millis(self.debounce_ms))
            .with_settle(Duration::from_micros(self.settle_us))
            .with_poll_interval(Duration::from_micros(self.poll_us))
            .with_edge(self.edge.into()))
    }

    /// Gets the key map words: from the keymap file, else the inline words, else the printed
    /// layout.
    pub fn keymap_entries(&self) -> Result<Vec<u32>, ConfigError> {
        if let Some(path) = &self.keymap_file {
            return read_keymap_file(path);
        }
        Ok(self.keymap.clone().unwrap_or_else(KeypadKey::default_keymap))
    }
}

impl Default for Config {
    fn default() -> Self {
        let scan = ScanConfig::default();
        Config {
            backend: Backend::Gpiod,
            chip: "/dev/gpiochip0".to_string(),
            rows: "row0, row1, row2, row3".to_string(),
            cols: "col0, col1, col2, col3".to_string(),
            row_active_level: Level::High,
            row_drive_mode: None,
            col_active_level: Level::High,
            col_bias: Bias::PullDown,
            edge: EdgeKind::Rising,
            debounce_ms: scan.debounce.as_millis() as u64,
            settle_us: scan.settle.as_micros() as u64,
            poll_us: scan.poll_interval.as_micros() as u64,
            keymap: None,
            keymap_file: None,
        }
    }
}

fn read_keymap_file(path: &Path) -> Result<Vec<u32>, ConfigError> {
    let bytes = std::fs::read(path)?;
    Ok(decode_be_words(&bytes)?)
}

/// Splits a line list on commas, spaces or semicolons.
pub fn parse_line_list(list: &str) -> Result<Vec<LineSpec>, ConfigError> {
    list.split([',', ' ', ';'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Lines {
            list: list.to_string(),
            source,
        })
}
