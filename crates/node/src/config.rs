//! Command line and `walletd.conf` handling. A flag given on the command
//! line always wins over the same key in the config file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use walletd_primitives::{Address, DEFAULT_MATURITY_DELAY};

use crate::logging;

pub const CONF_FILE_NAME: &str = "walletd.conf";
const DEFAULT_DATA_DIR: &str = "./data";

pub const DEFAULT_UPDATE_BATCH: usize = 500;
pub const DEFAULT_COMMIT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;
const DEFAULT_DB_CACHE_MB: u64 = 64;
const DEFAULT_DB_WRITE_BUFFER_MB: u64 = 128;
const DEFAULT_DB_JOURNAL_MB: u64 = 512;
const DEFAULT_BLOCK_REWARD: u64 = 300_000;

const MIB: u64 = 1024 * 1024;

const KNOWN_CONF_KEYS: &[&str] = &[
    "backend",
    "blockreward",
    "commitretries",
    "dbcache",
    "dbjournal",
    "dbsynccommits",
    "dbwritebuffer",
    "devmineaddress",
    "devmineblocks",
    "devmineinterval",
    "logformat",
    "loglevel",
    "logtimestamps",
    "maturitydelay",
    "rescanfrom",
    "retrybackoffms",
    "statusinterval",
    "updatebatch",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

/// Development mining on the in-process chain engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DevMining {
    pub address: Address,
    /// Mine one block per tick; `None` mines only the startup blocks.
    pub interval: Option<Duration>,
    pub startup_blocks: usize,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_file: PathBuf,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub db_cache_bytes: u64,
    pub db_write_buffer_bytes: u64,
    pub db_journal_bytes: u64,
    pub db_sync_commits: bool,
    pub update_batch: usize,
    pub commit_retries: u32,
    pub retry_backoff: Duration,
    /// Seconds between status lines; 0 disables them.
    pub status_interval_secs: u64,
    pub rescan_from: Option<u32>,
    pub maturity_delay: u32,
    pub block_reward: u64,
    pub dev_mining: Option<DevMining>,
    /// Config file keys this version does not understand. Reported once
    /// logging is up.
    pub unknown_conf_keys: Vec<String>,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

#[derive(Clone, Debug)]
pub enum CliAction {
    Run(Config),
    DbInfo(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub(crate) fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut db_info = false;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut db_cache_mb = DEFAULT_DB_CACHE_MB;
    let mut db_cache_set = false;
    let mut db_write_buffer_mb = DEFAULT_DB_WRITE_BUFFER_MB;
    let mut db_write_buffer_set = false;
    let mut db_journal_mb = DEFAULT_DB_JOURNAL_MB;
    let mut db_journal_set = false;
    let mut db_sync_commits = false;
    let mut db_sync_commits_set = false;
    let mut update_batch = DEFAULT_UPDATE_BATCH;
    let mut update_batch_set = false;
    let mut commit_retries = DEFAULT_COMMIT_RETRIES;
    let mut commit_retries_set = false;
    let mut retry_backoff_ms = DEFAULT_RETRY_BACKOFF_MS;
    let mut retry_backoff_set = false;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;
    let mut status_interval_set = false;
    let mut rescan_from: Option<u32> = None;
    let mut rescan_from_set = false;
    let mut maturity_delay = DEFAULT_MATURITY_DELAY;
    let mut maturity_delay_set = false;
    let mut block_reward = DEFAULT_BLOCK_REWARD;
    let mut block_reward_set = false;
    let mut dev_mine_address: Option<Address> = None;
    let mut dev_mine_address_set = false;
    let mut dev_mine_interval_ms: Option<u64> = None;
    let mut dev_mine_interval_set = false;
    let mut dev_mine_blocks: usize = 0;
    let mut dev_mine_blocks_set = false;
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            "db-info" => {
                db_info = true;
                let _ = args.next();
            }
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--db-info" => {
                db_info = true;
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = value
                    .parse::<logging::Level>()
                    .map_err(|err| format!("{err}\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = value
                    .parse::<logging::Format>()
                    .map_err(|err| format!("{err}\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            "--db-cache-mb" => {
                let value = next_value(&mut args, "--db-cache-mb")?;
                db_cache_mb = parse_flag(&value, "db cache")?;
                db_cache_set = true;
            }
            "--db-write-buffer-mb" => {
                let value = next_value(&mut args, "--db-write-buffer-mb")?;
                db_write_buffer_mb = parse_flag(&value, "db write buffer")?;
                db_write_buffer_set = true;
            }
            "--db-journal-mb" => {
                let value = next_value(&mut args, "--db-journal-mb")?;
                db_journal_mb = parse_flag(&value, "db journal size")?;
                db_journal_set = true;
            }
            "--db-sync-commits" => {
                db_sync_commits = true;
                db_sync_commits_set = true;
            }
            "--update-batch" => {
                let value = next_value(&mut args, "--update-batch")?;
                update_batch = parse_flag(&value, "update batch")?;
                update_batch_set = true;
            }
            "--commit-retries" => {
                let value = next_value(&mut args, "--commit-retries")?;
                commit_retries = parse_flag(&value, "commit retries")?;
                commit_retries_set = true;
            }
            "--retry-backoff-ms" => {
                let value = next_value(&mut args, "--retry-backoff-ms")?;
                retry_backoff_ms = parse_flag(&value, "retry backoff")?;
                retry_backoff_set = true;
            }
            "--status-interval" => {
                let value = next_value(&mut args, "--status-interval")?;
                status_interval_secs = parse_flag(&value, "status interval")?;
                status_interval_set = true;
            }
            "--rescan-from" => {
                let value = next_value(&mut args, "--rescan-from")?;
                rescan_from = Some(parse_flag(&value, "rescan height")?);
                rescan_from_set = true;
            }
            "--maturity-delay" => {
                let value = next_value(&mut args, "--maturity-delay")?;
                maturity_delay = parse_flag(&value, "maturity delay")?;
                maturity_delay_set = true;
            }
            "--block-reward" => {
                let value = next_value(&mut args, "--block-reward")?;
                block_reward = parse_flag(&value, "block reward")?;
                block_reward_set = true;
            }
            "--dev-mine-address" => {
                let value = next_value(&mut args, "--dev-mine-address")?;
                dev_mine_address = Some(parse_flag(&value, "address")?);
                dev_mine_address_set = true;
            }
            "--dev-mine-interval-ms" => {
                let value = next_value(&mut args, "--dev-mine-interval-ms")?;
                dev_mine_interval_ms = Some(parse_flag(&value, "mining interval")?);
                dev_mine_interval_set = true;
            }
            "--dev-mine-blocks" => {
                let value = next_value(&mut args, "--dev-mine-blocks")?;
                dev_mine_blocks = parse_flag(&value, "block count")?;
                dev_mine_blocks_set = true;
            }
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let mut unknown_conf_keys = Vec::new();
    if let Some(conf) = ConfFile::load(&conf_file)? {
        if !backend_set {
            if let Some(value) = conf.value("backend", Backend::parse)? {
                backend = value;
            }
        }
        if !log_level_set {
            if let Some(value) = conf.value("loglevel", |raw| raw.parse::<logging::Level>().ok())? {
                log_level = value;
            }
        }
        if !log_format_set {
            let parsed = conf.value("logformat", |raw| raw.parse::<logging::Format>().ok())?;
            if let Some(value) = parsed {
                log_format = value;
            }
        }
        if !log_timestamps_set {
            if let Some(value) = conf.value("logtimestamps", parse_conf_bool)? {
                log_timestamps = value;
            }
        }
        if !db_cache_set {
            if let Some(value) = conf.value("dbcache", parse_number)? {
                db_cache_mb = value;
            }
        }
        if !db_write_buffer_set {
            if let Some(value) = conf.value("dbwritebuffer", parse_number)? {
                db_write_buffer_mb = value;
            }
        }
        if !db_journal_set {
            if let Some(value) = conf.value("dbjournal", parse_number)? {
                db_journal_mb = value;
            }
        }
        if !db_sync_commits_set {
            if let Some(value) = conf.value("dbsynccommits", parse_conf_bool)? {
                db_sync_commits = value;
            }
        }
        if !update_batch_set {
            if let Some(value) = conf.value("updatebatch", parse_number)? {
                update_batch = value;
            }
        }
        if !commit_retries_set {
            if let Some(value) = conf.value("commitretries", parse_number)? {
                commit_retries = value;
            }
        }
        if !retry_backoff_set {
            if let Some(value) = conf.value("retrybackoffms", parse_number)? {
                retry_backoff_ms = value;
            }
        }
        if !status_interval_set {
            if let Some(value) = conf.value("statusinterval", parse_number)? {
                status_interval_secs = value;
            }
        }
        if !rescan_from_set {
            if let Some(value) = conf.value("rescanfrom", parse_number)? {
                rescan_from = Some(value);
            }
        }
        if !maturity_delay_set {
            if let Some(value) = conf.value("maturitydelay", parse_number)? {
                maturity_delay = value;
            }
        }
        if !block_reward_set {
            if let Some(value) = conf.value("blockreward", parse_number)? {
                block_reward = value;
            }
        }
        if !dev_mine_address_set {
            if let Some(value) = conf.value("devmineaddress", |raw| raw.parse::<Address>().ok())? {
                dev_mine_address = Some(value);
            }
        }
        if !dev_mine_interval_set {
            if let Some(value) = conf.value("devmineinterval", parse_number)? {
                dev_mine_interval_ms = Some(value);
            }
        }
        if !dev_mine_blocks_set {
            if let Some(value) = conf.value("devmineblocks", parse_number)? {
                dev_mine_blocks = value;
            }
        }
        unknown_conf_keys = conf.unknown_keys();
    }

    if update_batch == 0 {
        return Err(format!("update batch must be at least 1\n{}", usage()));
    }
    let dev_mine_interval = dev_mine_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);
    let dev_mining = match dev_mine_address {
        Some(address) => Some(DevMining {
            address,
            interval: dev_mine_interval,
            startup_blocks: dev_mine_blocks,
        }),
        None if dev_mine_interval.is_some() || dev_mine_blocks > 0 => {
            return Err(format!(
                "development mining needs --dev-mine-address\n{}",
                usage()
            ));
        }
        None => None,
    };

    let config = Config {
        backend,
        data_dir,
        conf_file,
        log_level,
        log_format,
        log_timestamps,
        db_cache_bytes: db_cache_mb.saturating_mul(MIB),
        db_write_buffer_bytes: db_write_buffer_mb.saturating_mul(MIB),
        db_journal_bytes: db_journal_mb.saturating_mul(MIB),
        db_sync_commits,
        update_batch,
        commit_retries,
        retry_backoff: Duration::from_millis(retry_backoff_ms),
        status_interval_secs,
        rescan_from,
        maturity_delay,
        block_reward,
        dev_mining,
        unknown_conf_keys,
    };
    if db_info {
        Ok(CliAction::DbInfo(config))
    } else {
        Ok(CliAction::Run(config))
    }
}

fn next_value<I>(args: &mut I, flag: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_flag<T: FromStr>(value: &str, what: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid {what} '{value}'\n{}", usage()))
}

fn parse_number<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

struct ConfFile {
    path: PathBuf,
    values: HashMap<String, Vec<String>>,
}

impl ConfFile {
    /// `Ok(None)` when the file does not exist.
    fn load(path: &Path) -> Result<Option<Self>, String> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };
        Ok(Some(Self {
            path: path.to_path_buf(),
            values: parse_conf(&contents),
        }))
    }

    /// Last value given for `key`; repeated keys override earlier ones.
    fn value<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, String> {
        let Some(raw) = self.values.get(key).and_then(|values| values.last()) else {
            return Ok(None);
        };
        parse(raw)
            .map(Some)
            .ok_or_else(|| format!("invalid {key} '{raw}' in {}", self.path.display()))
    }

    fn unknown_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .keys()
            .filter(|key| !KNOWN_CONF_KEYS.contains(&key.as_str()))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

fn parse_conf(contents: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  walletd [options]",
        "  walletd <command> [options]",
        "",
        "Commands:",
        "  help      Print this help and exit",
        "  version   Print version and exit",
        "  db-info   Print store statistics as JSON and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/walletd.conf)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --db-cache-mb  Fjall block cache size in MiB (default: 64)",
        "  --db-write-buffer-mb  Fjall write buffer size in MiB (default: 128)",
        "  --db-journal-mb  Fjall journal size limit in MiB (default: 512)",
        "  --db-sync-commits  fsync every index commit",
        "  --update-batch  Max blocks applied per commit (default: 500)",
        "  --commit-retries  Retries for a failed commit before halting (default: 3)",
        "  --retry-backoff-ms  Base delay between commit retries (default: 500)",
        "  --status-interval  Seconds between status lines, 0 disables (default: 30)",
        "  --rescan-from  Rescan from this height at startup",
        "  --maturity-delay  Blocks before a miner payout matures (default: 144)",
        "  --block-reward  Payout of each development block (default: 300000)",
        "  --dev-mine-address  Payout address for development mining (hex)",
        "  --dev-mine-interval-ms  Mine one development block per interval",
        "  --dev-mine-blocks  Mine this many development blocks at startup",
        "",
        "Config file keys (key=value, # or ; comments):",
        "  backend, loglevel, logformat, logtimestamps, dbcache, dbwritebuffer,",
        "  dbjournal, dbsynccommits, updatebatch, commitretries, retrybackoffms,",
        "  statusinterval, rescanfrom, maturitydelay, blockreward,",
        "  devmineaddress, devmineinterval, devmineblocks",
    ]
    .join("\n")
}
