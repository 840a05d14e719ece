//! Server Configuration
//!
//! Command-line flags are parsed into a [`ServerConfig`]. Parsing never exits
//! the process; the binary decides what to do with [`Cli::Help`],
//! [`Cli::Version`] and errors.

use crate::concurrency::ExecutorConfig;
use crate::connection::BlockingOptions;
use crate::storage::StorageKind;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Which transport serves connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// One thread, one reactor, no locks
    StNonblocking,
    /// Multi-thread reactor, reader and writer task per connection
    MtNonblocking,
    /// Blocking sockets, one pool task per connection
    MtBlocking,
    /// One thread, one engine coroutine per connection
    StCoroutine,
}

impl FromStr for NetworkKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "st-nonblocking" | "st" => Ok(NetworkKind::StNonblocking),
            "mt-nonblocking" | "mt" => Ok(NetworkKind::MtNonblocking),
            "mt-blocking" | "blocking" => Ok(NetworkKind::MtBlocking),
            "st-coroutine" | "coroutine" => Ok(NetworkKind::StCoroutine),
            _ => Err(()),
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkKind::StNonblocking => "st-nonblocking",
            NetworkKind::MtNonblocking => "mt-nonblocking",
            NetworkKind::MtBlocking => "mt-blocking",
            NetworkKind::StCoroutine => "st-coroutine",
        })
    }
}

impl FromStr for StorageKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" | "simple" => Ok(StorageKind::Lru),
            "striped" | "sharded" => Ok(StorageKind::Striped),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Lru => "lru",
            StorageKind::Striped => "striped",
        })
    }
}

/// Problems with the command line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },

    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("--pool-low ({low}) must not exceed --pool-high ({high})")]
    Watermarks { low: usize, high: usize },
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Cli {
    Run(ServerConfig),
    Help,
    Version,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    pub network: NetworkKind,
    pub storage: StorageKind,
    /// Cache capacity in bytes (keys + values)
    pub capacity: usize,
    /// Shard count for the striped backend
    pub shards: usize,
    /// Runtime worker threads for the multi-threaded reactor
    pub workers: usize,
    /// Responses queued per connection before reading pauses (0 = unbounded)
    pub max_output_queue: usize,
    /// Largest data block a storage command may carry
    pub max_item_size: usize,
    /// Connection pool for the blocking transport
    pub pool: ExecutorConfig,
    /// Read timeout of blocking sockets
    pub read_timeout: Duration,
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            network: NetworkKind::MtNonblocking,
            storage: StorageKind::Striped,
            capacity: 1 << 24,
            shards: 4,
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            max_output_queue: 64,
            max_item_size: crate::connection::DEFAULT_MAX_ITEM_SIZE,
            pool: ExecutorConfig::default(),
            read_timeout: Duration::from_millis(100),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parses command-line arguments (without the program name).
    pub fn from_args<I, S>(args: I) -> Result<Cli, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = ServerConfig::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => config.host = value(&mut args, &arg)?,
                "--port" | "-p" => config.port = parse(&mut args, &arg)?,
                "--network" | "-n" => config.network = parse(&mut args, &arg)?,
                "--storage" | "-s" => config.storage = parse(&mut args, &arg)?,
                "--capacity" => config.capacity = parse_positive(&mut args, &arg)?,
                "--shards" => config.shards = parse_positive(&mut args, &arg)?,
                "--workers" | "-w" => config.workers = parse_positive(&mut args, &arg)?,
                "--max-output-queue" => config.max_output_queue = parse(&mut args, &arg)?,
                "--max-item-size" => config.max_item_size = parse_positive(&mut args, &arg)?,
                "--pool-low" => config.pool.low_watermark = parse(&mut args, &arg)?,
                "--pool-high" => config.pool.high_watermark = parse_positive(&mut args, &arg)?,
                "--pool-queue" => config.pool.max_queue_size = parse(&mut args, &arg)?,
                "--pool-idle-ms" => {
                    config.pool.idle_time = Duration::from_millis(parse(&mut args, &arg)?)
                }
                "--read-timeout-ms" => {
                    config.read_timeout = Duration::from_millis(parse_positive(&mut args, &arg)?)
                }
                "--log-level" | "-l" => config.log_level = value(&mut args, &arg)?,
                "--help" => return Ok(Cli::Help),
                "--version" | "-v" => return Ok(Cli::Version),
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }

        if config.pool.low_watermark > config.pool.high_watermark {
            return Err(ConfigError::Watermarks {
                low: config.pool.low_watermark,
                high: config.pool.high_watermark,
            });
        }

        Ok(Cli::Run(config))
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the blocking transport.
    pub fn blocking_options(&self) -> BlockingOptions {
        BlockingOptions {
            pool: self.pool.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, ConfigError> {
    args.next()
        .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parse<T: FromStr>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T, ConfigError> {
    let raw = value(args, flag)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw,
    })
}

fn parse_positive<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + fmt::Display,
{
    let parsed: T = parse(args, flag)?;
    if parsed <= T::default() {
        return Err(ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: parsed.to_string(),
        });
    }
    Ok(parsed)
}

/// Usage text printed for `--help`.
pub fn help_text() -> String {
    format!(
        r#"
LruKV - An In-Memory LRU Cache Server

USAGE:
    lrukv [OPTIONS]

OPTIONS:
    -h, --host <HOST>            Host to bind to (default: {host})
    -p, --port <PORT>            Port to listen on (default: {port})
    -n, --network <KIND>         st-nonblocking | mt-nonblocking | mt-blocking |
                                 st-coroutine (default: mt-nonblocking)
    -s, --storage <KIND>         lru | striped (default: striped)
        --capacity <BYTES>       Cache capacity in bytes (default: 16777216)
        --shards <N>             Shards for the striped backend (default: 4)
    -w, --workers <N>            Reactor threads for mt-nonblocking
                                 (default: available parallelism)
        --max-output-queue <N>   Queued responses before a connection stops
                                 reading, 0 for no limit (default: 64)
        --max-item-size <BYTES>  Largest value a client may store
                                 (default: 1048576)
        --pool-low <N>           Blocking pool low watermark (default: 4)
        --pool-high <N>          Blocking pool high watermark (default: 16)
        --pool-queue <N>         Blocking pool queue size (default: 100)
        --pool-idle-ms <MS>      Idle time before a pool worker exits
                                 (default: 10000)
        --read-timeout-ms <MS>   Blocking socket read timeout (default: 100)
    -l, --log-level <FILTER>     Log filter when RUST_LOG is unset (default: info)
    -v, --version                Print version information
        --help                   Print this help message

EXAMPLES:
    lrukv                                   # Start on {host}:{port}
    lrukv --network st-nonblocking          # Single-threaded reactor
    lrukv --network st-coroutine            # Coroutine per connection
    lrukv --storage lru --capacity 1048576  # One 1 MiB cache, one lock

CONNECTING:
    Any memcached text-protocol client works:
    $ printf 'set name 0 0 4\r\nAriz\r\nget name\r\n' | nc {host} {port}
    STORED
    VALUE name 0 4
    Ariz
    END
"#,
        host = crate::DEFAULT_HOST,
        port = crate::DEFAULT_PORT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> ServerConfig {
        match ServerConfig::from_args(args.iter().copied()).unwrap() {
            Cli::Run(config) => config,
            other => panic!("expected a run config, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let config = run(&[]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.network, NetworkKind::MtNonblocking);
        assert_eq!(config.storage, StorageKind::Striped);
        assert_eq!(config.capacity, 1 << 24);
        assert_eq!(config.shards, 4);
        assert_eq!(config.max_output_queue, 64);
        assert_eq!(config.max_item_size, 1 << 20);
        assert_eq!(config.pool.low_watermark, 4);
        assert_eq!(config.pool.high_watermark, 16);
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_all_flags() {
        let config = run(&[
            "--host", "0.0.0.0", "-p", "11211", "--network", "st_nonblocking", "--storage", "lru",
            "--capacity", "1024", "--shards", "8", "-w", "2", "--max-output-queue", "0",
            "--pool-low", "1", "--pool-high", "3", "--pool-queue", "5", "--pool-idle-ms", "250",
            "--read-timeout-ms", "30", "--log-level", "debug", "--max-item-size", "512",
        ]);

        assert_eq!(config.bind_address(), "0.0.0.0:11211");
        assert_eq!(config.network, NetworkKind::StNonblocking);
        assert_eq!(config.storage, StorageKind::Lru);
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.shards, 8);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_output_queue, 0);
        assert_eq!(config.max_item_size, 512);
        assert_eq!(config.log_level, "debug");

        let options = config.blocking_options();
        assert_eq!(options.pool.low_watermark, 1);
        assert_eq!(options.pool.high_watermark, 3);
        assert_eq!(options.pool.max_queue_size, 5);
        assert_eq!(options.pool.idle_time, Duration::from_millis(250));
        assert_eq!(options.read_timeout, Duration::from_millis(30));
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(ServerConfig::from_args(["--help"]), Ok(Cli::Help));
        assert_eq!(ServerConfig::from_args(["-p", "1", "--version"]), Ok(Cli::Version));
        assert!(help_text().contains("--network"));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            ServerConfig::from_args(["--port"]),
            Err(ConfigError::MissingValue("--port".to_string()))
        );
        assert_eq!(
            ServerConfig::from_args(["--port", "http"]),
            Err(ConfigError::InvalidValue {
                flag: "--port".to_string(),
                value: "http".to_string()
            })
        );
        assert_eq!(
            ServerConfig::from_args(["--network", "epoll"]),
            Err(ConfigError::InvalidValue {
                flag: "--network".to_string(),
                value: "epoll".to_string()
            })
        );
        assert_eq!(
            ServerConfig::from_args(["--shards", "0"]),
            Err(ConfigError::InvalidValue {
                flag: "--shards".to_string(),
                value: "0".to_string()
            })
        );
        assert_eq!(
            ServerConfig::from_args(["--max-item-size", "0"]),
            Err(ConfigError::InvalidValue {
                flag: "--max-item-size".to_string(),
                value: "0".to_string()
            })
        );
        assert_eq!(
            ServerConfig::from_args(["--bogus"]),
            Err(ConfigError::UnknownArgument("--bogus".to_string()))
        );
        assert_eq!(
            ServerConfig::from_args(["--pool-low", "8", "--pool-high", "2"]),
            Err(ConfigError::Watermarks { low: 8, high: 2 })
        );
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in [
            NetworkKind::StNonblocking,
            NetworkKind::MtNonblocking,
            NetworkKind::MtBlocking,
            NetworkKind::StCoroutine,
        ] {
            assert_eq!(kind.to_string().parse(), Ok(kind));
        }
        for kind in [StorageKind::Lru, StorageKind::Striped] {
            assert_eq!(kind.to_string().parse(), Ok(kind));
        }
    }
}
