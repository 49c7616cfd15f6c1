/// Loopback host every local proxy listens on
pub const LOCAL_PROXY_HOST: &str = "127.0.0.1";

/// Path prefix used by the engine's HTTP proxy for "URL proxy" requests
pub const URL_PROXY_PATH_PREFIX: &str = "/tunneled/";

/// Request timeout for tunneled fetches (5 minutes)
pub const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Time a notification extension gets before the host kills it (30 seconds)
pub const NOTIFICATION_DEADLINE_SECS: u64 = 30;

/// Deadline for interactive fetches where no host enforces one (10 minutes)
pub const INTERACTIVE_DEADLINE_SECS: u64 = 600;

/// Size of the buffer reserved to simulate an application's memory footprint
pub const MEMORY_PRESSURE_BYTES: usize = 10_000_000;

/// Fallback page size when the platform cannot report one
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// URL fetched through the tunnel when none is given
pub const DEFAULT_TARGET_URL: &str = "https://freegeoip.app/json/";

/// Key injected into the tunnel config JSON pointing at the data root
pub const DATA_ROOT_DIRECTORY_KEY: &str = "DataRootDirectory";

/// Name of the engine's working directory under the data root
pub const DATA_ROOT_DIR_NAME: &str = "tunnel-core";

/// File name the process engine writes the resolved config to
pub const ENGINE_CONFIG_FILE_NAME: &str = "tunnel-config.json";

/// File name the process engine writes the embedded server entries to
pub const ENGINE_SERVER_LIST_FILE_NAME: &str = "embedded-server-entries.txt";

/// Charset assumed when a response does not declare one
pub const DEFAULT_CHARSET: &str = "utf-8";
