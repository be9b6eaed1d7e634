#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

const MIB: usize = 1024 * 1024;

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum, default_value = "development")]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // everything is mounted under this prefix and rewritten playlists point back at it, so it
    // has to match whatever path the player sees. "/" mounts at the root
    #[clap(long, env, default_value = "/proxy")]
    pub proxy_base: String,

    // upstream deadline in ms, covers the response head and any buffered body
    #[clap(long, env, default_value = "30000")]
    pub request_timeout_ms: u64,

    #[clap(long, env, default_value = "2048")]
    pub max_url_length: usize,

    // empty means anything goes, otherwise a comma seperated list of domains like
    // example.com,something.com (subdomains of an entry are allowed too)
    #[clap(long, env, value_delimiter = ',')]
    pub allowed_domains: Vec<String>,

    // total bytes the response cache may hold
    #[clap(long, env, default_value_t = 100 * MIB)]
    pub cache_max_bytes: usize,

    // anything bigger than this never gets cached
    #[clap(long, env, default_value_t = 10 * MIB)]
    pub cache_max_entry_bytes: usize,

    // responses with a content-length above this are streamed straight through unless they
    // need rewriting
    #[clap(long, env, default_value_t = MIB as u64)]
    pub stream_size_threshold: u64,

    // turn this off to buffer passthrough bodies before sending them
    #[clap(long, env, default_value = "true", action = clap::ArgAction::Set)]
    pub enable_streaming: bool,

    // 0 means one worker per available core
    #[clap(long, env, default_value = "0")]
    pub worker_count: usize,

    #[clap(long, env, default_value = "32")]
    pub worker_queue_depth: usize,

    // how long to wait on a worker before decompressing inline instead
    #[clap(long, env, default_value = "10000")]
    pub worker_timeout_ms: u64,

    // SECURITY: skips upstream certificate validation. Some CDNs bounce through redirects that
    // land on hosts with certs for a different domain and this is the only way to follow them.
    // Leave it off unless you know you need it.
    #[clap(long, env, default_value = "false", action = clap::ArgAction::Set)]
    pub accept_invalid_certs: bool,

    // optional json file with extra origin/referer rules, checked before the built in ones
    #[clap(long, env)]
    pub header_rules_path: Option<String>,

    // this should be either * for allowing everything, or a comma seperated list of origins
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }

        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// proxy base without a trailing slash, e.g. "/proxy"
    pub fn normalized_proxy_base(&self) -> String {
        let trimmed = self.proxy_base.trim_end_matches('/');
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }

    pub fn image_proxy_base(&self) -> String {
        format!("{}/image", self.normalized_proxy_base().trim_end_matches('/'))
    }
}

impl Default for AppConfig {
    // used by tests and as a fallback, keep it in sync with the clap defaults above
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            proxy_base: "/proxy".to_string(),
            request_timeout_ms: 30_000,
            max_url_length: 2048,
            allowed_domains: Vec::new(),
            cache_max_bytes: 100 * MIB,
            cache_max_entry_bytes: 10 * MIB,
            stream_size_threshold: MIB as u64,
            enable_streaming: true,
            worker_count: 2,
            worker_queue_depth: 32,
            worker_timeout_ms: 10_000,
            accept_invalid_certs: false,
            header_rules_path: None,
            cors_origin: "*".to_string(),
            sentry_dsn: None,
        }
    }
}
