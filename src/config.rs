use crate::error::{Error, Result};

/// Scheduler configuration.
///
/// A schedule is computed by the application, not by the runtime, so the
/// configuration only covers process-level knobs: how many workers exist,
/// whether they are pinned, and how the coroutine runner pool synchronizes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads, including the OS thread (worker 0).
    /// `None` means one per logical CPU.
    pub num_threads: Option<usize>,

    /// Pin each worker (and the runners it checks out) to one logical core.
    pub pin_workers: bool,

    /// Whether several workers may request coroutine runners for the same
    /// core slot concurrently. Leave `true` unless every worker is pinned to
    /// a distinct core; `false` switches the runner pool to per-slot locks.
    pub shared_cores: bool,

    /// Stack size for spawned worker and runner threads.
    pub stack_size: Option<usize>,

    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: None,
            pin_workers: false,
            shared_cores: true,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "sts-worker".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.num_threads {
            if n == 0 {
                return Err(Error::config("num_threads must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("num_threads too large (max 1024)"));
            }
        }

        if !self.shared_cores && !self.pin_workers {
            return Err(Error::config(
                "shared_cores = false requires pin_workers = true",
            ));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.config.pin_workers = pin;
        self
    }

    pub fn shared_cores(mut self, shared: bool) -> Self {
        self.config.shared_cores = shared;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
