//! Utility functions shared by the trainer and the CLI

use std::fs;
use std::path::Path;

use crate::error::Result;

/// File I/O utilities
pub mod io {
    use super::*;
    use std::io::Write;

    /// Ensure directory exists
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.as_os_str().is_empty() && !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Ensure the parent directory of a file exists
    pub fn ensure_parent_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        match path.as_ref().parent() {
            Some(parent) => ensure_dir_exists(parent),
            None => Ok(()),
        }
    }

    /// Safe file write with atomic operation
    ///
    /// The payload lands in a sibling `*.tmp` file first and is renamed over
    /// the target, so readers observe either the old or the new content.
    pub fn write_file_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
        let path = path.as_ref();
        ensure_parent_exists(path)?;
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = std::path::PathBuf::from(temp_name);

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(temp_path, path)?;

        Ok(())
    }
}

/// Performance timing utilities
pub mod timing {
    use std::time::{Duration, Instant};

    /// Simple timer for measuring performance
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start a new timer
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                start: Instant::now(),
                name: name.into(),
            }
        }

        /// Get elapsed time
        pub fn elapsed(&self) -> Duration {
            self.start.elapsed()
        }

        /// Stop timer and log result
        pub fn stop(self) -> Duration {
            let elapsed = self.elapsed();
            tracing::debug!("Timer '{}' elapsed: {:.3}s", self.name, elapsed.as_secs_f64());
            elapsed
        }
    }

    /// Per-minibatch timing marks
    #[derive(Debug, Clone, Copy)]
    pub struct BatchTiming {
        /// Seconds spent in the forward pass
        pub forward: f64,
        /// Seconds spent in backward and optimizer step
        pub backward: f64,
        /// Total seconds for the minibatch
        pub batch: f64,
    }

    impl BatchTiming {
        /// Build timings from the three instants of a training step
        pub fn from_marks(start: Instant, forward_done: Instant, backward_done: Instant) -> Self {
            let end = Instant::now();
            Self {
                forward: forward_done.duration_since(start).as_secs_f64(),
                backward: backward_done.duration_since(forward_done).as_secs_f64(),
                batch: end.duration_since(start).as_secs_f64(),
            }
        }
    }
}

/// Configuration file utilities
pub mod config {
    use serde::{Deserialize, Serialize};
    use std::path::Path;

    use super::Result;

    fn is_yaml(path: &Path) -> bool {
        path.extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml")
    }

    /// Load a serde value from a JSON or YAML file (by extension, JSON by default)
    pub fn load_config<T, P>(path: P) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
        P: AsRef<Path>,
    {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config = if is_yaml(path.as_ref()) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        Ok(config)
    }

    /// Save a serde value to a JSON or YAML file (by extension)
    pub fn save_config<T, P>(config: &T, path: P) -> Result<()>
    where
        T: Serialize,
        P: AsRef<Path>,
    {
        let content = if is_yaml(path.as_ref()) {
            serde_yaml::to_string(config)?
        } else {
            serde_json::to_string_pretty(config)?
        };

        super::io::write_file_atomic(path, content.as_bytes())
    }
}
