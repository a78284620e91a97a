//! Runtime configuration.

use std::env::var;

use crate::runtime::stack::page_size;

/// Sets a configuration field based on an environment variable.
macro_rules! set_from_env {
    ($config:expr, $field:ident, $key:expr, $value_type:ty) => {{
        if let Ok(raw_value) = var(concat!("THREADLET_", $key)) {
            if let Ok(value) = raw_value.parse::<$value_type>() {
                if value > 0 {
                    $config.$field = value;
                }
            }
        };
    }};
}

/// The default size of each thread's stack in bytes.
///
/// This size is _excluding_ the guard pages, and is rounded up to a multiple
/// of the page size.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// The default number of inaccessible pages below each stack.
pub const DEFAULT_GUARD_PAGES: usize = 1;

/// Settings shared by every thread of a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The usable size of each thread's stack in bytes.
    pub stack_size: usize,

    /// The number of guard pages placed below each stack to catch overflows.
    pub guard_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// Default configuration, clamped to what the platform supports.
    pub fn new() -> Config {
        let mut config = Config {
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: DEFAULT_GUARD_PAGES,
        };

        config.verify();
        config
    }

    /// Reads `THREADLET_STACK_SIZE` and `THREADLET_GUARD_PAGES`, falling back to the defaults.
    pub fn from_env() -> Config {
        let mut config = Config::new();

        set_from_env!(config, stack_size, "STACK_SIZE", usize);
        set_from_env!(config, guard_pages, "GUARD_PAGES", usize);

        config.verify();
        config
    }

    /// Number of pages backing a stack, excluding guard pages.
    pub fn usable_pages(&self) -> usize {
        self.stack_size / page_size()
    }

    pub(crate) fn verify(&mut self) {
        let minimum = libc::SIGSTKSZ;
        if self.stack_size < minimum {
            self.stack_size = minimum;
        }

        let page_size = page_size();
        self.stack_size = self
            .stack_size
            .checked_next_multiple_of(page_size)
            .unwrap_or(usize::MAX / page_size * page_size);

        if self.guard_pages == 0 {
            self.guard_pages = DEFAULT_GUARD_PAGES;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(key: &str) -> Result<&str, ()> {
        match key {
            "THREADLET_FOO" => Ok("3"),
            "THREADLET_BAR" => Ok("0"),
            "THREADLET_BAZ" => Ok("many"),
            _ => Err(()),
        }
    }

    #[test]
    fn test_new() {
        let config = Config::new();

        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.guard_pages, DEFAULT_GUARD_PAGES);
    }

    #[test]
    fn test_set_from_env() {
        let mut cfg = Config::new();

        set_from_env!(cfg, guard_pages, "FOO", usize);

        assert_eq!(cfg.guard_pages, 3);
    }

    #[test]
    fn test_set_from_env_ignores_zero_and_garbage() {
        let mut cfg = Config::new();

        set_from_env!(cfg, guard_pages, "BAR", usize);
        set_from_env!(cfg, stack_size, "BAZ", usize);
        set_from_env!(cfg, stack_size, "MISSING", usize);

        assert_eq!(cfg, Config::new());
    }

    #[test]
    fn test_verify() {
        let mut cfg = Config::new();

        cfg.stack_size = 1;
        cfg.verify();
        assert!(cfg.stack_size >= libc::SIGSTKSZ);
        assert_eq!(cfg.stack_size % page_size(), 0);

        cfg.stack_size = page_size() * 40 + 1;
        cfg.verify();
        assert_eq!(cfg.stack_size, page_size() * 41);

        cfg.guard_pages = 0;
        cfg.verify();
        assert_eq!(cfg.guard_pages, DEFAULT_GUARD_PAGES);
    }

    #[test]
    fn test_usable_pages() {
        let mut cfg = Config::new();

        cfg.stack_size = page_size() * 16;
        cfg.verify();

        assert_eq!(cfg.usable_pages(), 16);
    }
}
