//! Key/value configuration: defaults, then an optional TOML file, then
//! `key=value` command-line overrides, in that precedence order. A
//! malformed file is recovered to defaults with a warning rather than
//! aborting startup -- see `Config::load`.

use slog::Logger;
use std::collections::HashMap;
use std::path::Path;

pub const LOGIN_PORT: &str = "7171";
pub const GAME_PORT: &str = "7172";
pub const ECHO_PORT: &str = "7777";

#[derive(Debug, Clone)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    fn defaults() -> HashMap<String, String> {
        let mut values = HashMap::new();
        values.insert("login.port".to_string(), LOGIN_PORT.to_string());
        values.insert("game.port".to_string(), GAME_PORT.to_string());
        values.insert("echo.port".to_string(), ECHO_PORT.to_string());
        values.insert("database.host".to_string(), "localhost".to_string());
        values.insert("database.user".to_string(), String::new());
        values.insert("database.password".to_string(), String::new());
        values.insert("scheduler.tick_ms".to_string(), "50".to_string());
        values.insert("motd".to_string(), "1\nwelcome".to_string());
        values.insert("world.name".to_string(), "Isara".to_string());
        values
    }

    /// Builds a config from built-in defaults, an optional TOML file (a
    /// missing or malformed file just logs a warning and falls back to
    /// defaults), and finally `key=value` CLI arguments layered on top.
    pub fn load<P: AsRef<Path>>(toml_path: Option<P>, cli_args: &[String], logger: &Logger) -> Config {
        let mut values = Self::defaults();

        if let Some(path) = toml_path {
            match serdeconv::from_toml_file::<HashMap<String, String>>(path.as_ref()) {
                Ok(file_values) => values.extend(file_values),
                Err(e) => {
                    slog::warn!(logger, "config file unreadable, using defaults";
                        "path" => format!("{}", path.as_ref().display()), "error" => format!("{}", e));
                }
            }
        }

        for arg in cli_args {
            if let Some((key, value)) = arg.split_once('=') {
                values.insert(key.to_string(), value.to_string());
            } else {
                slog::warn!(logger, "ignoring malformed command line override"; "arg" => arg.clone());
            }
        }

        Config { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.values.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    pub fn get_u16(&self, key: &str, default: u16) -> u16 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config { values: Self::defaults() }
    }
}
