//! Logger construction: a terminal drain built from a `sloggers` config
//! loaded through `serdeconv`. Built once in `main` and threaded
//! explicitly to every component from there on -- never a global logger.

use slog::Logger;
use sloggers::{Config as SloggersConfig, LoggerConfig};

pub fn init(level: &str) -> Logger {
    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    let config: LoggerConfig = serdeconv::from_toml_str(&toml).expect("built-in logging config is always valid");
    config.build_logger().expect("terminal drain always builds")
}
