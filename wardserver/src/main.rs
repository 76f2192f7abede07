mod config;
mod logging;

use config::Config;
use std::env;
use std::process;
use std::sync::Arc;
use wardcore::scheduler::Scheduler;
use wardcore::sizeclass::SizeClassAllocator;
use wardcore::workpool::WorkPool;
use wardcrypto::rsa::IdentityRsaDecoder;
use wardnet::driver::Driver;
use wardnet::service::ServiceRegistry;
use wardproto::{EchoProtocol, LoginProtocol};

/// Exit codes: 0 normal shutdown, 1 bind/init failure, 2 pervasive driver
/// failure caught by `main` after `Driver::run` returns early.
const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let (config_path, overrides): (Option<String>, Vec<String>) = match args.split_first() {
        Some((first, rest)) if !first.contains('=') => (Some(first.clone()), rest.to_vec()),
        _ => (None, args),
    };

    let logger = logging::init("debug");
    let config = Config::load(config_path.as_deref(), &overrides, &logger);

    // The size-class allocator is wired up here for components that want
    // fixed-size pooled allocations; per-message buffers go through plain
    // `Vec<u8>` (see wardnet::message), so it has no caller in this binary
    // yet beyond holding it ready for future protocol work.
    let _allocator = Arc::new(SizeClassAllocator::new());
    let scheduler = Scheduler::start(4096, logger.clone());

    // CPU-bound protocol work (account lookups, password hashing) has no
    // implementation yet -- the reference leaves the database query as a
    // TODO for exactly this reason -- but the pool itself is started so
    // that work is ready to land without a wiring change.
    let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).saturating_sub(1);
    let work_pool = WorkPool::new(worker_count, WorkPool::DEFAULT_CAPACITY, logger.clone());

    let mut registry = ServiceRegistry::new();
    let rsa = Arc::new(IdentityRsaDecoder);
    let world_name = config.get_or("world.name", "Isara");

    let login_port = config.get_u16("login.port", 7171);
    let game_port = config.get_u16("game.port", 7172);
    let echo_port = config.get_u16("echo.port", 7777);

    let login = Arc::new(LoginProtocol::new(rsa, world_name, 0x0100_007F, game_port));
    if registry.add_protocol(login_port, login).is_err() {
        slog::error!(logger, "failed to register login protocol"; "port" => login_port);
        process::exit(EXIT_INIT_FAILURE);
    }
    if registry.add_protocol(echo_port, Arc::new(EchoProtocol)).is_err() {
        slog::error!(logger, "failed to register echo protocol"; "port" => echo_port);
        process::exit(EXIT_INIT_FAILURE);
    }

    let registry = Arc::new(registry);
    let mut driver = match Driver::new(Arc::clone(&registry), Arc::clone(&scheduler), logger.clone()) {
        Ok(d) => d,
        Err(e) => {
            slog::error!(logger, "failed to bind listening services"; "error" => format!("{}", e));
            process::exit(EXIT_INIT_FAILURE);
        }
    };

    slog::info!(logger, "server starting";
        "login_port" => login_port, "game_port" => game_port, "echo_port" => echo_port);
    driver.run();

    scheduler.shutdown();
    work_pool.shutdown();
    slog::info!(logger, "server stopped");
    process::exit(EXIT_OK);
}
