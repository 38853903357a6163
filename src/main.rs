use std::process;

use tracing::{debug, error, info, warn};

use rootcloak::capabilities;
use rootcloak::cli::parse_spawner_pid;
use rootcloak::logging::init_logging;
use rootcloak::metrics;
use rootcloak::{AppDetector, ForkTracer, NamespaceConcealer, PolicyStore, Procfs, Ptrace, TracerConfig};

fn main() {
    // 1. Configuration first, so the log format is known
    let (config, config_error) = TracerConfig::load();
    if let Err(e) = init_logging(config.log_format) {
        eprintln!("failed to initialize logging: {}", e);
    }
    if let Some(e) = config_error {
        warn!(error = %e, "using default configuration");
    }

    // 2. Spawner pid
    let spawner = match parse_spawner_pid(std::env::args_os()) {
        Ok(pid) => pid,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    capabilities::preflight();

    // 3. Wire up the tracer
    let detector = AppDetector::new(
        PolicyStore::new(&config.policy_path),
        Procfs::new(&config.proc_root),
        NamespaceConcealer::new(&config.proc_root),
    );
    let mut tracer = ForkTracer::new(Ptrace::new(&config), detector, spawner);

    // 4. Trace until the spawner goes away
    match tracer.run() {
        Ok(summary) => {
            info!(
                events = summary.events,
                forks = summary.spawner_forks,
                identified = summary.identified,
                concealed = summary.concealed,
                detached = summary.lineages_detached,
                reason = ?summary.stop_reason,
                "tracer finished"
            );
            debug!(metrics = %metrics::render(), "final metrics");
        }
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}
