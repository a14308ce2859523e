// Process-wide tracing setup. Every component logs through `tracing`
// (`target: "crypto::..."`, `"protocol::..."`, `"transfer"`, `"facade"`);
// this installs the one subscriber that turns those spans into output.
// Idempotent: a second call after the first is a silent no-op rather than a
// panic, since `MessengerCore::start` may run more than once in a test
// process.

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
