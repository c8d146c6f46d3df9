// agent/src/main.rs

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::net::UnixListener;

mod config;
mod error;
mod registry;
mod server;
mod sys;
#[cfg(test)]
mod testutil;

use crate::config::AgentConfig;
use crate::registry::FileRegistry;
use crate::server::ArborAgentService;
use crate::sys::exec::SystemCommandExecutor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment
    // ==============================================================================

    // Initialize structured logging
    tracing_subscriber::fmt::init();
    let config = AgentConfig::load();

    // 🛡️ Privilege check: useradd/nginx/certbot all require root, and a
    // partially-privileged agent would fail halfway through sequences
    // instead of at the door.
    if !nix::unistd::geteuid().is_root() {
        return Err("SECURITY FATAL: the agent must run as root".into());
    }

    // ==============================================================================
    // 2. Secure Socket Initialization
    // ==============================================================================

    let socket_path = &config.socket_path;
    if let Some(socket_dir) = socket_path.parent() {
        if !socket_dir.exists() {
            fs::create_dir_all(socket_dir)?;
        }
    }

    // Clean up a stale socket file from a previous crash/run
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    // 🛡️ SECURITY BOUNDARY: 0o660 (rw-rw----) lets the root owner and the
    // control-plane API group talk to the agent while denying every other
    // account on the machine. Peer credentials are checked again per
    // connection.
    let mut perms = fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o660);
    fs::set_permissions(socket_path, perms)?;

    // ==============================================================================
    // 3. Dependency Injection & Accept Loop
    // ==============================================================================

    let registry = Arc::new(FileRegistry::open(config.state_file.clone()).await?);
    let executor = Arc::new(SystemCommandExecutor);
    let service = Arc::new(ArborAgentService::new(
        config.clone(),
        registry,
        executor,
    ));

    tracing::info!(socket = %socket_path.display(), "⚙️ Arbor host agent listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let service = Arc::clone(&service);
        let expected_api_uid = config.expected_api_uid;
        // One task per connection: provisioning sequences block for seconds
        // and must never hold up the accept loop.
        tokio::spawn(async move {
            server::handle_connection(service, stream, expected_api_uid).await;
        });
    }
}
